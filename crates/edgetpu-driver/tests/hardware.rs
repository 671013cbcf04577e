//! Tests against a real accelerator on the USB bus

#![cfg(feature = "usb")]

use std::sync::Arc;
use std::time::Duration;

use edgetpu_driver::backends::{enumerate, LibusbHost, UsbDeviceKind};
use edgetpu_driver::{DriverConfig, Manager, PerformanceMode};

#[test]
#[ignore] // Requires hardware
fn test_open_and_read_temperature() {
    let device = enumerate()
        .expect("USB enumeration")
        .into_iter()
        .find(|d| d.kind == UsbDeviceKind::Application)
        .expect("no Edge TPU in application mode");
    let events = device.attach_events().expect("configuration descriptor");

    let config = DriverConfig::default().with_open_timeout(Duration::from_secs(5));
    let host = Arc::new(LibusbHost::new(device, config.clone()));
    let manager = Manager::new(host, config).expect("manager");
    for event in events {
        manager.attach().post_host_event(event).expect("attach task");
    }

    let context = manager.open_device(PerformanceMode::High).expect("bring-up");
    let celsius = manager.temperature().expect("temperature");
    println!("{} at {celsius:.1} °C", context.mode());
    assert!((-40.0..125.0).contains(&celsius));
}
