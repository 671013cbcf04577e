//! libusb backend (feature `usb`)
//!
//! [`enumerate`] lists accelerators in either personality. A [`LibusbHost`]
//! claims an interface on one of them and hands out a [`LibusbTransport`],
//! whose worker thread runs blocking libusb transfers and invokes the
//! completions.
//!
//! libusb performs enumeration itself, so the host events a task expects
//! are synthesized by [`UsbDevice::attach_events`].

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use edgetpu_chip::usb::{self as ids, endpoint, Direction, SetupPacket};
use rusb::{Context, Device, DeviceHandle, TransferType, UsbContext};
use tracing::{debug, info, warn};

use super::worker::{Job, Worker};
use crate::config::DriverConfig;
use crate::error::{EdgeTpuError, Result};
use crate::host::{HostEvent, InterfaceInfo, UsbHost};
use crate::transport::{Completion, EndpointDescriptor, EndpointKind, TransportType, UsbTransport};

fn usb_error(op: &str, error: rusb::Error, timeout: Duration) -> EdgeTpuError {
    match error {
        rusb::Error::Timeout => EdgeTpuError::timeout(timeout),
        other => EdgeTpuError::transfer_failed(format!("{op}: {other}")),
    }
}

fn libusb_error(op: &str, error: rusb::Error) -> EdgeTpuError {
    EdgeTpuError::transfer_failed(format!("{op}: {error}"))
}

// ── Discovery ───────────────────────────────────────────────────────────────

/// Personality a device enumerated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbDeviceKind {
    /// Application firmware running (`18d1:9302`)
    Application,
    /// Bootloader waiting for firmware (`1a6e:089a`)
    Dfu,
}

/// An accelerator found on the bus.
#[derive(Debug, Clone)]
pub struct UsbDevice {
    /// Personality
    pub kind: UsbDeviceKind,
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
    /// Vendor id
    pub vendor_id: u16,
    /// Product id
    pub product_id: u16,
    device: Device<Context>,
}

impl UsbDevice {
    /// Interfaces of the active configuration (alternate setting 0).
    ///
    /// # Errors
    ///
    /// Returns error if the configuration descriptor cannot be read.
    pub fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(|e| libusb_error("config descriptor", e))?;
        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            for alt in interface.descriptors().filter(|d| d.setting_number() == 0) {
                let endpoints = alt
                    .endpoint_descriptors()
                    .filter_map(|ep| {
                        let kind = match (ep.transfer_type(), ep.direction()) {
                            (TransferType::Bulk, rusb::Direction::Out) => EndpointKind::BulkOut,
                            (TransferType::Bulk, rusb::Direction::In) => EndpointKind::BulkIn,
                            (TransferType::Interrupt, rusb::Direction::In) => EndpointKind::InterruptIn,
                            _ => return None,
                        };
                        Some(EndpointDescriptor {
                            address: ep.address(),
                            kind,
                            max_packet_size: ep.max_packet_size(),
                        })
                    })
                    .collect();
                interfaces.push(InterfaceInfo {
                    vendor_id: self.vendor_id,
                    product_id: self.product_id,
                    number: alt.interface_number(),
                    class: alt.class_code(),
                    subclass: alt.sub_class_code(),
                    endpoints,
                });
            }
        }
        Ok(interfaces)
    }

    /// The events a host controller would report for this device having
    /// just attached.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration descriptor cannot be read.
    pub fn attach_events(&self) -> Result<Vec<HostEvent>> {
        Ok(vec![HostEvent::Attach(self.interfaces()?), HostEvent::EnumerationDone])
    }
}

impl fmt::Display for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: {:04x}:{:04x} ({:?})",
            self.bus, self.address, self.vendor_id, self.product_id, self.kind
        )
    }
}

/// Every Edge TPU on the system, in either personality.
///
/// # Errors
///
/// Returns error if libusb cannot be initialized or the device list read.
pub fn enumerate() -> Result<Vec<UsbDevice>> {
    let context = Context::new().map_err(|e| libusb_error("libusb init", e))?;
    let devices = context.devices().map_err(|e| libusb_error("device list", e))?;
    let mut found = Vec::new();
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        let kind = match (descriptor.vendor_id(), descriptor.product_id()) {
            (ids::EDGETPU_VID, ids::EDGETPU_PID) => UsbDeviceKind::Application,
            (ids::DFU_VID, ids::DFU_PID) => UsbDeviceKind::Dfu,
            _ => continue,
        };
        let found_device = UsbDevice {
            kind,
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            device,
        };
        debug!("Found {}", found_device);
        found.push(found_device);
    }
    info!("Found {} Edge TPU device(s)", found.len());
    Ok(found)
}

// ── Transport ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    control: Duration,
    bulk: Duration,
    event: Duration,
}

fn read_control(handle: &DeviceHandle<Context>, setup: SetupPacket, timeout: Duration) -> rusb::Result<Bytes> {
    let mut buf = vec![0u8; usize::from(setup.length)];
    let n = handle.read_control(
        setup.request_type,
        setup.request,
        setup.value,
        setup.index,
        &mut buf,
        timeout,
    )?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

fn run_job(handle: &DeviceHandle<Context>, timeouts: Timeouts, job: Job) {
    match job {
        Job::Control { setup, data, done } => {
            let result = match setup.direction() {
                Direction::In => read_control(handle, setup, timeouts.control),
                Direction::Out => handle
                    .write_control(
                        setup.request_type,
                        setup.request,
                        setup.value,
                        setup.index,
                        &data,
                        timeouts.control,
                    )
                    .map(|_| Bytes::new()),
            };
            done(result.map_err(|e| usb_error("control transfer", e, timeouts.control)));
        }
        Job::BulkOut {
            endpoint: address,
            data,
            done,
        } => {
            let result = handle.write_bulk(address, &data, timeouts.bulk);
            done(result.map_err(|e| usb_error("bulk-out", e, timeouts.bulk)));
        }
        Job::BulkIn {
            endpoint: address,
            length,
            done,
        } => {
            let timeout = if address == endpoint::in_address(endpoint::EVENT_IN) {
                timeouts.event
            } else {
                timeouts.bulk
            };
            let mut buf = vec![0u8; length];
            let result = handle.read_bulk(address, &mut buf, timeout).map(|n| {
                buf.truncate(n);
                Bytes::from(buf)
            });
            done(result.map_err(|e| usb_error("bulk-in", e, timeout)));
        }
    }
}

/// [`UsbTransport`] over a claimed libusb interface.
pub struct LibusbTransport {
    handle: Arc<DeviceHandle<Context>>,
    interface: u8,
    worker: Worker,
}

impl LibusbTransport {
    /// Transport for `interface`, already claimed on `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::Resource`] if the worker thread cannot start.
    pub fn new(handle: Arc<DeviceHandle<Context>>, interface: u8, config: &DriverConfig) -> Result<Self> {
        let timeouts = Timeouts {
            control: config.control_timeout,
            bulk: config.bulk_timeout,
            event: config.event_timeout,
        };
        let worker = {
            let handle = Arc::clone(&handle);
            Worker::spawn("edgetpu-usb", move |job| run_job(&handle, timeouts, job))?
        };
        Ok(Self {
            handle,
            interface,
            worker,
        })
    }
}

impl UsbTransport for LibusbTransport {
    fn open_pipe(&self, descriptor: &EndpointDescriptor) -> Result<()> {
        self.handle
            .clear_halt(descriptor.address)
            .map_err(|e| EdgeTpuError::endpoint_unavailable(descriptor.address, e.to_string()))
    }

    fn submit_control(&self, setup: SetupPacket, data: Bytes, done: Completion<Bytes>) -> Result<()> {
        self.worker.submit(Job::Control { setup, data, done })
    }

    fn submit_bulk_out(&self, address: u8, data: Bytes, done: Completion<usize>) -> Result<()> {
        self.worker.submit(Job::BulkOut {
            endpoint: address,
            data,
            done,
        })
    }

    fn submit_bulk_in(&self, address: u8, length: usize, done: Completion<Bytes>) -> Result<()> {
        self.worker.submit(Job::BulkIn {
            endpoint: address,
            length,
            done,
        })
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Usb
    }
}

impl fmt::Debug for LibusbTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibusbTransport")
            .field("interface", &self.interface)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

// ── Host ────────────────────────────────────────────────────────────────────

/// [`UsbHost`] for one enumerated device.
pub struct LibusbHost {
    device: UsbDevice,
    config: DriverConfig,
    handle: Mutex<Option<Arc<DeviceHandle<Context>>>>,
}

impl LibusbHost {
    /// Host operations on `device`.
    pub fn new(device: UsbDevice, config: DriverConfig) -> Self {
        Self {
            device,
            config,
            handle: Mutex::new(None),
        }
    }

    /// The device this host drives.
    pub const fn device(&self) -> &UsbDevice {
        &self.device
    }

    fn handle(&self) -> Result<Arc<DeviceHandle<Context>>> {
        let mut slot = self
            .handle
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("libusb handle"))?;
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }
        let mut handle = self
            .device
            .device
            .open()
            .map_err(|e| libusb_error("open", e))?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }
        let handle = Arc::new(handle);
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }
}

impl fmt::Debug for LibusbHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibusbHost")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl UsbHost for LibusbHost {
    fn open_class(&self, interface: &InterfaceInfo) -> Result<Arc<dyn UsbTransport>> {
        let handle = self.handle()?;
        handle
            .claim_interface(interface.number)
            .map_err(|e| libusb_error("claim interface", e))?;
        info!("Claimed interface {} on {}", interface.number, self.device);
        let transport = LibusbTransport::new(handle, interface.number, &self.config)?;
        Ok(Arc::new(transport))
    }

    fn close_class(&self, interface: &InterfaceInfo) {
        let Ok(mut slot) = self.handle.lock() else {
            warn!("libusb handle lock poisoned; interface {} left claimed", interface.number);
            return;
        };
        if let Some(handle) = slot.take() {
            if let Err(e) = handle.release_interface(interface.number) {
                warn!("Releasing interface {}: {}", interface.number, e);
            }
        }
    }

    fn reset_bus(&self) -> Result<()> {
        self.handle()?.reset().map_err(|e| libusb_error("reset", e))
    }

    fn request_reenumeration(&self) -> Result<()> {
        // The next open sees the device as it enumerates after the reset.
        self.handle
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("libusb handle"))?
            .take();
        Ok(())
    }
}
