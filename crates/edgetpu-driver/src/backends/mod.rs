//! Transport backends
//!
//! Two backends available:
//! - **Software**: an in-process device model behind a worker thread. Used
//!   for CI and for running the whole stack without an accelerator.
//! - **USB**: libusb through `rusb` (feature `usb`), for real hardware in
//!   either its application or its DFU personality.

pub mod software;
#[cfg(feature = "usb")]
pub mod usb;
mod worker;

pub use software::{
    dfu_configuration, edgetpu_configuration, CsrAccess, DeviceModel, SimulatedBeagle,
    SimulatedDfuDevice, SimulatedPlug, SoftwareHost, SoftwareTransport,
};
#[cfg(feature = "usb")]
pub use usb::{enumerate, LibusbHost, LibusbTransport, UsbDevice, UsbDeviceKind};
