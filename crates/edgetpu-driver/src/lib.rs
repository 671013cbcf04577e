//! Host-side USB driver for the Edge TPU ("Beagle").
//!
//! Everything between a USB host controller and a compiled model: the
//! register protocol, chip bring-up, the bulk streaming protocol, the
//! executable interpreter and firmware download.
//!
//! # Layers
//!
//! ```text
//! Manager ──── packages, parameter cache, device lifetime
//!   │  AttachTask ── host events → connected transport, power refcount
//!   │  DfuTask ───── firmware download + readback verification
//!   ▼
//! TpuDriver
//!   ├── BringUp ─────── power, clocks, run control, temperature
//!   │     └── CsrChannel ── vendor control requests (32/64-bit)
//!   └── LoadedExecutable ── DMA hints → BulkStream (header + payload)
//!                 ▼
//!           UsbTransport ── SoftwareTransport | LibusbTransport (feature `usb`)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use edgetpu_driver::backends::{SimulatedBeagle, SoftwareTransport};
//! use edgetpu_driver::{DriverConfig, PerformanceMode, TpuDriver};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(SoftwareTransport::new(SimulatedBeagle::new())?);
//! let driver = TpuDriver::open(transport, PerformanceMode::High, DriverConfig::default())?;
//! println!("die temperature: {:.1} °C", driver.temperature()?);
//! # Ok(())
//! # }
//! ```
//!
//! # Wire summary
//!
//! | Traffic | Pipe | Format |
//! |---------|------|--------|
//! | Register read/write | control | vendor request, `bRequest` 0 (64-bit) / 1 (32-bit) |
//! | Instructions, inputs, parameters | bulk-out 1 | 8-byte header, then payload in ≤32 KiB chunks |
//! | Outputs | bulk-in 1 | raw |
//! | Completion events | bulk-in 2 | 16 bytes |
//! | Firmware | control | DFU class requests, 256-byte blocks |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod bringup;
mod config;
mod csr;
pub mod dfu;
mod driver;
mod error;
mod executable;
mod host;
mod manager;
mod stream;
pub mod task;
mod transport;

pub use bringup::BringUp;
pub use config::DriverConfig;
pub use csr::{CsrChannel, RegisterAccess};
pub use dfu::{DfuHandle, DfuReport, DfuState, DfuTask};
pub use driver::TpuDriver;
pub use edgetpu_chip::{ChipConfig, EventRecord, PerformanceMode, RunControl};
pub use error::{EdgeTpuError, Result};
pub use executable::LoadedExecutable;
pub use host::{find_interface, HostEvent, InterfaceInfo, UsbHost};
pub use manager::{DeviceContext, Manager, PackageId, NO_DEVICE_TEMPERATURE};
pub use stream::{BulkStream, DataStream};
pub use task::{AlwaysOn, AttachHandle, AttachState, AttachTask, ConnectionListener, PowerControl};
pub use transport::{
    Completion, CompletionChannel, EndpointDescriptor, EndpointKind, Pipe, PipeSet, TransportType,
    UsbTransport,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        DeviceContext, DfuTask, DriverConfig, EdgeTpuError, HostEvent, LoadedExecutable, Manager,
        PerformanceMode, Result, TpuDriver, UsbHost, UsbTransport,
    };
}
