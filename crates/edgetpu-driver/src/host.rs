//! USB host seam used by the attach and DFU tasks.
//!
//! The host controller owns enumeration. It reports what it sees as
//! [`HostEvent`]s and, on request, opens a class driver for an interface
//! (yielding a [`UsbTransport`]), closes it again, or resets the bus.

use std::sync::Arc;

use crate::error::Result;
use crate::transport::{EndpointDescriptor, UsbTransport};

/// One interface of the active configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Device vendor id
    pub vendor_id: u16,
    /// Device product id
    pub product_id: u16,
    /// `bInterfaceNumber`
    pub number: u8,
    /// `bInterfaceClass`
    pub class: u8,
    /// `bInterfaceSubClass`
    pub subclass: u8,
    /// Endpoints, in descriptor order
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceInfo {
    /// True if the interface has the given class and subclass.
    #[must_use]
    pub const fn matches(&self, class: u8, subclass: u8) -> bool {
        self.class == class && self.subclass == subclass
    }
}

/// Notifications from the host controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A device appeared; carries every interface of its configuration
    Attach(Vec<InterfaceInfo>),
    /// Enumeration of the attached device finished
    EnumerationDone,
    /// The device went away
    Detach,
    /// The host reported a failed transfer
    TransferFailed {
        /// Host status description
        reason: String,
    },
}

/// Host-controller operations the tasks need.
pub trait UsbHost: Send + Sync {
    /// Open the class driver for `interface`.
    ///
    /// # Errors
    ///
    /// Returns error if the interface cannot be claimed.
    fn open_class(&self, interface: &InterfaceInfo) -> Result<Arc<dyn UsbTransport>>;

    /// Release the class driver opened for `interface`.
    fn close_class(&self, interface: &InterfaceInfo);

    /// Reset the bus the device sits on.
    ///
    /// # Errors
    ///
    /// Returns error if the reset is rejected.
    fn reset_bus(&self) -> Result<()>;

    /// Ask the host to enumerate the device again.
    ///
    /// # Errors
    ///
    /// Returns error if the request is rejected.
    fn request_reenumeration(&self) -> Result<()>;
}

/// First interface in `interfaces` with the given class and subclass.
#[must_use]
pub fn find_interface(interfaces: &[InterfaceInfo], class: u8, subclass: u8) -> Option<&InterfaceInfo> {
    interfaces.iter().find(|i| i.matches(class, subclass))
}
