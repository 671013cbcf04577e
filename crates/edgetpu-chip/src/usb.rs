//! USB identifiers, endpoint layout and control-request encoding.
//!
//! The accelerator enumerates twice over its lifetime: first as a bare DFU
//! device waiting for firmware, then (after the firmware is flashed and the
//! bus is reset) as the Edge TPU proper with a vendor-specific interface.

// ── Device identity ──────────────────────────────────────────────────────────

/// Edge TPU in application mode.
pub const EDGETPU_VID: u16 = 0x18D1;
/// Edge TPU in application mode.
pub const EDGETPU_PID: u16 = 0x9302;

/// Accelerator waiting for firmware (DFU mode).
pub const DFU_VID: u16 = 0x1A6E;
/// Accelerator waiting for firmware (DFU mode).
pub const DFU_PID: u16 = 0x089A;

/// Interface class of the Edge TPU data interface.
pub const EDGETPU_CLASS: u8 = 0xFF;
/// Interface subclass of the Edge TPU data interface.
pub const EDGETPU_SUBCLASS: u8 = 0xFF;

/// Application-specific class code used by DFU interfaces.
pub const DFU_CLASS: u8 = 0xFE;
/// DFU subclass.
pub const DFU_SUBCLASS: u8 = 0x01;

/// Format a `vid:pid` pair the way `lsusb -d` expects it.
#[must_use]
pub fn lsusb_filter(vid: u16, pid: u16) -> String {
    format!("{vid:04x}:{pid:04x}")
}

// ── Endpoints ────────────────────────────────────────────────────────────────

/// Endpoints exposed by the Edge TPU interface.
pub const ENDPOINT_COUNT: usize = 6;
/// Bulk-out endpoints among them.
pub const BULK_OUT_ENDPOINT_COUNT: usize = 3;
/// Bulk-in endpoints among them.
pub const BULK_IN_ENDPOINT_COUNT: usize = 2;
/// Interrupt-in endpoints among them.
pub const INTERRUPT_IN_ENDPOINT_COUNT: usize = 1;

/// Max packet size forced on bulk-out pipes (hardware limit).
pub const BULK_OUT_PACKET_SIZE: u16 = 512;
/// Max packet size forced on bulk-in pipes.
pub const BULK_IN_PACKET_SIZE: u16 = 256;

/// Endpoint numbers used by the streaming protocol.
pub mod endpoint {
    /// Single bulk-out endpoint carrying every descriptor tag. Its IN twin
    /// returns output activations.
    pub const SINGLE_BULK_OUT: u8 = 1;
    /// Bulk-in endpoint carrying 16-byte completion events.
    pub const EVENT_IN: u8 = 2;
    /// Interrupt-in endpoint. May be unavailable on constrained controllers.
    pub const INTERRUPT_IN: u8 = 3;

    /// Direction bit of a `bEndpointAddress`.
    pub const DIR_IN: u8 = 0x80;
    /// Endpoint number mask of a `bEndpointAddress`.
    pub const NUMBER_MASK: u8 = 0x0F;

    /// Build an IN endpoint address from its number.
    #[must_use]
    pub const fn in_address(number: u8) -> u8 {
        DIR_IN | (number & NUMBER_MASK)
    }

    /// Build an OUT endpoint address from its number.
    #[must_use]
    pub const fn out_address(number: u8) -> u8 {
        number & NUMBER_MASK
    }
}

// ── Control requests ─────────────────────────────────────────────────────────

/// `bmRequestType` bit definitions.
pub mod request_type {
    /// Device-to-host.
    pub const DIR_IN: u8 = 0x80;
    /// Host-to-device.
    pub const DIR_OUT: u8 = 0x00;
    /// Standard request.
    pub const TYPE_STANDARD: u8 = 0x00;
    /// Class request.
    pub const TYPE_CLASS: u8 = 0x20;
    /// Vendor request.
    pub const TYPE_VENDOR: u8 = 0x40;
    /// Addressed to the device.
    pub const RECIPIENT_DEVICE: u8 = 0x00;
    /// Addressed to an interface.
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
}

/// Standard `SET_INTERFACE` request code.
pub const SET_INTERFACE: u8 = 0x0B;

/// Transfer direction relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device-to-host (read).
    In,
    /// Host-to-device (write).
    Out,
}

/// An 8-byte USB SETUP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SetupPacket {
    /// `bmRequestType`.
    pub request_type: u8,
    /// `bRequest`.
    pub request: u8,
    /// `wValue`.
    pub value: u16,
    /// `wIndex`.
    pub index: u16,
    /// `wLength`.
    pub length: u16,
}

impl SetupPacket {
    /// Direction encoded in `bmRequestType`.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        if self.request_type & request_type::DIR_IN == 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }

    /// Little-endian wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.request_type;
        out[1] = self.request;
        out[2..4].copy_from_slice(&self.value.to_le_bytes());
        out[4..6].copy_from_slice(&self.index.to_le_bytes());
        out[6..8].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// Register access width selected by `bRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterWidth {
    /// 32-bit access: `bRequest = 1`, `wLength = 4`.
    Bits32,
    /// 64-bit access: `bRequest = 0`, `wLength = 8`.
    Bits64,
}

impl RegisterWidth {
    /// `bRequest` carrying this width.
    #[must_use]
    pub const fn request(self) -> u8 {
        match self {
            Self::Bits32 => 1,
            Self::Bits64 => 0,
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub const fn len(self) -> u16 {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }
}

/// Encode a CSR access as a vendor, device-recipient control request.
///
/// The offset is truncated to 32 bits: `wValue` carries bits 0..16 and
/// `wIndex` bits 16..32.
#[must_use]
pub const fn csr_setup(offset: u64, width: RegisterWidth, direction: Direction) -> SetupPacket {
    let dir = match direction {
        Direction::In => request_type::DIR_IN,
        Direction::Out => request_type::DIR_OUT,
    };
    SetupPacket {
        request_type: dir | request_type::TYPE_VENDOR | request_type::RECIPIENT_DEVICE,
        request: width.request(),
        value: (offset & 0xFFFF) as u16,
        index: ((offset >> 16) & 0xFFFF) as u16,
        length: width.len(),
    }
}

/// Recover the 32-bit register offset from a CSR setup packet.
#[must_use]
pub const fn csr_offset(setup: &SetupPacket) -> u64 {
    ((setup.index as u64) << 16) | setup.value as u64
}

/// Standard `SET_INTERFACE` request.
#[must_use]
pub const fn set_interface_setup(interface: u16, alternate_setting: u16) -> SetupPacket {
    SetupPacket {
        request_type: request_type::DIR_OUT
            | request_type::TYPE_STANDARD
            | request_type::RECIPIENT_INTERFACE,
        request: SET_INTERFACE,
        value: alternate_setting,
        index: interface,
        length: 0,
    }
}

// ── DFU class ────────────────────────────────────────────────────────────────

/// USB DFU 1.1 class requests and constants.
pub mod dfu {
    use super::{request_type, SetupPacket};

    /// `DFU_DETACH`.
    pub const DETACH: u8 = 0;
    /// `DFU_DNLOAD`.
    pub const DNLOAD: u8 = 1;
    /// `DFU_UPLOAD`.
    pub const UPLOAD: u8 = 2;
    /// `DFU_GETSTATUS`.
    pub const GETSTATUS: u8 = 3;
    /// `DFU_CLRSTATUS`.
    pub const CLRSTATUS: u8 = 4;
    /// `DFU_GETSTATE`.
    pub const GETSTATE: u8 = 5;
    /// `DFU_ABORT`.
    pub const ABORT: u8 = 6;

    /// Block size used for both download and upload.
    pub const TRANSFER_UNIT: usize = 256;
    /// `wTimeout` passed with `DFU_DETACH`.
    pub const DETACH_TIMEOUT_MS: u16 = 1000;
    /// Length of a `DFU_GETSTATUS` reply.
    pub const STATUS_LEN: u16 = 6;

    /// Host-to-device class request on `interface`.
    #[must_use]
    pub const fn out_setup(request: u8, value: u16, interface: u16, length: u16) -> SetupPacket {
        SetupPacket {
            request_type: request_type::DIR_OUT
                | request_type::TYPE_CLASS
                | request_type::RECIPIENT_INTERFACE,
            request,
            value,
            index: interface,
            length,
        }
    }

    /// Device-to-host class request on `interface`.
    #[must_use]
    pub const fn in_setup(request: u8, value: u16, interface: u16, length: u16) -> SetupPacket {
        SetupPacket {
            request_type: request_type::DIR_IN
                | request_type::TYPE_CLASS
                | request_type::RECIPIENT_INTERFACE,
            request,
            value,
            index: interface,
            length,
        }
    }

    /// Reply to `DFU_GETSTATUS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusRecord {
        /// `bStatus` (0 = OK).
        pub status: u8,
        /// `bwPollTimeout`, 24-bit milliseconds.
        pub poll_timeout_ms: u32,
        /// `bState`.
        pub state: u8,
        /// `iString`.
        pub string_index: u8,
    }

    impl StatusRecord {
        /// Decode from the 6-byte reply. Returns `None` when short.
        #[must_use]
        pub fn parse(bytes: &[u8]) -> Option<Self> {
            if bytes.len() < usize::from(STATUS_LEN) {
                return None;
            }
            Some(Self {
                status: bytes[0],
                poll_timeout_ms: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], 0]),
                state: bytes[4],
                string_index: bytes[5],
            })
        }

        /// Encode into the 6-byte reply.
        #[must_use]
        pub fn to_bytes(&self) -> [u8; 6] {
            let t = self.poll_timeout_ms.to_le_bytes();
            [self.status, t[0], t[1], t[2], self.state, self.string_index]
        }
    }
}
