//! Byte layouts exchanged on the bulk pipes.
//!
//! ## Streaming header
//!
//! Every payload sent on the single bulk-out endpoint is preceded by an
//! 8-byte header transferred on its own:
//!
//! ```text
//! byte  0..4   payload length (u32, little endian)
//! byte  4      descriptor tag in the low nibble
//! byte  5..8   zero
//! ```
//!
//! Payloads larger than [`MAX_BULK_CHUNK`] are split into several bulk
//! transfers after the one header.
//!
//! ## Event record
//!
//! After the last output the chip reports completion on the event endpoint:
//!
//! ```text
//! byte  0..8   address (u64, little endian)
//! byte  8..12  length (u32, little endian)
//! byte  12     tag in the low nibble
//! byte  13..16 reserved
//! ```

use std::fmt;

/// Streaming header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Event record size in bytes.
pub const EVENT_SIZE: usize = 16;

/// Largest single bulk transfer issued by the streaming protocol.
pub const MAX_BULK_CHUNK: usize = 32 * 1024;

/// Descriptor tag carried in the streaming header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DescriptorTag {
    /// Instruction bitstream chunk.
    Instructions = 0,
    /// Input activations.
    InputActivations = 1,
    /// Model parameters.
    Parameters = 2,
    /// Output activations.
    OutputActivations = 3,
    /// Interrupt 0.
    Interrupt0 = 4,
    /// Interrupt 1.
    Interrupt1 = 5,
    /// Interrupt 2.
    Interrupt2 = 6,
    /// Interrupt 3.
    Interrupt3 = 7,
}

impl DescriptorTag {
    /// Every tag, by value.
    pub const ALL: [Self; 8] = [
        Self::Instructions,
        Self::InputActivations,
        Self::Parameters,
        Self::OutputActivations,
        Self::Interrupt0,
        Self::Interrupt1,
        Self::Interrupt2,
        Self::Interrupt3,
    ];

    /// Raw tag value.
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// Decode the low nibble of a tag byte.
    #[must_use]
    pub const fn from_nibble(byte: u8) -> Option<Self> {
        match byte & 0xF {
            0 => Some(Self::Instructions),
            1 => Some(Self::InputActivations),
            2 => Some(Self::Parameters),
            3 => Some(Self::OutputActivations),
            4 => Some(Self::Interrupt0),
            5 => Some(Self::Interrupt1),
            6 => Some(Self::Interrupt2),
            7 => Some(Self::Interrupt3),
            _ => None,
        }
    }
}

impl fmt::Display for DescriptorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Instructions => "instructions",
            Self::InputActivations => "input-activations",
            Self::Parameters => "parameters",
            Self::OutputActivations => "output-activations",
            Self::Interrupt0 => "interrupt0",
            Self::Interrupt1 => "interrupt1",
            Self::Interrupt2 => "interrupt2",
            Self::Interrupt3 => "interrupt3",
        };
        f.write_str(name)
    }
}

/// Header preceding a streamed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Payload length in bytes.
    pub length: u32,
    /// Descriptor tag.
    pub tag: DescriptorTag,
}

impl StreamHeader {
    /// Header for a payload.
    #[must_use]
    pub const fn new(tag: DescriptorTag, length: u32) -> Self {
        Self { length, tag }
    }

    /// Wire bytes.
    #[must_use]
    pub const fn encode(&self) -> [u8; HEADER_SIZE] {
        let len = self.length.to_le_bytes();
        [len[0], len[1], len[2], len[3], self.tag.value() & 0xF, 0, 0, 0]
    }

    /// Parse wire bytes. Returns `None` on short input or an unknown tag.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let header: &[u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let tag = DescriptorTag::from_nibble(header[4])?;
        Some(Self { length, tag })
    }
}

/// Completion event reported on the event endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventRecord {
    /// Device address the event refers to.
    pub address: u64,
    /// Byte count.
    pub length: u32,
    /// Tag nibble.
    pub tag: u8,
}

impl EventRecord {
    /// Parse wire bytes. Only the low nibble of the tag byte is kept.
    #[must_use]
    pub fn decode(bytes: &[u8; EVENT_SIZE]) -> Self {
        let mut address = [0u8; 8];
        address.copy_from_slice(&bytes[0..8]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&bytes[8..12]);
        Self {
            address: u64::from_le_bytes(address),
            length: u32::from_le_bytes(length),
            tag: bytes[12] & 0xF,
        }
    }

    /// Wire bytes, reserved bytes zeroed.
    #[must_use]
    pub fn encode(&self) -> [u8; EVENT_SIZE] {
        let mut out = [0u8; EVENT_SIZE];
        out[0..8].copy_from_slice(&self.address.to_le_bytes());
        out[8..12].copy_from_slice(&self.length.to_le_bytes());
        out[12] = self.tag & 0xF;
        out
    }
}

/// Number of bulk transfers a payload of `len` bytes is split into.
#[must_use]
pub const fn chunk_count(len: usize) -> usize {
    len.div_ceil(MAX_BULK_CHUNK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_for_every_tag() {
        for tag in DescriptorTag::ALL {
            let bytes = StreamHeader::new(tag, 0x0102_0304).encode();
            assert_eq!(&bytes[..4], &[0x04, 0x03, 0x02, 0x01]);
            assert_eq!(bytes[4], tag.value());
            assert_eq!(&bytes[5..], &[0, 0, 0]);
            assert_eq!(StreamHeader::decode(&bytes), Some(StreamHeader::new(tag, 0x0102_0304)));
        }
    }

    #[test]
    fn test_header_decode_masks_high_nibble() {
        let bytes = [16, 0, 0, 0, 0xF2, 0, 0, 0];
        let header = StreamHeader::decode(&bytes).unwrap();
        assert_eq!(header.tag, DescriptorTag::Parameters);
        assert_eq!(header.length, 16);
        assert!(StreamHeader::decode(&bytes[..7]).is_none());
        assert!(StreamHeader::decode(&[0, 0, 0, 0, 0x8, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_event_decode() {
        let mut bytes = [0u8; EVENT_SIZE];
        bytes[0] = 0x10;
        bytes[7] = 0x80;
        bytes[8] = 0x40;
        bytes[12] = 0xA4;
        bytes[13] = 0xFF;
        let event = EventRecord::decode(&bytes);
        assert_eq!(event.address, 0x8000_0000_0000_0010);
        assert_eq!(event.length, 0x40);
        assert_eq!(event.tag, 4);
        let mut expected = bytes;
        expected[12] = 4;
        expected[13] = 0;
        assert_eq!(event.encode(), expected);
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(MAX_BULK_CHUNK), 1);
        assert_eq!(chunk_count(MAX_BULK_CHUNK + 1), 2);
        assert_eq!(chunk_count(100_000), 4);
    }
}
