//! Streaming protocol on the bulk pipes
//!
//! Everything host-to-device travels on the single bulk-out endpoint as an
//! 8-byte [`StreamHeader`] transfer followed by the payload, split into
//! transfers of at most `max_bulk_chunk` bytes. Outputs come back on bulk-in
//! 1; completion events (16 bytes each) on bulk-in 2.

use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use edgetpu_chip::usb::endpoint;
use edgetpu_chip::wire::{EVENT_SIZE, HEADER_SIZE};
use edgetpu_chip::{DescriptorTag, EventRecord, StreamHeader};
use tracing::{debug, trace};

use crate::config::DriverConfig;
use crate::error::{EdgeTpuError, Result};
use crate::transport::{CompletionChannel, UsbTransport};

/// Bulk data path used by the executable interpreter.
pub trait DataStream {
    /// Send `data` under `tag`: one header transfer, then the payload.
    ///
    /// # Errors
    ///
    /// Returns error if any transfer fails, times out or moves zero bytes.
    fn send(&self, tag: DescriptorTag, data: &Bytes) -> Result<()>;

    /// Fill `buf` completely from the output endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if any transfer fails, times out or moves zero bytes.
    fn receive(&self, buf: &mut [u8]) -> Result<()>;

    /// Read one completion event.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer fails or returns a short record.
    fn read_event(&self) -> Result<EventRecord>;
}

/// Event record exactly as it sits on the wire.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawEvent {
    address: u64,
    length: u32,
    tag: u8,
    reserved: [u8; 3],
}

impl From<RawEvent> for EventRecord {
    fn from(raw: RawEvent) -> Self {
        Self {
            address: u64::from_le(raw.address),
            length: u32::from_le(raw.length),
            tag: raw.tag & 0xF,
        }
    }
}

/// [`DataStream`] over a transport's bulk pipes.
#[derive(Debug)]
pub struct BulkStream {
    transport: Arc<dyn UsbTransport>,
    out: CompletionChannel<usize>,
    input: CompletionChannel<Bytes>,
    events: CompletionChannel<Bytes>,
    max_chunk: usize,
    bulk_timeout: Duration,
    event_timeout: Duration,
}

impl BulkStream {
    /// Stream over `transport` with the chunk size and timeouts of `config`.
    pub fn new(transport: Arc<dyn UsbTransport>, config: &DriverConfig) -> Self {
        Self {
            transport,
            out: CompletionChannel::new("bulk-out"),
            input: CompletionChannel::new("bulk-in"),
            events: CompletionChannel::new("event-in"),
            max_chunk: config.max_bulk_chunk.max(1),
            bulk_timeout: config.bulk_timeout,
            event_timeout: config.event_timeout,
        }
    }

    fn write(&self, data: Bytes) -> Result<usize> {
        self.out.transact(self.bulk_timeout, |done| {
            self.transport
                .submit_bulk_out(endpoint::out_address(endpoint::SINGLE_BULK_OUT), data, done)
        })
    }

    fn read(&self, number: u8, channel: &CompletionChannel<Bytes>, length: usize, timeout: Duration) -> Result<Bytes> {
        channel.transact(timeout, |done| {
            self.transport
                .submit_bulk_in(endpoint::in_address(number), length, done)
        })
    }
}

impl DataStream for BulkStream {
    fn send(&self, tag: DescriptorTag, data: &Bytes) -> Result<()> {
        let length = u32::try_from(data.len()).map_err(|_| {
            EdgeTpuError::invalid_argument(format!("{} payload of {} bytes exceeds u32", tag, data.len()))
        })?;
        let header = StreamHeader::new(tag, length).encode();
        let sent = self.write(Bytes::copy_from_slice(&header))?;
        if sent != HEADER_SIZE {
            return Err(EdgeTpuError::transfer_failed(format!(
                "header transfer moved {sent} of {HEADER_SIZE} bytes"
            )));
        }

        let mut cursor = 0;
        while cursor < data.len() {
            let end = (cursor + self.max_chunk).min(data.len());
            let sent = self.write(data.slice(cursor..end))?;
            if sent == 0 {
                return Err(EdgeTpuError::transfer_failed(format!(
                    "bulk-out stalled at byte {cursor} of {}",
                    data.len()
                )));
            }
            trace!("{}: sent {} bytes at {}", tag, sent, cursor);
            cursor += sent.min(end - cursor);
        }
        debug!("Sent {} bytes of {}", data.len(), tag);
        Ok(())
    }

    fn receive(&self, buf: &mut [u8]) -> Result<()> {
        let mut cursor = 0;
        while cursor < buf.len() {
            let want = self.max_chunk.min(buf.len() - cursor);
            let got = self.read(endpoint::SINGLE_BULK_OUT, &self.input, want, self.bulk_timeout)?;
            if got.is_empty() {
                return Err(EdgeTpuError::transfer_failed(format!(
                    "bulk-in returned no data at byte {cursor} of {}",
                    buf.len()
                )));
            }
            let take = got.len().min(want);
            buf[cursor..cursor + take].copy_from_slice(&got[..take]);
            cursor += take;
        }
        debug!("Received {} bytes", buf.len());
        Ok(())
    }

    fn read_event(&self) -> Result<EventRecord> {
        let data = self.read(endpoint::EVENT_IN, &self.events, EVENT_SIZE, self.event_timeout)?;
        let bytes = data.get(..EVENT_SIZE).ok_or_else(|| {
            EdgeTpuError::transfer_failed(format!("event record of {} bytes, expected {EVENT_SIZE}", data.len()))
        })?;
        let event = EventRecord::from(bytemuck::pod_read_unaligned::<RawEvent>(bytes));
        debug!(
            "Event: address {:#x}, length {}, tag {}",
            event.address, event.length, event.tag
        );
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_layout() {
        assert_eq!(std::mem::size_of::<RawEvent>(), EVENT_SIZE);
        let record = EventRecord {
            address: 0x1122_3344_5566_7788,
            length: 0x1000,
            tag: 3,
        };
        let mut wire = record.encode();
        wire[12] |= 0xF0;
        let decoded = EventRecord::from(bytemuck::pod_read_unaligned::<RawEvent>(&wire));
        assert_eq!(decoded, record);
    }
}
