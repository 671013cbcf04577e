//! Register (CSR) protocol over the control pipe
//!
//! Every CSR access is one vendor control request: `bRequest` selects the
//! width (1 = 32-bit, 0 = 64-bit), `wValue`/`wIndex` carry the low and high
//! halves of the offset. Accesses are blocking; a missing completion after
//! the control timeout is a hard failure, same as a transport error.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use edgetpu_chip::fields::{Csr32, Csr64};
use edgetpu_chip::usb::{csr_setup, Direction, RegisterWidth};
use tracing::trace;

use crate::error::{EdgeTpuError, Result};
use crate::transport::{CompletionChannel, UsbTransport};

/// Synchronous register access.
pub trait RegisterAccess {
    /// Read a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer fails or times out.
    fn read32(&self, offset: u64) -> Result<u32>;

    /// Read a 64-bit register.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer fails or times out.
    fn read64(&self, offset: u64) -> Result<u64>;

    /// Write a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer fails or times out.
    fn write32(&self, offset: u64, value: u32) -> Result<()>;

    /// Write a 64-bit register.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer fails or times out.
    fn write64(&self, offset: u64, value: u64) -> Result<()>;

    /// Read a 32-bit register as a typed view.
    ///
    /// # Errors
    ///
    /// Returns error if the read fails.
    fn read_view32<V: Csr32>(&self, offset: u64) -> Result<V>
    where
        Self: Sized,
    {
        self.read32(offset).map(V::from_raw)
    }

    /// Read a 64-bit register as a typed view.
    ///
    /// # Errors
    ///
    /// Returns error if the read fails.
    fn read_view64<V: Csr64>(&self, offset: u64) -> Result<V>
    where
        Self: Sized,
    {
        self.read64(offset).map(V::from_raw)
    }
}

/// CSR access through a transport's control pipe.
#[derive(Debug)]
pub struct CsrChannel {
    transport: Arc<dyn UsbTransport>,
    completion: CompletionChannel<Bytes>,
    timeout: Duration,
}

impl CsrChannel {
    /// Register access over `transport`, waiting at most `timeout` per access.
    pub fn new(transport: Arc<dyn UsbTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            completion: CompletionChannel::new("control"),
            timeout,
        }
    }

    fn transfer(&self, offset: u64, width: RegisterWidth, direction: Direction, payload: Bytes) -> Result<Bytes> {
        let setup = csr_setup(offset, width, direction);
        trace!(
            "CSR {:?} {:?} {:#x} (wValue {:#06x} wIndex {:#06x})",
            direction,
            width,
            offset,
            setup.value,
            setup.index
        );
        self.completion.transact(self.timeout, |done| {
            self.transport.submit_control(setup, payload, done)
        })
    }

    fn read_exact<const N: usize>(&self, offset: u64, width: RegisterWidth) -> Result<[u8; N]> {
        let data = self.transfer(offset, width, Direction::In, Bytes::new())?;
        data.get(..N)
            .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
            .ok_or_else(|| {
                EdgeTpuError::transfer_failed(format!(
                    "CSR read {offset:#x} returned {} bytes, expected {N}",
                    data.len()
                ))
            })
    }
}

impl RegisterAccess for CsrChannel {
    fn read32(&self, offset: u64) -> Result<u32> {
        self.read_exact::<4>(offset, RegisterWidth::Bits32)
            .map(u32::from_le_bytes)
    }

    fn read64(&self, offset: u64) -> Result<u64> {
        self.read_exact::<8>(offset, RegisterWidth::Bits64)
            .map(u64::from_le_bytes)
    }

    fn write32(&self, offset: u64, value: u32) -> Result<()> {
        let payload = Bytes::copy_from_slice(&value.to_le_bytes());
        self.transfer(offset, RegisterWidth::Bits32, Direction::Out, payload)
            .map(drop)
    }

    fn write64(&self, offset: u64, value: u64) -> Result<()> {
        let payload = Bytes::copy_from_slice(&value.to_le_bytes());
        self.transfer(offset, RegisterWidth::Bits64, Direction::Out, payload)
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Completion, EndpointDescriptor, TransportType};
    use edgetpu_chip::usb::SetupPacket;
    use std::sync::Mutex;
    use std::thread;

    /// Completes every control request from a separate thread, replying
    /// with `reply` and recording the setup packet.
    #[derive(Debug, Default)]
    struct Echo {
        setups: Mutex<Vec<(SetupPacket, Vec<u8>)>>,
        reply: Vec<u8>,
        silent: bool,
    }

    impl UsbTransport for Echo {
        fn open_pipe(&self, _: &EndpointDescriptor) -> Result<()> {
            Ok(())
        }

        fn submit_control(&self, setup: SetupPacket, data: Bytes, done: Completion<Bytes>) -> Result<()> {
            self.setups.lock().unwrap().push((setup, data.to_vec()));
            if !self.silent {
                let reply = Bytes::from(self.reply.clone());
                thread::spawn(move || done(Ok(reply)));
            }
            Ok(())
        }

        fn submit_bulk_out(&self, _: u8, _: Bytes, _: Completion<usize>) -> Result<()> {
            unreachable!()
        }

        fn submit_bulk_in(&self, _: u8, _: usize, _: Completion<Bytes>) -> Result<()> {
            unreachable!()
        }

        fn transport_type(&self) -> TransportType {
            TransportType::Software
        }
    }

    fn channel(echo: Echo) -> (Arc<Echo>, CsrChannel) {
        let echo = Arc::new(echo);
        let csr = CsrChannel::new(echo.clone(), Duration::from_millis(200));
        (echo, csr)
    }

    #[test]
    fn test_read32_setup_and_value() {
        let (echo, csr) = channel(Echo {
            reply: vec![0x00, 0x00, 0x9A, 0x08],
            ..Echo::default()
        });
        assert_eq!(csr.read32(0x1a000).unwrap(), 0x089A_0000);
        let setup = echo.setups.lock().unwrap()[0].0;
        assert_eq!(setup.request_type, 0xC0);
        assert_eq!(setup.request, 1);
        assert_eq!(setup.value, 0xa000);
        assert_eq!(setup.index, 0x0001);
        assert_eq!(setup.length, 4);
    }

    #[test]
    fn test_write64_payload() {
        let (echo, csr) = channel(Echo::default());
        csr.write64(0x4c148, 0xF0).unwrap();
        let setups = echo.setups.lock().unwrap();
        let (setup, payload) = &setups[0];
        assert_eq!(setup.request_type, 0x40);
        assert_eq!(setup.request, 0);
        assert_eq!(setup.length, 8);
        assert_eq!(payload, &[0xF0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_short_read_is_an_error() {
        let (_, csr) = channel(Echo {
            reply: vec![1, 2],
            ..Echo::default()
        });
        assert!(csr.read64(0x44018).is_err());
    }

    #[test]
    fn test_missing_completion_times_out() {
        let echo = Arc::new(Echo {
            silent: true,
            ..Echo::default()
        });
        let csr = CsrChannel::new(echo, Duration::from_millis(10));
        let err = csr.write32(0x1a30c, 0).unwrap_err();
        assert!(matches!(err, EdgeTpuError::Timeout { duration_ms: 10 }));
    }
}
