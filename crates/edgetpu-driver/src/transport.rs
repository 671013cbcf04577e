//! Transport abstraction
//!
//! A transport accepts control, bulk-out and bulk-in submissions and reports
//! each one exactly once through a boxed completion, invoked from the
//! transport's own event context. Callers that want blocking semantics pair a
//! submission with a [`CompletionChannel`].
//!
//! ```text
//! caller thread                     transport event thread
//! ─────────────                     ──────────────────────
//! seq, done = channel.arm()
//! transport.submit_*(.., done) ───▶ performs transfer
//! channel.wait(seq, timeout)  ◀──── done(result)  (posts (seq, result))
//! ```
//!
//! A completion that arrives after its waiter gave up carries an old
//! sequence number and is dropped by the next `wait`.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use edgetpu_chip::usb::{self, endpoint, SetupPacket};
use tracing::{debug, warn};

use crate::error::{EdgeTpuError, Result};

/// Callback invoked exactly once with the outcome of a submission.
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Transport implementation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// In-process simulated device
    Software,

    /// libusb
    Usb,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Software => write!(f, "Software (simulated)"),
            Self::Usb => write!(f, "USB (libusb)"),
        }
    }
}

/// Asynchronous USB transfer primitives for one claimed interface.
///
/// At most one submission per pipe is in flight at a time; the driver's
/// blocking wrappers guarantee that.
pub trait UsbTransport: Debug + Send + Sync {
    /// Prepare the pipe for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint does not exist or cannot be opened.
    fn open_pipe(&self, endpoint: &EndpointDescriptor) -> Result<()>;

    /// Submit a control transfer. `data` is the OUT payload; IN transfers
    /// complete with up to `setup.length` bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer could not be queued. `done` is not
    /// called in that case.
    fn submit_control(&self, setup: SetupPacket, data: Bytes, done: Completion<Bytes>) -> Result<()>;

    /// Submit a bulk-out transfer. Completes with the bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer could not be queued.
    fn submit_bulk_out(&self, endpoint: u8, data: Bytes, done: Completion<usize>) -> Result<()>;

    /// Submit a bulk-in transfer of up to `length` bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer could not be queued.
    fn submit_bulk_in(&self, endpoint: u8, length: usize, done: Completion<Bytes>) -> Result<()>;

    /// Implementation identifier, for logging.
    fn transport_type(&self) -> TransportType;
}

// ── Completion bridging ─────────────────────────────────────────────────────

/// Completions buffered before the transport starts dropping them.
const COMPLETION_DEPTH: usize = 4;

/// Reusable callback-to-blocking bridge for one pipe.
pub struct CompletionChannel<T> {
    tx: SyncSender<(u64, Result<T>)>,
    rx: Mutex<Receiver<(u64, Result<T>)>>,
    sequence: AtomicU64,
    name: &'static str,
}

impl<T: Send + 'static> CompletionChannel<T> {
    /// Channel for the pipe called `name`.
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::sync_channel(COMPLETION_DEPTH);
        Self {
            tx,
            rx: Mutex::new(rx),
            sequence: AtomicU64::new(0),
            name,
        }
    }

    /// Allocate the next sequence number and the completion that reports
    /// under it.
    pub fn arm(&self) -> (u64, Completion<T>) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let tx = self.tx.clone();
        let name = self.name;
        let done: Completion<T> = Box::new(move |result| match tx.try_send((seq, result)) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => warn!("{} completion {} dropped: channel full", name, seq),
        });
        (seq, done)
    }

    /// Block until the completion for `seq` arrives.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::Timeout`] if nothing arrives within `timeout`,
    /// or the transfer's own error.
    pub fn wait(&self, seq: u64, timeout: Duration) -> Result<T> {
        let rx = self.rx.lock().map_err(|_| EdgeTpuError::poisoned(self.name))?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((got, result)) if got == seq => return result,
                Ok((got, _)) => debug!("{}: discarding stale completion {} (waiting for {})", self.name, got, seq),
                Err(RecvTimeoutError::Timeout) => {
                    debug!("{}: completion {} timed out", self.name, seq);
                    return Err(EdgeTpuError::timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EdgeTpuError::transfer_failed(format!("{} channel closed", self.name)));
                }
            }
        }
    }

    /// Submit through `submit` and block for its completion.
    ///
    /// # Errors
    ///
    /// Returns the submission error, a timeout, or the transfer's error.
    pub fn transact<F>(&self, timeout: Duration, submit: F) -> Result<T>
    where
        F: FnOnce(Completion<T>) -> Result<()>,
    {
        let (seq, done) = self.arm();
        submit(done)?;
        self.wait(seq, timeout)
    }
}

impl<T> Debug for CompletionChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionChannel")
            .field("name", &self.name)
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ── Pipes ───────────────────────────────────────────────────────────────────

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Bulk, host to device
    BulkOut,
    /// Bulk, device to host
    BulkIn,
    /// Interrupt, device to host
    InterruptIn,
}

/// One endpoint of an interface descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress`
    pub address: u8,
    /// Transfer type and direction
    pub kind: EndpointKind,
    /// `wMaxPacketSize`
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    /// Endpoint number without the direction bit.
    #[must_use]
    pub const fn number(&self) -> u8 {
        self.address & endpoint::NUMBER_MASK
    }

    /// The layout the Edge TPU interface reports: three bulk-out, two
    /// bulk-in and one interrupt-in endpoint.
    #[must_use]
    pub fn edgetpu_interface() -> Vec<Self> {
        vec![
            Self::bulk_out(1),
            Self::bulk_out(2),
            Self::bulk_out(3),
            Self::bulk_in(1),
            Self::bulk_in(2),
            Self {
                address: endpoint::in_address(endpoint::INTERRUPT_IN),
                kind: EndpointKind::InterruptIn,
                max_packet_size: 64,
            },
        ]
    }

    const fn bulk_out(number: u8) -> Self {
        Self {
            address: endpoint::out_address(number),
            kind: EndpointKind::BulkOut,
            max_packet_size: usb::BULK_OUT_PACKET_SIZE,
        }
    }

    const fn bulk_in(number: u8) -> Self {
        Self {
            address: endpoint::in_address(number),
            kind: EndpointKind::BulkIn,
            max_packet_size: usb::BULK_IN_PACKET_SIZE,
        }
    }
}

/// An opened (or failed) pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipe {
    /// Endpoint the pipe belongs to
    pub endpoint: EndpointDescriptor,
    /// Whether the pipe opened
    pub connected: bool,
}

/// The six pipes of an Edge TPU interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeSet {
    pipes: Vec<Pipe>,
}

impl PipeSet {
    /// Open a pipe for every endpoint.
    ///
    /// Bulk max packet sizes are forced to the hardware limits before
    /// opening. A failure on the interrupt endpoint leaves that pipe marked
    /// disconnected; any other failure aborts.
    ///
    /// # Errors
    ///
    /// Returns error if the interface does not have exactly
    /// [`usb::ENDPOINT_COUNT`] endpoints or a bulk pipe fails to open.
    pub fn open(transport: &dyn UsbTransport, endpoints: &[EndpointDescriptor]) -> Result<Self> {
        if endpoints.len() != usb::ENDPOINT_COUNT {
            return Err(EdgeTpuError::protocol(format!(
                "interface has {} endpoints, expected {}",
                endpoints.len(),
                usb::ENDPOINT_COUNT
            )));
        }

        let mut pipes = Vec::with_capacity(endpoints.len());
        for descriptor in endpoints {
            let mut descriptor = *descriptor;
            match descriptor.kind {
                EndpointKind::BulkOut => descriptor.max_packet_size = usb::BULK_OUT_PACKET_SIZE,
                EndpointKind::BulkIn => descriptor.max_packet_size = usb::BULK_IN_PACKET_SIZE,
                EndpointKind::InterruptIn => {}
            }
            let connected = match transport.open_pipe(&descriptor) {
                Ok(()) => true,
                Err(e) if descriptor.kind == EndpointKind::InterruptIn => {
                    warn!("Interrupt pipe {:#04x} unavailable: {}", descriptor.address, e);
                    false
                }
                Err(e) => return Err(e),
            };
            debug!(
                "Pipe {:#04x} ({:?}) connected: {}",
                descriptor.address, descriptor.kind, connected
            );
            pipes.push(Pipe {
                endpoint: descriptor,
                connected,
            });
        }
        Ok(Self { pipes })
    }

    /// Succeeds iff every non-interrupt pipe is connected.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::EndpointUnavailable`] for the first bulk pipe
    /// that is not connected.
    pub fn status(&self) -> Result<()> {
        match self
            .pipes
            .iter()
            .find(|p| !p.connected && p.endpoint.kind != EndpointKind::InterruptIn)
        {
            Some(pipe) => Err(EdgeTpuError::endpoint_unavailable(pipe.endpoint.address, "pipe not connected")),
            None => Ok(()),
        }
    }

    /// Pipe for endpoint `number` of the given kind.
    #[must_use]
    pub fn find(&self, kind: EndpointKind, number: u8) -> Option<&Pipe> {
        self.pipes
            .iter()
            .find(|p| p.endpoint.kind == kind && p.endpoint.number() == number)
    }

    /// Every pipe, in descriptor order.
    #[must_use]
    pub fn pipes(&self) -> &[Pipe] {
        &self.pipes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, Default)]
    struct OpenOnly {
        failing: HashSet<u8>,
    }

    impl UsbTransport for OpenOnly {
        fn open_pipe(&self, endpoint: &EndpointDescriptor) -> Result<()> {
            if self.failing.contains(&endpoint.address) {
                Err(EdgeTpuError::endpoint_unavailable(endpoint.address, "refused"))
            } else {
                Ok(())
            }
        }

        fn submit_control(&self, _: SetupPacket, _: Bytes, _: Completion<Bytes>) -> Result<()> {
            Err(EdgeTpuError::transfer_failed("unsupported"))
        }

        fn submit_bulk_out(&self, _: u8, _: Bytes, _: Completion<usize>) -> Result<()> {
            Err(EdgeTpuError::transfer_failed("unsupported"))
        }

        fn submit_bulk_in(&self, _: u8, _: usize, _: Completion<Bytes>) -> Result<()> {
            Err(EdgeTpuError::transfer_failed("unsupported"))
        }

        fn transport_type(&self) -> TransportType {
            TransportType::Software
        }
    }

    #[test]
    fn test_pipe_open_tolerates_interrupt_failure() {
        let transport = OpenOnly {
            failing: HashSet::from([0x83]),
        };
        let pipes = PipeSet::open(&transport, &EndpointDescriptor::edgetpu_interface()).unwrap();
        assert!(pipes.status().is_ok());
        assert!(!pipes.find(EndpointKind::InterruptIn, 3).unwrap().connected);
        assert!(pipes.find(EndpointKind::BulkIn, 2).unwrap().connected);
    }

    #[test]
    fn test_pipe_open_fails_on_bulk_failure() {
        let transport = OpenOnly {
            failing: HashSet::from([0x01]),
        };
        let err = PipeSet::open(&transport, &EndpointDescriptor::edgetpu_interface()).unwrap_err();
        assert!(matches!(err, EdgeTpuError::EndpointUnavailable { address: 0x01, .. }));
    }

    #[test]
    fn test_pipe_open_requires_six_endpoints() {
        let mut endpoints = EndpointDescriptor::edgetpu_interface();
        endpoints.pop();
        assert!(PipeSet::open(&OpenOnly::default(), &endpoints).is_err());
    }

    #[test]
    fn test_bulk_packet_sizes_forced() {
        let mut endpoints = EndpointDescriptor::edgetpu_interface();
        endpoints[0].max_packet_size = 64;
        let pipes = PipeSet::open(&OpenOnly::default(), &endpoints).unwrap();
        assert_eq!(pipes.pipes()[0].endpoint.max_packet_size, 512);
        assert_eq!(pipes.find(EndpointKind::BulkIn, 1).unwrap().endpoint.max_packet_size, 256);
    }

    #[test]
    fn test_status_reports_disconnected_bulk_pipe() {
        let mut pipes = PipeSet::open(&OpenOnly::default(), &EndpointDescriptor::edgetpu_interface()).unwrap();
        pipes.pipes[3].connected = false;
        assert!(pipes.status().is_err());
    }

    #[test]
    fn test_completion_delivered() {
        let channel = CompletionChannel::<u32>::new("test");
        let value = channel
            .transact(Duration::from_millis(500), |done| {
                thread::spawn(move || done(Ok(7)));
                Ok(())
            })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_stale_completion_not_delivered_to_next_waiter() {
        let channel = Arc::new(CompletionChannel::<u32>::new("test"));

        let (seq, late) = channel.arm();
        let err = channel.wait(seq, Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());

        let (seq, done) = channel.arm();
        late(Ok(1));
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            done(Ok(2));
        });
        assert_eq!(channel.wait(seq, Duration::from_millis(500)).unwrap(), 2);
    }

    #[test]
    fn test_submit_error_skips_wait() {
        let channel = CompletionChannel::<u32>::new("test");
        let err = channel
            .transact(Duration::from_secs(10), |_done| Err(EdgeTpuError::transfer_failed("busy")))
            .unwrap_err();
        assert!(matches!(err, EdgeTpuError::TransferFailed { .. }));
    }
}
