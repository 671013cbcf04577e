//! Firmware download over USB DFU
//!
//! A Beagle without firmware enumerates as a DFU device. [`DfuTask`] walks it
//! through download, readback verification and detach:
//!
//! ```text
//! Unattached ─▶ Attached ─▶ SetInterface ─▶ GetStatus ⇄ Transfer
//!                                              │
//!                                              ▼
//!                                      ZeroLengthTransfer ─▶ ReadBack ⇄ GetStatusRead
//!                                                                           │
//!                               Complete ◀─ CheckStatus ◀─ Detach ◀─────────┘
//! ```
//!
//! Every state that talks to the device submits exactly one control
//! transfer; its completion is posted to the task's queue and drives the
//! next transition. Any failure lands in `Error`, which is terminal.
//!
//! | Request | wValue | Data |
//! |---------|--------|------|
//! | `DNLOAD` | block number | up to 256 bytes of image |
//! | `UPLOAD` | block number | up to 256 bytes of readback |
//! | `GETSTATUS` | 0 | 6-byte status record |
//! | `DETACH` | timeout (ms) | none |

use std::fmt;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use edgetpu_chip::usb::dfu::{self, StatusRecord};
use edgetpu_chip::usb::{set_interface_setup, SetupPacket, DFU_CLASS, DFU_SUBCLASS};
use tracing::{debug, error, info, trace, warn};

use crate::error::{EdgeTpuError, Result};
use crate::host::{find_interface, HostEvent, InterfaceInfo, UsbHost};
use crate::task::{completion_poster, ConnectionListener, TASK_QUEUE_DEPTH};
use crate::transport::UsbTransport;

/// Largest image whose trailing zero-length download still has a block
/// number.
pub const MAX_IMAGE_SIZE: usize = u16::MAX as usize * dfu::TRANSFER_UNIT;

/// DFU task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DfuState {
    /// No DFU device
    Unattached,
    /// DFU interface found; class driver being opened
    Attached,
    /// Waiting for `SET_INTERFACE`
    SetInterface,
    /// Waiting for status between downloads
    GetStatus,
    /// One download block in flight
    Transfer,
    /// End-of-image marker in flight
    ZeroLengthTransfer,
    /// One upload block in flight
    ReadBack,
    /// Waiting for status between uploads
    GetStatusRead,
    /// `DFU_DETACH` in flight
    Detach,
    /// Final status check
    CheckStatus,
    /// Firmware verified; device re-enumerating
    Complete,
    /// Terminal
    Error,
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

enum DfuMessage {
    Host(HostEvent),
    Completed {
        request: DfuState,
        result: Result<Bytes>,
    },
}

/// Posts host events to a [`DfuTask`] from another thread.
#[derive(Debug, Clone)]
pub struct DfuHandle {
    tx: SyncSender<DfuMessage>,
}

impl DfuHandle {
    /// Queue a host-controller event. Blocks while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns error once the task has been dropped.
    pub fn post_host_event(&self, event: HostEvent) -> Result<()> {
        self.tx
            .send(DfuMessage::Host(event))
            .map_err(|_| EdgeTpuError::invalid_state("DFU task dropped"))
    }
}

impl fmt::Debug for DfuMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(event) => f.debug_tuple("Host").field(event).finish(),
            Self::Completed { request, result } => f
                .debug_struct("Completed")
                .field("request", request)
                .field("len", &result.as_ref().map(Bytes::len).ok())
                .finish(),
        }
    }
}

/// Outcome of a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuReport {
    /// Image size in bytes
    pub bytes: usize,
    /// Every state entered, in order
    pub history: Vec<DfuState>,
    /// Times the readback buffer was released
    pub readback_releases: usize,
}

impl DfuReport {
    /// Number of times `state` was entered.
    #[must_use]
    pub fn count(&self, state: DfuState) -> usize {
        self.history.iter().filter(|s| **s == state).count()
    }
}

/// DFU state machine for one device.
pub struct DfuTask {
    host: Arc<dyn UsbHost>,
    image: Bytes,
    tx: SyncSender<DfuMessage>,
    rx: Receiver<DfuMessage>,
    state: DfuState,
    interface: Option<InterfaceInfo>,
    transport: Option<Arc<dyn UsbTransport>>,
    block: u16,
    bytes: usize,
    pending: usize,
    readback: Option<Vec<u8>>,
    readback_releases: usize,
    history: Vec<DfuState>,
    failure: Option<EdgeTpuError>,
    listener: Option<Weak<dyn ConnectionListener>>,
}

impl DfuTask {
    /// Task that will download `image` once a DFU device is reported.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::InvalidArgument`] for an empty image or one
    /// larger than [`MAX_IMAGE_SIZE`].
    pub fn new(host: Arc<dyn UsbHost>, image: impl Into<Bytes>) -> Result<Self> {
        let image = image.into();
        if image.is_empty() {
            return Err(EdgeTpuError::invalid_argument("firmware image is empty"));
        }
        if image.len() > MAX_IMAGE_SIZE {
            return Err(EdgeTpuError::invalid_argument(format!(
                "firmware image of {} bytes exceeds {MAX_IMAGE_SIZE}",
                image.len()
            )));
        }
        let (tx, rx) = mpsc::sync_channel(TASK_QUEUE_DEPTH);
        Ok(Self {
            host,
            image,
            tx,
            rx,
            state: DfuState::Unattached,
            interface: None,
            transport: None,
            block: 0,
            bytes: 0,
            pending: 0,
            readback: None,
            readback_releases: 0,
            history: Vec::new(),
            failure: None,
            listener: None,
        })
    }

    /// Task for the image stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::FileNotFound`] if `path` does not exist, or
    /// the read or size error.
    pub fn from_file(host: Arc<dyn UsbHost>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EdgeTpuError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::new(host, std::fs::read(path)?)
    }

    /// Who hears about the terminal error.
    #[must_use]
    pub fn with_listener(mut self, listener: Weak<dyn ConnectionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Handle for posting host events.
    pub fn handle(&self) -> DfuHandle {
        DfuHandle { tx: self.tx.clone() }
    }

    /// Current state.
    pub const fn state(&self) -> DfuState {
        self.state
    }

    /// Times the readback buffer has been released, on either verify
    /// outcome or on entering `Error`.
    pub const fn readback_releases(&self) -> usize {
        self.readback_releases
    }

    /// Process queued events until the download completes or fails.
    ///
    /// `idle` bounds the wait for each event, not the whole download.
    ///
    /// # Errors
    ///
    /// Returns the error that moved the task to `Error`, a
    /// [`EdgeTpuError::Timeout`] if nothing arrives within `idle`, or
    /// [`EdgeTpuError::InvalidState`] if the task already failed.
    pub fn run(&mut self, idle: Duration) -> Result<DfuReport> {
        loop {
            match self.state {
                DfuState::Complete => return Ok(self.report()),
                DfuState::Error => {
                    return Err(self
                        .failure
                        .take()
                        .unwrap_or_else(|| EdgeTpuError::invalid_state("DFU task in Error")));
                }
                _ => {}
            }
            let message = match self.rx.recv_timeout(idle) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("DFU task idle for {:?} in {}", idle, self.state);
                    return Err(EdgeTpuError::timeout(idle));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EdgeTpuError::invalid_state("DFU queue disconnected"));
                }
            };
            trace!("dfu: {:?}", message);
            match message {
                DfuMessage::Host(event) => self.on_host_event(event),
                DfuMessage::Completed { request, result } => self.on_completion(request, result),
            }
        }
    }

    fn report(&self) -> DfuReport {
        DfuReport {
            bytes: self.image.len(),
            history: self.history.clone(),
            readback_releases: self.readback_releases,
        }
    }

    // ── Transitions ─────────────────────────────────────────────────────

    fn on_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Attach(interfaces) => {
                self.interface = find_interface(&interfaces, DFU_CLASS, DFU_SUBCLASS).cloned();
                if self.interface.is_none() {
                    debug!("Attached device has no DFU interface");
                }
            }
            HostEvent::EnumerationDone if self.interface.is_some() => self.advance(DfuState::Attached),
            HostEvent::EnumerationDone => warn!("Enumeration finished without a DFU interface"),
            HostEvent::Detach => self.advance(DfuState::Unattached),
            HostEvent::TransferFailed { reason } => {
                self.fail(EdgeTpuError::transfer_failed(reason));
            }
        }
    }

    fn on_completion(&mut self, request: DfuState, result: Result<Bytes>) {
        if request != self.state {
            debug!("Completion for {} ignored in {}", request, self.state);
            return;
        }
        match result.and_then(|data| self.completed(request, &data)) {
            Ok(Some(next)) => self.advance(next),
            Ok(None) => {}
            Err(e) => self.fail(e),
        }
    }

    fn completed(&mut self, request: DfuState, data: &Bytes) -> Result<Option<DfuState>> {
        let next = match request {
            DfuState::SetInterface => DfuState::GetStatus,
            DfuState::GetStatus => {
                check_status(data)?;
                if self.bytes < self.image.len() {
                    DfuState::Transfer
                } else {
                    DfuState::ZeroLengthTransfer
                }
            }
            DfuState::Transfer => {
                self.block += 1;
                self.bytes += self.pending;
                DfuState::GetStatus
            }
            DfuState::ZeroLengthTransfer => {
                info!("Downloaded {} bytes in {} blocks", self.bytes, self.block);
                self.block = 0;
                self.bytes = 0;
                DfuState::ReadBack
            }
            DfuState::ReadBack => {
                if data.is_empty() || data.len() > self.pending {
                    return Err(EdgeTpuError::protocol(format!(
                        "upload of block {} returned {} bytes, expected 1..={}",
                        self.block,
                        data.len(),
                        self.pending
                    )));
                }
                self.readback
                    .as_mut()
                    .ok_or_else(|| EdgeTpuError::invalid_state("readback buffer missing"))?
                    .extend_from_slice(data);
                self.block += 1;
                self.bytes += data.len();
                DfuState::GetStatusRead
            }
            DfuState::GetStatusRead => {
                check_status(data)?;
                if self.bytes < self.image.len() {
                    DfuState::ReadBack
                } else {
                    self.verify()?;
                    DfuState::Detach
                }
            }
            DfuState::Detach => DfuState::CheckStatus,
            DfuState::CheckStatus => {
                check_status(data)?;
                DfuState::Complete
            }
            other => {
                warn!("Unexpected completion in {}", other);
                return Ok(None);
            }
        };
        Ok(Some(next))
    }

    fn advance(&mut self, first: DfuState) {
        let mut next = Some(first);
        while let Some(state) = next {
            debug!("DFU state {} -> {}", self.state, state);
            self.state = state;
            self.history.push(state);
            next = match self.enter(state) {
                Ok(next) => next,
                Err(e) => {
                    self.fail(e);
                    None
                }
            };
        }
    }

    fn fail(&mut self, error: EdgeTpuError) {
        if self.state == DfuState::Error {
            return;
        }
        error!("DFU failed in {}: {}", self.state, error);
        self.failure = Some(error);
        self.advance(DfuState::Error);
    }

    fn enter(&mut self, state: DfuState) -> Result<Option<DfuState>> {
        match state {
            DfuState::Unattached => {
                self.close();
                Ok(None)
            }
            DfuState::Attached => {
                let interface = self.interface.as_ref().ok_or(EdgeTpuError::NotConnected)?;
                self.transport = Some(self.host.open_class(interface)?);
                Ok(Some(DfuState::SetInterface))
            }
            DfuState::SetInterface => {
                let setup = set_interface_setup(self.interface_number()?, 0);
                self.submit(state, setup, Bytes::new())?;
                Ok(None)
            }
            DfuState::GetStatus | DfuState::GetStatusRead | DfuState::CheckStatus => {
                let setup = dfu::in_setup(dfu::GETSTATUS, 0, self.interface_number()?, dfu::STATUS_LEN);
                self.submit(state, setup, Bytes::new())?;
                Ok(None)
            }
            DfuState::Transfer => {
                self.pending = self.next_unit();
                let chunk = self.image.slice(self.bytes..self.bytes + self.pending);
                trace!("DNLOAD block {} ({} bytes)", self.block, chunk.len());
                let setup = dfu::out_setup(dfu::DNLOAD, self.block, self.interface_number()?, unit_len(self.pending));
                self.submit(state, setup, chunk)?;
                Ok(None)
            }
            DfuState::ZeroLengthTransfer => {
                let setup = dfu::out_setup(dfu::DNLOAD, self.block, self.interface_number()?, 0);
                self.submit(state, setup, Bytes::new())?;
                Ok(None)
            }
            DfuState::ReadBack => {
                if self.readback.is_none() {
                    let mut buffer = Vec::new();
                    buffer.try_reserve_exact(self.image.len()).map_err(|e| {
                        EdgeTpuError::resource(format!("readback buffer of {} bytes: {e}", self.image.len()))
                    })?;
                    self.readback = Some(buffer);
                }
                self.pending = self.next_unit();
                let setup = dfu::in_setup(dfu::UPLOAD, self.block, self.interface_number()?, unit_len(self.pending));
                self.submit(state, setup, Bytes::new())?;
                Ok(None)
            }
            DfuState::Detach => {
                let setup = dfu::out_setup(dfu::DETACH, dfu::DETACH_TIMEOUT_MS, self.interface_number()?, 0);
                self.submit(state, setup, Bytes::new())?;
                Ok(None)
            }
            DfuState::Complete => {
                self.host.reset_bus()?;
                self.close();
                self.host.request_reenumeration()?;
                info!("Firmware download complete ({} bytes)", self.image.len());
                Ok(None)
            }
            DfuState::Error => {
                self.release_readback();
                self.close();
                if let Some(listener) = self.listener.as_ref().and_then(Weak::upgrade) {
                    listener.notify_error();
                }
                Ok(None)
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn submit(&self, request: DfuState, setup: SetupPacket, data: Bytes) -> Result<()> {
        let transport = self.transport.as_ref().ok_or(EdgeTpuError::NotConnected)?;
        let done = completion_poster(self.tx.clone(), "DFU", move |result: Result<Bytes>| {
            DfuMessage::Completed { request, result }
        });
        transport.submit_control(setup, data, done)
    }

    fn interface_number(&self) -> Result<u16> {
        self.interface
            .as_ref()
            .map(|i| u16::from(i.number))
            .ok_or(EdgeTpuError::NotConnected)
    }

    fn next_unit(&self) -> usize {
        (self.image.len() - self.bytes).min(dfu::TRANSFER_UNIT)
    }

    fn verify(&mut self) -> Result<()> {
        let readback = self.readback.take().unwrap_or_default();
        self.readback_releases += 1;
        self.block = 0;
        self.bytes = 0;
        match first_difference(&self.image, &readback) {
            None => {
                info!("Readback verified ({} bytes)", readback.len());
                Ok(())
            }
            Some(offset) => Err(EdgeTpuError::FirmwareMismatch { offset }),
        }
    }

    fn release_readback(&mut self) {
        if self.readback.take().is_some() {
            self.readback_releases += 1;
        }
    }

    fn close(&mut self) {
        if self.transport.take().is_some() {
            if let Some(interface) = &self.interface {
                self.host.close_class(interface);
            }
        }
    }
}

impl fmt::Debug for DfuTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DfuTask")
            .field("state", &self.state)
            .field("image", &self.image.len())
            .field("block", &self.block)
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

fn check_status(data: &[u8]) -> Result<StatusRecord> {
    let status = StatusRecord::parse(data)
        .ok_or_else(|| EdgeTpuError::protocol(format!("GETSTATUS returned {} bytes", data.len())))?;
    if status.status != 0 {
        return Err(EdgeTpuError::protocol(format!(
            "device reported DFU status {:#04x} in state {}",
            status.status, status.state
        )));
    }
    Ok(status)
}

#[allow(clippy::cast_possible_truncation)]
const fn unit_len(len: usize) -> u16 {
    // Never above TRANSFER_UNIT.
    len as u16
}

fn first_difference(expected: &[u8], actual: &[u8]) -> Option<usize> {
    expected
        .iter()
        .zip(actual)
        .position(|(a, b)| a != b)
        .or_else(|| (expected.len() != actual.len()).then(|| expected.len().min(actual.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{dfu_configuration, SimulatedDfuDevice, SoftwareHost, SoftwareTransport};

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn task(device: SimulatedDfuDevice, len: usize) -> (DfuTask, Arc<SoftwareTransport<SimulatedDfuDevice>>) {
        let transport = Arc::new(SoftwareTransport::new(device).unwrap());
        let host = Arc::new(SoftwareHost::new(transport.clone()));
        let task = DfuTask::new(host, image(len)).unwrap();
        let handle = task.handle();
        handle.post_host_event(HostEvent::Attach(dfu_configuration())).unwrap();
        handle.post_host_event(HostEvent::EnumerationDone).unwrap();
        (task, transport)
    }

    #[test]
    fn test_small_image_single_block() {
        let (mut task, transport) = task(SimulatedDfuDevice::new(), 100);
        let report = task.run(Duration::from_secs(2)).unwrap();
        assert_eq!(report.readback_releases, 1);
        assert_eq!(task.readback_releases(), 1);
        assert_eq!(report.count(DfuState::Transfer), 1);
        assert_eq!(report.count(DfuState::ReadBack), 1);
        assert_eq!(report.history.last(), Some(&DfuState::Complete));
        transport
            .with_model(|dev| {
                assert_eq!(dev.flash(), image(100).as_slice());
                assert!(dev.manifested());
                assert!(dev.detached());
            })
            .unwrap();
    }

    #[test]
    fn test_exact_multiple_of_unit() {
        let (mut task, _) = task(SimulatedDfuDevice::new(), 512);
        let report = task.run(Duration::from_secs(2)).unwrap();
        assert_eq!(report.count(DfuState::Transfer), 2);
        assert_eq!(report.count(DfuState::ZeroLengthTransfer), 1);
        assert_eq!(report.count(DfuState::ReadBack), 2);
    }

    #[test]
    fn test_empty_image_rejected() {
        let transport = Arc::new(SoftwareTransport::new(SimulatedDfuDevice::new()).unwrap());
        let host = Arc::new(SoftwareHost::new(transport));
        assert!(matches!(
            DfuTask::new(host, Vec::new()),
            Err(EdgeTpuError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_image_from_file() {
        use std::io::Write;

        let transport = Arc::new(SoftwareTransport::new(SimulatedDfuDevice::new()).unwrap());
        let host: Arc<SoftwareHost> = Arc::new(SoftwareHost::new(transport));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image(300)).unwrap();
        let task = DfuTask::from_file(host.clone(), file.path()).unwrap();
        assert_eq!(task.state(), DfuState::Unattached);

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DfuTask::from_file(host, dir.path().join("missing.bin")),
            Err(EdgeTpuError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_error_is_terminal() {
        let (mut task, _) = task(SimulatedDfuDevice::new().corrupt_readback_at(3), 10);
        assert!(matches!(
            task.run(Duration::from_secs(2)),
            Err(EdgeTpuError::FirmwareMismatch { offset: 3 })
        ));
        assert_eq!(task.state(), DfuState::Error);
        assert_eq!(task.readback_releases(), 1);
        assert!(matches!(
            task.run(Duration::from_millis(10)),
            Err(EdgeTpuError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_first_difference() {
        assert_eq!(first_difference(b"abc", b"abc"), None);
        assert_eq!(first_difference(b"abc", b"abd"), Some(2));
        assert_eq!(first_difference(b"abc", b"ab"), Some(2));
    }

    #[test]
    fn test_bad_status_byte() {
        let mut record = StatusRecord::default().to_bytes();
        record[0] = 0x0A;
        assert!(check_status(&record).is_err());
        assert!(check_status(&record[..3]).is_err());
    }
}
