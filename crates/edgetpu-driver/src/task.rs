//! Attach task: from "a device appeared" to "pipes ready"
//!
//! ```text
//!  Unattached ──EnumerationDone──▶ Attached ──▶ SetInterface ──▶ GetStatus ──▶ Connected
//!      ▲                              │              │               │
//!      └────────── Detach ────────────┴──────────────┴───── (any) ───┴──▶ Error (terminal)
//! ```
//!
//! The task runs on its own thread and consumes a bounded queue of host
//! events and transfer completions, one at a time. Transitions that need
//! no transfer are taken directly; only completions go through the queue.
//!
//! Power is reference counted on the caller's thread: the first
//! `set_power(true)` and the `set_power(false)` that brings the count to
//! zero reach the [`PowerControl`] seam, every other call only adjusts the
//! count.

use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use edgetpu_chip::usb::{set_interface_setup, EDGETPU_CLASS, EDGETPU_SUBCLASS};
use tracing::{debug, error, info, warn};

use crate::error::{EdgeTpuError, Result};
use crate::host::{find_interface, HostEvent, InterfaceInfo, UsbHost};
use crate::transport::{Completion, PipeSet, UsbTransport};

/// Messages buffered before posting blocks.
pub(crate) const TASK_QUEUE_DEPTH: usize = 4;

/// Completion callback that queues `wrap(result)` for a task without
/// blocking the transport. A full or closed queue drops the completion
/// with a warning.
pub(crate) fn completion_poster<T, M, F>(tx: SyncSender<M>, task: &'static str, wrap: F) -> Completion<T>
where
    T: Send + 'static,
    M: Send + 'static,
    F: FnOnce(Result<T>) -> M + Send + 'static,
{
    Box::new(move |result| match tx.try_send(wrap(result)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("{} task queue full, completion dropped", task),
        Err(TrySendError::Disconnected(_)) => warn!("{} task stopped, completion dropped", task),
    })
}

/// Receives connection changes from the attach task and failures from the
/// DFU task.
pub trait ConnectionListener: Send + Sync {
    /// A transport became usable (`Some`) or went away (`None`).
    fn notify_connected(&self, transport: Option<Arc<dyn UsbTransport>>);

    /// A task entered its terminal error state.
    fn notify_error(&self);
}

/// Board-level power switch for the accelerator.
pub trait PowerControl: Send + Sync {
    /// Drive the supply on or off.
    ///
    /// # Errors
    ///
    /// Returns error if the switch cannot be driven.
    fn set_power(&self, on: bool) -> Result<()>;
}

/// [`PowerControl`] for boards where the accelerator is always powered.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOn;

impl PowerControl for AlwaysOn {
    fn set_power(&self, _on: bool) -> Result<()> {
        Ok(())
    }
}

/// Attach task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachState {
    /// No device
    Unattached,
    /// Enumerated; class driver being opened
    Attached,
    /// Waiting for `SET_INTERFACE`
    SetInterface,
    /// Checking pipe connectivity
    GetStatus,
    /// Ready for register and bulk traffic
    Connected,
    /// Enumeration finished without an Edge TPU interface
    EnumerationFailed,
    /// Terminal
    Error,
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

enum Message {
    Host(HostEvent),
    Completed {
        request: AttachState,
        result: Result<()>,
    },
    Shutdown,
}

/// Posts host events to an [`AttachTask`].
#[derive(Debug, Clone)]
pub struct AttachHandle {
    tx: SyncSender<Message>,
}

impl AttachHandle {
    /// Queue a host-controller event. Blocks while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::InvalidState`] once the task has stopped.
    pub fn post_host_event(&self, event: HostEvent) -> Result<()> {
        self.tx
            .send(Message::Host(event))
            .map_err(|_| EdgeTpuError::invalid_state("attach task stopped"))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(event) => f.debug_tuple("Host").field(event).finish(),
            Self::Completed { request, result } => f
                .debug_struct("Completed")
                .field("request", request)
                .field("ok", &result.is_ok())
                .finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

type SharedListener = Arc<Mutex<Option<Weak<dyn ConnectionListener>>>>;

struct PowerState {
    count: u32,
    control: Arc<dyn PowerControl>,
}

/// The attach task and its power reference count.
pub struct AttachTask {
    handle: AttachHandle,
    state: Arc<Mutex<AttachState>>,
    listener: SharedListener,
    power: Mutex<PowerState>,
    worker: Option<JoinHandle<()>>,
}

impl AttachTask {
    /// Start the task thread. It stays `Unattached` until `host` reports a
    /// device through [`AttachHandle::post_host_event`].
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::Resource`] if the thread cannot be started.
    pub fn spawn(host: Arc<dyn UsbHost>) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(TASK_QUEUE_DEPTH);
        let state = Arc::new(Mutex::new(AttachState::Unattached));
        let listener: SharedListener = Arc::new(Mutex::new(None));
        let runner = Runner {
            host,
            tx: tx.clone(),
            state: Arc::clone(&state),
            listener: Arc::clone(&listener),
            interface: None,
            transport: None,
            pipes: None,
        };
        let worker = thread::Builder::new()
            .name("edgetpu-attach".to_string())
            .spawn(move || runner.run(&rx))
            .map_err(|e| EdgeTpuError::resource(format!("cannot start attach task: {e}")))?;
        Ok(Self {
            handle: AttachHandle { tx },
            state,
            listener,
            power: Mutex::new(PowerState {
                count: 0,
                control: Arc::new(AlwaysOn),
            }),
            worker: Some(worker),
        })
    }

    /// Handle for posting host events.
    pub fn handle(&self) -> AttachHandle {
        self.handle.clone()
    }

    /// Queue a host-controller event.
    ///
    /// # Errors
    ///
    /// Returns error once the task has stopped.
    pub fn post_host_event(&self, event: HostEvent) -> Result<()> {
        self.handle.post_host_event(event)
    }

    /// Current state.
    ///
    /// # Errors
    ///
    /// Returns error if the state lock is poisoned.
    pub fn state(&self) -> Result<AttachState> {
        self.state
            .lock()
            .map(|s| *s)
            .map_err(|_| EdgeTpuError::poisoned("attach state"))
    }

    /// Register who hears about connections and errors.
    ///
    /// # Errors
    ///
    /// Returns error if the listener lock is poisoned.
    pub fn set_listener(&self, listener: Weak<dyn ConnectionListener>) -> Result<()> {
        *self
            .listener
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("attach listener"))? = Some(listener);
        Ok(())
    }

    /// Replace the power switch.
    ///
    /// # Errors
    ///
    /// Returns error if the power lock is poisoned.
    pub fn set_power_control(&self, control: Arc<dyn PowerControl>) -> Result<()> {
        self.power_state()?.control = control;
        Ok(())
    }

    /// Request (`true`) or release (`false`) power.
    ///
    /// # Errors
    ///
    /// Returns the power switch's error; the count is updated regardless.
    pub fn set_power(&self, enable: bool) -> Result<()> {
        let mut power = self.power_state()?;
        if enable {
            power.count += 1;
            if power.count > 1 {
                debug!("Power already on ({} users)", power.count);
                return Ok(());
            }
        } else {
            power.count = power.count.saturating_sub(1);
            if power.count > 0 {
                debug!("Power kept on ({} users)", power.count);
                return Ok(());
            }
        }
        info!("Edge TPU power {}", if enable { "on" } else { "off" });
        power.control.set_power(enable)
    }

    /// True while at least one power request is outstanding.
    ///
    /// # Errors
    ///
    /// Returns error if the power lock is poisoned.
    pub fn get_power(&self) -> Result<bool> {
        Ok(self.power_state()?.count > 0)
    }

    fn power_state(&self) -> Result<std::sync::MutexGuard<'_, PowerState>> {
        self.power
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("attach power"))
    }
}

impl fmt::Debug for AttachTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachTask")
            .field("state", &self.state.lock().ok().map(|s| *s))
            .finish_non_exhaustive()
    }
}

impl Drop for AttachTask {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            // Dropped from a listener callback; the loop cannot wait on itself.
            let _ = self.handle.tx.try_send(Message::Shutdown);
            return;
        }
        let _ = self.handle.tx.send(Message::Shutdown);
        let _ = worker.join();
    }
}

// ── Task thread ─────────────────────────────────────────────────────────────

struct Runner {
    host: Arc<dyn UsbHost>,
    tx: SyncSender<Message>,
    state: Arc<Mutex<AttachState>>,
    listener: SharedListener,
    interface: Option<InterfaceInfo>,
    transport: Option<Arc<dyn UsbTransport>>,
    pipes: Option<PipeSet>,
}

impl Runner {
    fn run(mut self, rx: &Receiver<Message>) {
        for message in rx {
            debug!("attach: {:?}", message);
            match message {
                Message::Shutdown => break,
                Message::Host(event) => self.on_host_event(event),
                Message::Completed { request, result } => self.on_completion(request, result),
            }
            if self.current() == AttachState::Error {
                break;
            }
        }
        debug!("Attach task exiting in {}", self.current());
    }

    fn current(&self) -> AttachState {
        self.state.lock().map_or(AttachState::Error, |s| *s)
    }

    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.listener
            .lock()
            .ok()
            .and_then(|l| l.as_ref().and_then(Weak::upgrade))
    }

    fn on_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Attach(interfaces) => {
                self.interface = find_interface(&interfaces, EDGETPU_CLASS, EDGETPU_SUBCLASS).cloned();
                if self.interface.is_none() {
                    debug!("Attached device has no Edge TPU interface");
                }
            }
            HostEvent::EnumerationDone => {
                if self.interface.is_some() {
                    self.advance(AttachState::Attached);
                } else {
                    self.advance(AttachState::EnumerationFailed);
                }
            }
            HostEvent::Detach => self.advance(AttachState::Unattached),
            HostEvent::TransferFailed { reason } => {
                error!("Host reported transfer failure: {}", reason);
                self.advance(AttachState::Error);
            }
        }
    }

    fn on_completion(&mut self, request: AttachState, result: Result<()>) {
        if request != self.current() {
            debug!("Completion for {} ignored in {}", request, self.current());
            return;
        }
        match result {
            Err(e) => {
                error!("{} failed: {}", request, e);
                self.advance(AttachState::Error);
            }
            Ok(()) if request == AttachState::SetInterface => self.advance(AttachState::GetStatus),
            Ok(()) => warn!("Unexpected completion for {}", request),
        }
    }

    fn advance(&mut self, first: AttachState) {
        let mut next = Some(first);
        while let Some(state) = next {
            if let Ok(mut current) = self.state.lock() {
                *current = state;
            }
            debug!("Attach state -> {}", state);
            next = match self.enter(state) {
                Ok(next) => next,
                Err(e) => {
                    error!("Attach task: {} failed: {}", state, e);
                    Some(AttachState::Error)
                }
            };
        }
    }

    fn enter(&mut self, state: AttachState) -> Result<Option<AttachState>> {
        match state {
            AttachState::Unattached => {
                self.close();
                if let Some(listener) = self.listener() {
                    listener.notify_connected(None);
                }
                Ok(None)
            }
            AttachState::Attached => {
                let interface = self.interface.as_ref().ok_or(EdgeTpuError::NotConnected)?;
                let transport = self.host.open_class(interface)?;
                self.pipes = Some(PipeSet::open(transport.as_ref(), &interface.endpoints)?);
                self.transport = Some(transport);
                Ok(Some(AttachState::SetInterface))
            }
            AttachState::SetInterface => {
                let (interface, transport) = self.connection()?;
                let setup = set_interface_setup(u16::from(interface.number), 0);
                let done = completion_poster(self.tx.clone(), "attach", |result: Result<Bytes>| {
                    Message::Completed {
                        request: AttachState::SetInterface,
                        result: result.map(drop),
                    }
                });
                transport.submit_control(setup, Bytes::new(), done)?;
                if let Some(listener) = self.listener() {
                    listener.notify_connected(Some(Arc::clone(transport)));
                }
                Ok(None)
            }
            AttachState::GetStatus => {
                self.pipes
                    .as_ref()
                    .ok_or(EdgeTpuError::NotConnected)?
                    .status()?;
                Ok(Some(AttachState::Connected))
            }
            AttachState::Connected => {
                info!("Edge TPU connected");
                Ok(None)
            }
            AttachState::EnumerationFailed => {
                warn!("Enumeration finished without an Edge TPU interface");
                Ok(None)
            }
            AttachState::Error => {
                self.close();
                if let Some(listener) = self.listener() {
                    listener.notify_error();
                }
                Ok(None)
            }
        }
    }

    fn connection(&self) -> Result<(&InterfaceInfo, &Arc<dyn UsbTransport>)> {
        match (&self.interface, &self.transport) {
            (Some(interface), Some(transport)) => Ok((interface, transport)),
            _ => Err(EdgeTpuError::NotConnected),
        }
    }

    fn close(&mut self) {
        self.pipes = None;
        if self.transport.take().is_some() {
            if let Some(interface) = &self.interface {
                self.host.close_class(interface);
            }
        }
    }
}
