//! Per-accelerator manager
//!
//! Owns the attach task, the registered packages and the parameter cache.
//! Device contexts are shared: [`Manager::open_device`] hands out the live
//! one if it exists, and dropping the last clone releases power.
//!
//! Parameter caching keeps up to two packages' parameters resident on the
//! chip as long as they share one caching token. A package with a new
//! token evicts everything.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use edgetpu_chip::{EventRecord, PerformanceMode};
use edgetpu_models::Package;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::driver::TpuDriver;
use crate::error::{EdgeTpuError, Result};
use crate::executable::LoadedExecutable;
use crate::host::UsbHost;
use crate::task::{AttachTask, ConnectionListener};
use crate::transport::UsbTransport;

/// Temperature reported while no device is open.
pub const NO_DEVICE_TEMPERATURE: f32 = -276.88;

/// Packages whose parameters can be resident at once.
const CACHE_SLOTS: usize = 2;

/// Identity of a registered package buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageId {
    address: usize,
    len: usize,
}

impl PackageId {
    fn of(bytes: &Bytes) -> Self {
        Self {
            address: bytes.as_ptr() as usize,
            len: bytes.len(),
        }
    }
}

/// A package split into its inference and parameter-caching executables.
#[derive(Debug)]
struct RegisteredPackage {
    inference: LoadedExecutable,
    caching: Option<LoadedExecutable>,
}

impl RegisteredPackage {
    fn from_package(package: &Package) -> Result<Self> {
        Ok(Self {
            inference: LoadedExecutable::new(package.inference().clone())?,
            caching: package
                .parameter_caching()
                .cloned()
                .map(LoadedExecutable::new)
                .transpose()?,
        })
    }

    fn caching_token(&self) -> Option<u64> {
        self.caching
            .as_ref()
            .map(|c| c.executable().parameter_caching_token)
    }
}

#[derive(Debug, Default)]
struct Execution {
    packages: HashMap<PackageId, RegisteredPackage>,
    current_token: u64,
    slots: [Option<PackageId>; CACHE_SLOTS],
}

#[derive(Default)]
struct Connection {
    transport: Option<Arc<dyn UsbTransport>>,
    failed: bool,
}

/// Releases one power reference when dropped.
struct PowerRef {
    attach: Arc<AttachTask>,
}

impl PowerRef {
    fn acquire(attach: &Arc<AttachTask>) -> Result<Self> {
        attach.set_power(true)?;
        Ok(Self {
            attach: Arc::clone(attach),
        })
    }
}

impl Drop for PowerRef {
    fn drop(&mut self) {
        if let Err(e) = self.attach.set_power(false) {
            warn!("Power release failed: {}", e);
        }
    }
}

/// An open, initialized accelerator. Power stays on while any clone lives.
pub struct DeviceContext {
    driver: TpuDriver,
    mode: PerformanceMode,
    _power: PowerRef,
}

impl DeviceContext {
    /// Driver for the open device.
    pub const fn driver(&self) -> &TpuDriver {
        &self.driver
    }

    /// Mode the device was brought up in.
    pub const fn mode(&self) -> PerformanceMode {
        self.mode
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("driver", &self.driver)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Package registry, parameter cache and device lifetime for one accelerator.
pub struct Manager {
    config: DriverConfig,
    attach: Arc<AttachTask>,
    connection: Mutex<Connection>,
    connected: Condvar,
    device: Mutex<Weak<DeviceContext>>,
    execution: Mutex<Execution>,
}

impl Manager {
    /// Manager for the accelerator `host` reports. Starts the attach task
    /// and registers itself as its listener.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the attach task
    /// cannot start.
    pub fn new(host: Arc<dyn UsbHost>, config: DriverConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let manager = Arc::new(Self {
            config,
            attach: Arc::new(AttachTask::spawn(host)?),
            connection: Mutex::new(Connection::default()),
            connected: Condvar::new(),
            device: Mutex::new(Weak::new()),
            execution: Mutex::new(Execution::default()),
        });
        let listener: Weak<dyn ConnectionListener> = Arc::downgrade(&manager) as Weak<Manager>;
        manager.attach.set_listener(listener)?;
        Ok(manager)
    }

    /// The attach task, for posting host events and installing a power
    /// switch.
    pub fn attach(&self) -> &AttachTask {
        &self.attach
    }

    /// Configuration in effect.
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    // ── Packages ────────────────────────────────────────────────────────

    /// Decode and remember `package`. Registering the same buffer again
    /// returns the existing id without decoding.
    ///
    /// # Errors
    ///
    /// Returns a model error if the package is malformed or has no
    /// inference executable.
    pub fn register_package(&self, package: impl Into<Bytes>) -> Result<PackageId> {
        let bytes = package.into();
        let id = PackageId::of(&bytes);
        let mut execution = self.execution()?;
        if execution.packages.contains_key(&id) {
            return Ok(id);
        }
        let registered = RegisteredPackage::from_package(&Package::from_bytes(bytes)?)?;
        debug!(
            "Registered package {:?} (parameter caching: {})",
            id,
            registered.caching.is_some()
        );
        execution.packages.insert(id, registered);
        Ok(id)
    }

    /// Run the package's inference executable on the open device, loading
    /// its cached parameters first if they are not resident.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::NotConnected`] without an open device,
    /// [`EdgeTpuError::InvalidArgument`] for an unknown package, or the
    /// first streaming failure.
    pub fn invoke<O: AsMut<[u8]>>(&self, package: PackageId, input: &[u8], outputs: &mut [O]) -> Result<EventRecord> {
        let device = self.live_device()?.ok_or(EdgeTpuError::NotConnected)?;
        let stream = device.driver().stream();

        let mut execution = self.execution()?;
        let Execution {
            packages,
            current_token,
            slots,
        } = &mut *execution;
        let registered = packages
            .get_mut(&package)
            .ok_or_else(|| EdgeTpuError::invalid_argument(format!("package {package:?} is not registered")))?;

        match (registered.caching_token(), registered.caching.as_mut()) {
            (Some(token), Some(caching)) => {
                let slot = if token != *current_token {
                    debug!("Caching token {:#x} replaces {:#x}", token, *current_token);
                    *slots = [None; CACHE_SLOTS];
                    Some(0)
                } else if slots.contains(&Some(package)) {
                    None
                } else if let Some(free) = slots.iter().position(Option::is_none) {
                    Some(free)
                } else {
                    debug!("Parameter cache full; evicting");
                    *slots = [None; CACHE_SLOTS];
                    Some(0)
                };
                if let Some(slot) = slot {
                    let mut none: [Vec<u8>; 0] = [];
                    caching.invoke(stream, input, &mut none)?;
                    *current_token = token;
                    slots[slot] = Some(package);
                }
            }
            _ => *current_token = 0,
        }

        registered.inference.invoke(stream, input, outputs)
    }

    /// Output buffers sized for the package's inference executable.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::InvalidArgument`] for an unknown package.
    pub fn allocate_outputs(&self, package: PackageId) -> Result<Vec<Vec<u8>>> {
        self.execution()?
            .packages
            .get(&package)
            .map(|p| p.inference.allocate_outputs())
            .ok_or_else(|| EdgeTpuError::invalid_argument(format!("package {package:?} is not registered")))
    }

    /// Packages whose parameters are currently resident, by slot.
    ///
    /// # Errors
    ///
    /// Returns error if the execution lock is poisoned.
    pub fn cached_packages(&self) -> Result<[Option<PackageId>; CACHE_SLOTS]> {
        Ok(self.execution()?.slots)
    }

    // ── Device ──────────────────────────────────────────────────────────

    /// Open the device in [`DriverConfig::performance_mode`].
    ///
    /// # Errors
    ///
    /// See [`Manager::open_device`].
    pub fn open_device_default(&self) -> Result<Arc<DeviceContext>> {
        self.open_device(self.config.performance_mode)
    }

    /// Shared context for the device. If none is live, power the device
    /// on, wait for the attach task to connect it and run bring-up at
    /// `mode`. A live context is returned as-is, whatever its mode.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::Timeout`] if no transport connects within
    /// the open timeout, [`EdgeTpuError::InvalidState`] if the attach task
    /// failed, or the bring-up error. Power is released on failure.
    pub fn open_device(&self, mode: PerformanceMode) -> Result<Arc<DeviceContext>> {
        let mut device = self
            .device
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("manager device"))?;
        if let Some(live) = device.upgrade() {
            return Ok(live);
        }

        let power = PowerRef::acquire(&self.attach)?;
        let transport = self.wait_for_transport()?;
        let driver = TpuDriver::open(transport, mode, self.config.clone())?;
        info!("Device opened in {} mode", mode);

        let context = Arc::new(DeviceContext {
            driver,
            mode,
            _power: power,
        });
        *device = Arc::downgrade(&context);
        Ok(context)
    }

    /// Die temperature, or [`NO_DEVICE_TEMPERATURE`] if no device is open.
    ///
    /// # Errors
    ///
    /// Returns error if the sensor cannot be read on an open device.
    pub fn temperature(&self) -> Result<f32> {
        match self.live_device()? {
            Some(device) => device.driver().temperature(),
            None => Ok(NO_DEVICE_TEMPERATURE),
        }
    }

    fn live_device(&self) -> Result<Option<Arc<DeviceContext>>> {
        Ok(self
            .device
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("manager device"))?
            .upgrade())
    }

    fn wait_for_transport(&self) -> Result<Arc<dyn UsbTransport>> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("manager connection"))?;
        let (connection, _) = self
            .connected
            .wait_timeout_while(connection, self.config.open_timeout, |c| {
                c.transport.is_none() && !c.failed
            })
            .map_err(|_| EdgeTpuError::poisoned("manager connection"))?;
        if connection.failed {
            return Err(EdgeTpuError::invalid_state("attach task failed"));
        }
        match &connection.transport {
            Some(transport) => Ok(Arc::clone(transport)),
            None => Err(EdgeTpuError::timeout(self.config.open_timeout)),
        }
    }

    fn execution(&self) -> Result<MutexGuard<'_, Execution>> {
        self.execution
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("manager execution"))
    }
}

impl ConnectionListener for Manager {
    fn notify_connected(&self, transport: Option<Arc<dyn UsbTransport>>) {
        match &transport {
            Some(t) => info!("Transport connected: {}", t.transport_type()),
            None => info!("Transport disconnected"),
        }
        if let Ok(mut connection) = self.connection.lock() {
            connection.transport = transport;
        }
        self.connected.notify_all();
    }

    fn notify_error(&self) {
        warn!("Attach task reported an error");
        if let Ok(mut connection) = self.connection.lock() {
            connection.failed = true;
            connection.transport = None;
        }
        self.connected.notify_all();
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("attach", &self.attach)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimulatedBeagle, SoftwareHost, SoftwareTransport};
    use std::time::Duration;

    fn manager() -> Arc<Manager> {
        let transport = Arc::new(SoftwareTransport::new(SimulatedBeagle::new()).unwrap());
        let host = Arc::new(SoftwareHost::new(transport));
        Manager::new(host, DriverConfig::default().with_open_timeout(Duration::from_millis(50))).unwrap()
    }

    #[test]
    fn test_temperature_without_device() {
        let manager = manager();
        assert!((manager.temperature().unwrap() - NO_DEVICE_TEMPERATURE).abs() < f32::EPSILON);
    }

    #[test]
    fn test_open_times_out_without_attach() {
        let manager = manager();
        let err = manager.open_device(PerformanceMode::Low).unwrap_err();
        assert!(err.is_timeout());
        // The failed open released its power reference.
        assert!(!manager.attach().get_power().unwrap());
    }

    #[test]
    fn test_invoke_without_device() {
        let manager = manager();
        let mut outputs: Vec<Vec<u8>> = Vec::new();
        let id = PackageId { address: 1, len: 1 };
        assert!(matches!(
            manager.invoke(id, &[], &mut outputs),
            Err(EdgeTpuError::NotConnected)
        ));
    }

    #[test]
    fn test_register_rejects_garbage() {
        let manager = manager();
        assert!(manager.register_package(vec![0u8; 3]).is_err());
    }
}
