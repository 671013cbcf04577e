//! Software backend
//!
//! An in-process device behind the [`UsbTransport`] trait. Submissions are
//! queued to a worker thread which runs them against a [`DeviceModel`] and
//! invokes the completion from that thread, so callers see the same
//! asynchronous shape as with libusb.
//!
//! Two models ship with the crate:
//!
//! - [`SimulatedBeagle`]: a register file with the power-state behaviour
//!   bring-up polls for, a temperature sample, and a streaming endpoint
//!   that reassembles header + payload transfers and echoes input
//!   activations back on the output endpoint.
//! - [`SimulatedDfuDevice`]: a flash array driven by DFU class requests.
//!
//! [`SoftwareHost`] plays the host controller for the attach and DFU tasks,
//! and [`SimulatedPlug`] stands in for the board's power switch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use edgetpu_chip::fields::{Csr32, Omc0Dc, ScuCtrl3};
use edgetpu_chip::regs::values;
use edgetpu_chip::run_control;
use edgetpu_chip::usb::{
    self, csr_offset, dfu, endpoint, request_type, Direction, RegisterWidth, SetupPacket,
};
use edgetpu_chip::wire::HEADER_SIZE;
use edgetpu_chip::{ChipConfig, DescriptorTag, EventRecord, StreamHeader};
use tracing::{debug, trace};

use super::worker::{Job, Worker};
use crate::error::{EdgeTpuError, Result};
use crate::host::{HostEvent, InterfaceInfo, UsbHost};
use crate::task::{AttachHandle, PowerControl};
use crate::transport::{Completion, EndpointDescriptor, TransportType, UsbTransport};

/// `bmRequestType` type bits.
const REQUEST_TYPE_MASK: u8 = 0x60;

/// Device side of the software transport.
///
/// Every call runs on the transport's worker thread with the model locked.
pub trait DeviceModel: Debug + Send + 'static {
    /// Called once per endpoint when the pipe set opens.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint does not exist.
    fn open_pipe(&mut self, _endpoint: &EndpointDescriptor) -> Result<()> {
        Ok(())
    }

    /// Handle a control request. `data` is the OUT payload; the returned
    /// bytes are the IN reply.
    ///
    /// # Errors
    ///
    /// Returns error to stall the request.
    fn control(&mut self, setup: &SetupPacket, data: &[u8]) -> Result<Bytes>;

    /// Accept a bulk-out transfer, returning the bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns error to stall the endpoint.
    fn bulk_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize>;

    /// Produce up to `length` bytes for a bulk-in transfer.
    ///
    /// # Errors
    ///
    /// Returns error to stall the endpoint.
    fn bulk_in(&mut self, endpoint: u8, length: usize) -> Result<Bytes>;
}

// ── Transport ───────────────────────────────────────────────────────────────

fn run_job<M: DeviceModel>(model: &Mutex<M>, delay_us: &AtomicU64, job: Job) {
    let delay = delay_us.load(Ordering::Relaxed);
    if delay > 0 {
        thread::sleep(Duration::from_micros(delay));
    }
    let Ok(mut device) = model.lock() else {
        job.fail(EdgeTpuError::poisoned("device model"));
        return;
    };
    match job {
        Job::Control { setup, data, done } => {
            let result = device.control(&setup, &data);
            drop(device);
            done(result);
        }
        Job::BulkOut {
            endpoint,
            data,
            done,
        } => {
            let result = device.bulk_out(endpoint, &data);
            drop(device);
            done(result);
        }
        Job::BulkIn {
            endpoint,
            length,
            done,
        } => {
            let result = device.bulk_in(endpoint, length);
            drop(device);
            done(result);
        }
    }
}

/// [`UsbTransport`] backed by an in-process [`DeviceModel`].
pub struct SoftwareTransport<M> {
    model: Arc<Mutex<M>>,
    worker: Worker,
    delay_us: Arc<AtomicU64>,
    failing_pipes: Mutex<HashSet<u8>>,
}

impl<M: DeviceModel> SoftwareTransport<M> {
    /// Start a worker thread serving `model`.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::Resource`] if the thread cannot be started.
    pub fn new(model: M) -> Result<Self> {
        let model = Arc::new(Mutex::new(model));
        let delay_us = Arc::new(AtomicU64::new(0));
        let worker = {
            let model = Arc::clone(&model);
            let delay_us = Arc::clone(&delay_us);
            Worker::spawn("edgetpu-sim", move |job| run_job(&model, &delay_us, job))?
        };
        debug!("Software transport started");
        Ok(Self {
            model,
            worker,
            delay_us,
            failing_pipes: Mutex::new(HashSet::new()),
        })
    }

    /// Shared handle to the device model.
    pub fn model(&self) -> Arc<Mutex<M>> {
        Arc::clone(&self.model)
    }

    /// Run `f` with the device model locked.
    ///
    /// # Errors
    ///
    /// Returns error if the model lock is poisoned.
    pub fn with_model<T>(&self, f: impl FnOnce(&mut M) -> T) -> Result<T> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("device model"))?;
        Ok(f(&mut model))
    }

    /// Delay every completion by `delay`. Used to provoke timeouts.
    pub fn set_completion_delay(&self, delay: Duration) {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.delay_us.store(micros, Ordering::Relaxed);
    }

    /// Make opening the pipe for `address` fail.
    ///
    /// # Errors
    ///
    /// Returns error if the pipe set lock is poisoned.
    pub fn fail_pipe(&self, address: u8) -> Result<()> {
        self.failing_pipes
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("failing pipes"))?
            .insert(address);
        Ok(())
    }
}

impl<M: DeviceModel> UsbTransport for SoftwareTransport<M> {
    fn open_pipe(&self, endpoint: &EndpointDescriptor) -> Result<()> {
        let refused = self
            .failing_pipes
            .lock()
            .map_err(|_| EdgeTpuError::poisoned("failing pipes"))?
            .contains(&endpoint.address);
        if refused {
            return Err(EdgeTpuError::endpoint_unavailable(endpoint.address, "pipe refused"));
        }
        self.with_model(|model| model.open_pipe(endpoint))?
    }

    fn submit_control(&self, setup: SetupPacket, data: Bytes, done: Completion<Bytes>) -> Result<()> {
        self.worker.submit(Job::Control { setup, data, done })
    }

    fn submit_bulk_out(&self, endpoint: u8, data: Bytes, done: Completion<usize>) -> Result<()> {
        self.worker.submit(Job::BulkOut {
            endpoint,
            data,
            done,
        })
    }

    fn submit_bulk_in(&self, endpoint: u8, length: usize, done: Completion<Bytes>) -> Result<()> {
        self.worker.submit(Job::BulkIn {
            endpoint,
            length,
            done,
        })
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Software
    }
}

impl<M> Debug for SoftwareTransport<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareTransport")
            .field("model", &std::any::type_name::<M>())
            .field("worker", &self.worker)
            .field("delay_us", &self.delay_us.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ── Simulated Beagle ────────────────────────────────────────────────────────

/// One register access seen by [`SimulatedBeagle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrAccess {
    /// Read or write
    pub direction: Direction,
    /// Access width
    pub width: RegisterWidth,
    /// Register offset
    pub offset: u64,
    /// Value read or written
    pub value: u64,
}

/// Simulated Edge TPU in its application personality.
#[derive(Debug)]
pub struct SimulatedBeagle {
    chip: ChipConfig,
    registers: HashMap<u64, u64>,
    temperature_sample: u16,
    csr_log: Vec<CsrAccess>,
    bulk_out_log: Vec<(u8, usize)>,
    pending: Option<StreamHeader>,
    payload: Vec<u8>,
    received: Vec<(DescriptorTag, Vec<u8>)>,
    outfeed: VecDeque<u8>,
    events: u64,
    alternate_setting: Option<u16>,
}

impl SimulatedBeagle {
    /// Sensor sample reported when nothing else is configured (about 51 °C).
    pub const DEFAULT_TEMPERATURE_SAMPLE: u16 = 460;

    /// A Beagle with the expected chip id, awake and idle.
    pub fn new() -> Self {
        let chip = ChipConfig::beagle();
        let mut registers = HashMap::new();
        registers.insert(chip.apex.omc0_00, u64::from(chip.chip_id) << 16);
        Self {
            chip,
            registers,
            temperature_sample: Self::DEFAULT_TEMPERATURE_SAMPLE,
            csr_log: Vec::new(),
            bulk_out_log: Vec::new(),
            pending: None,
            payload: Vec::new(),
            received: Vec::new(),
            outfeed: VecDeque::new(),
            events: 0,
            alternate_setting: None,
        }
    }

    /// Report `chip_id` in `omc0_00`.
    #[must_use]
    pub fn with_chip_id(mut self, chip_id: u16) -> Self {
        self.registers
            .insert(self.chip.apex.omc0_00, u64::from(chip_id) << 16);
        self
    }

    /// Raw `omc0_dc.data` sample the temperature sensor reports.
    pub fn set_temperature_sample(&mut self, sample: u16) {
        self.temperature_sample = sample;
    }

    /// Current value of a register.
    pub fn register(&self, offset: u64) -> u64 {
        self.registers.get(&offset).copied().unwrap_or(0)
    }

    /// Overwrite a register without side effects.
    pub fn set_register(&mut self, offset: u64, value: u64) {
        self.registers.insert(offset, value);
    }

    /// Every register access, oldest first.
    pub fn csr_log(&self) -> &[CsrAccess] {
        &self.csr_log
    }

    /// `(offset, value)` of every register write, oldest first.
    pub fn writes(&self) -> Vec<(u64, u64)> {
        self.csr_log
            .iter()
            .filter(|a| a.direction == Direction::Out)
            .map(|a| (a.offset, a.value))
            .collect()
    }

    /// `(endpoint, length)` of every bulk-out transfer.
    pub fn bulk_out_log(&self) -> &[(u8, usize)] {
        &self.bulk_out_log
    }

    /// Every complete streamed payload, with its tag.
    pub fn received(&self) -> &[(DescriptorTag, Vec<u8>)] {
        &self.received
    }

    /// Alternate setting selected by the last `SET_INTERFACE`.
    pub fn alternate_setting(&self) -> Option<u16> {
        self.alternate_setting
    }

    /// Queue bytes for the output endpoint.
    pub fn push_output(&mut self, data: &[u8]) {
        self.outfeed.extend(data);
    }

    /// Forget every logged access and streamed payload.
    pub fn clear_logs(&mut self) {
        self.csr_log.clear();
        self.bulk_out_log.clear();
        self.received.clear();
    }

    fn read_register(&self, offset: u64) -> u64 {
        let value = self.register(offset);
        if offset == self.chip.apex.omc0_dc {
            let reg = <Omc0Dc as Csr32>::from_raw(truncate(value)).with_data(self.temperature_sample & 0x3FF);
            return u64::from(reg.raw());
        }
        value
    }

    fn write_register(&mut self, offset: u64, value: u64) {
        if offset == self.chip.scu.scu_ctrl_3 {
            let reg = <ScuCtrl3 as Csr32>::from_raw(truncate(value));
            let entering = reg.rg_force_sleep() == values::FORCE_SLEEP_ENTER;
            let state = if entering {
                values::PWR_STATE_SLEEP
            } else {
                values::PWR_STATE_AWAKE
            };
            self.registers
                .insert(offset, u64::from(reg.with_cur_pwr_state(state).raw()));
            if entering {
                self.reset_run_controls();
            }
            return;
        }
        self.registers.insert(offset, value);
    }

    fn reset_run_controls(&mut self) {
        let blocks = run_control::present(&self.chip.scalar_core_run_controls)
            .chain(run_control::present(&self.chip.tile_run_controls));
        for block in blocks {
            self.registers.remove(&block.offset);
        }
    }

    fn csr(&mut self, setup: &SetupPacket, data: &[u8]) -> Result<Bytes> {
        let width = match setup.request {
            1 => RegisterWidth::Bits32,
            0 => RegisterWidth::Bits64,
            other => {
                return Err(EdgeTpuError::protocol(format!("unknown CSR request {other}")));
            }
        };
        let len = usize::from(width.len());
        let offset = csr_offset(setup);
        let direction = setup.direction();
        let value = match direction {
            Direction::In => {
                let value = self.read_register(offset);
                self.log(direction, width, offset, value);
                return Ok(Bytes::copy_from_slice(&value.to_le_bytes()[..len]));
            }
            Direction::Out => {
                if data.len() != len {
                    return Err(EdgeTpuError::protocol(format!(
                        "CSR write {offset:#x} carries {} bytes, expected {len}",
                        data.len()
                    )));
                }
                let mut raw = [0u8; 8];
                raw[..len].copy_from_slice(data);
                u64::from_le_bytes(raw)
            }
        };
        self.log(direction, width, offset, value);
        self.write_register(offset, value);
        Ok(Bytes::new())
    }

    fn log(&mut self, direction: Direction, width: RegisterWidth, offset: u64, value: u64) {
        trace!("sim CSR {:?} {:#x} = {:#x}", direction, offset, value);
        self.csr_log.push(CsrAccess {
            direction,
            width,
            offset,
            value,
        });
    }

    fn finish_payload(&mut self, tag: DescriptorTag) {
        let payload = std::mem::take(&mut self.payload);
        if tag == DescriptorTag::InputActivations {
            self.outfeed.extend(&payload);
        }
        debug!("sim: received {} bytes of {}", payload.len(), tag);
        self.received.push((tag, payload));
    }
}

impl Default for SimulatedBeagle {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceModel for SimulatedBeagle {
    fn control(&mut self, setup: &SetupPacket, data: &[u8]) -> Result<Bytes> {
        if setup.request_type & REQUEST_TYPE_MASK == request_type::TYPE_VENDOR {
            return self.csr(setup, data);
        }
        if setup.request == usb::SET_INTERFACE {
            self.alternate_setting = Some(setup.value);
            return Ok(Bytes::new());
        }
        Err(EdgeTpuError::protocol(format!(
            "unsupported control request {:#04x}/{:#04x}",
            setup.request_type, setup.request
        )))
    }

    fn bulk_out(&mut self, address: u8, data: &[u8]) -> Result<usize> {
        if address != endpoint::out_address(endpoint::SINGLE_BULK_OUT) {
            return Err(EdgeTpuError::endpoint_unavailable(address, "not a streaming endpoint"));
        }
        self.bulk_out_log.push((address, data.len()));

        let Some(header) = self.pending else {
            if data.len() != HEADER_SIZE {
                return Err(EdgeTpuError::protocol(format!(
                    "expected an {HEADER_SIZE}-byte header, got {} bytes",
                    data.len()
                )));
            }
            let header = StreamHeader::decode(data)
                .ok_or_else(|| EdgeTpuError::protocol("malformed streaming header"))?;
            if header.length == 0 {
                self.finish_payload(header.tag);
            } else {
                self.pending = Some(header);
            }
            return Ok(data.len());
        };

        let expected = header.length as usize;
        if self.payload.len() + data.len() > expected {
            return Err(EdgeTpuError::protocol(format!(
                "{} payload overruns its header ({} bytes)",
                header.tag, header.length
            )));
        }
        self.payload.extend_from_slice(data);
        if self.payload.len() == expected {
            self.pending = None;
            self.finish_payload(header.tag);
        }
        Ok(data.len())
    }

    fn bulk_in(&mut self, address: u8, length: usize) -> Result<Bytes> {
        if address == endpoint::in_address(endpoint::SINGLE_BULK_OUT) {
            let take = length.min(self.outfeed.len());
            let mut out: Vec<u8> = self.outfeed.drain(..take).collect();
            out.resize(length, 0);
            return Ok(Bytes::from(out));
        }
        if address == endpoint::in_address(endpoint::EVENT_IN) {
            let event = EventRecord {
                address: self.events,
                length: 0,
                tag: DescriptorTag::Instructions.value(),
            };
            self.events += 1;
            return Ok(Bytes::copy_from_slice(&event.encode()));
        }
        Err(EdgeTpuError::endpoint_unavailable(address, "no data source"))
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn truncate(value: u64) -> u32 {
    value as u32
}

// ── Simulated DFU device ────────────────────────────────────────────────────

/// `bState` values reported by [`SimulatedDfuDevice`].
mod dfu_state {
    pub const IDLE: u8 = 2;
    pub const DNLOAD_IDLE: u8 = 5;
    pub const MANIFEST: u8 = 7;
    pub const UPLOAD_IDLE: u8 = 9;
}

/// Simulated Edge TPU in its DFU personality.
#[derive(Debug, Default)]
pub struct SimulatedDfuDevice {
    flash: Vec<u8>,
    state: u8,
    manifested: bool,
    detached: bool,
    corrupt_at: Option<usize>,
    requests: Vec<(u8, u16, usize)>,
}

impl SimulatedDfuDevice {
    /// Empty flash in `dfuIDLE`.
    pub fn new() -> Self {
        Self {
            state: dfu_state::IDLE,
            ..Self::default()
        }
    }

    /// Flip every bit of the byte at `offset` on upload.
    #[must_use]
    pub fn corrupt_readback_at(mut self, offset: usize) -> Self {
        self.corrupt_at = Some(offset);
        self
    }

    /// Flash contents written so far.
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// True once the zero-length download arrived.
    pub fn manifested(&self) -> bool {
        self.manifested
    }

    /// True once `DFU_DETACH` arrived.
    pub fn detached(&self) -> bool {
        self.detached
    }

    /// `(bRequest, wValue, payload or reply length)` of every class request.
    pub fn requests(&self) -> &[(u8, u16, usize)] {
        &self.requests
    }

    /// Number of class requests with `bRequest == request`.
    pub fn count(&self, request: u8) -> usize {
        self.requests.iter().filter(|r| r.0 == request).count()
    }

    fn upload(&self, block: u16, length: usize) -> Bytes {
        let start = usize::from(block) * dfu::TRANSFER_UNIT;
        let end = (start + length).min(self.flash.len());
        if start >= end {
            return Bytes::new();
        }
        let mut out = self.flash[start..end].to_vec();
        if let Some(at) = self.corrupt_at.filter(|at| (start..end).contains(at)) {
            out[at - start] ^= 0xFF;
        }
        Bytes::from(out)
    }
}

impl DeviceModel for SimulatedDfuDevice {
    fn control(&mut self, setup: &SetupPacket, data: &[u8]) -> Result<Bytes> {
        if setup.request_type & REQUEST_TYPE_MASK != request_type::TYPE_CLASS {
            if setup.request == usb::SET_INTERFACE {
                return Ok(Bytes::new());
            }
            return Err(EdgeTpuError::protocol(format!(
                "DFU device got non-class request {:#04x}",
                setup.request
            )));
        }

        let reply = match setup.request {
            dfu::DETACH => {
                self.detached = true;
                Bytes::new()
            }
            dfu::DNLOAD if data.is_empty() => {
                self.manifested = true;
                self.state = dfu_state::MANIFEST;
                Bytes::new()
            }
            dfu::DNLOAD => {
                let start = usize::from(setup.value) * dfu::TRANSFER_UNIT;
                if self.flash.len() < start + data.len() {
                    self.flash.resize(start + data.len(), 0xFF);
                }
                self.flash[start..start + data.len()].copy_from_slice(data);
                self.state = dfu_state::DNLOAD_IDLE;
                Bytes::new()
            }
            dfu::UPLOAD => {
                self.state = dfu_state::UPLOAD_IDLE;
                self.upload(setup.value, usize::from(setup.length))
            }
            dfu::GETSTATUS => {
                let status = dfu::StatusRecord {
                    state: self.state,
                    ..dfu::StatusRecord::default()
                };
                Bytes::copy_from_slice(&status.to_bytes())
            }
            dfu::GETSTATE => Bytes::copy_from_slice(&[self.state]),
            dfu::CLRSTATUS | dfu::ABORT => {
                self.state = dfu_state::IDLE;
                Bytes::new()
            }
            other => {
                return Err(EdgeTpuError::protocol(format!("unknown DFU request {other}")));
            }
        };
        let len = if data.is_empty() { reply.len() } else { data.len() };
        self.requests.push((setup.request, setup.value, len));
        Ok(reply)
    }

    fn bulk_out(&mut self, address: u8, _data: &[u8]) -> Result<usize> {
        Err(EdgeTpuError::endpoint_unavailable(address, "DFU interface has no bulk pipes"))
    }

    fn bulk_in(&mut self, address: u8, _length: usize) -> Result<Bytes> {
        Err(EdgeTpuError::endpoint_unavailable(address, "DFU interface has no bulk pipes"))
    }
}

// ── Host ────────────────────────────────────────────────────────────────────

/// [`UsbHost`] handing out one pre-built transport.
pub struct SoftwareHost {
    transport: Arc<dyn UsbTransport>,
    fail_open: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
    resets: AtomicUsize,
    reenumerations: AtomicUsize,
}

impl SoftwareHost {
    /// Host whose class driver is always `transport`.
    pub fn new(transport: Arc<dyn UsbTransport>) -> Self {
        Self {
            transport,
            fail_open: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            reenumerations: AtomicUsize::new(0),
        }
    }

    /// Make `open_class` fail from now on.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Relaxed);
    }

    /// Times a class driver was opened.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Times a class driver was closed.
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::Relaxed)
    }

    /// Times the bus was reset.
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::Relaxed)
    }

    /// Times re-enumeration was requested.
    pub fn reenumeration_count(&self) -> usize {
        self.reenumerations.load(Ordering::Relaxed)
    }
}

impl Debug for SoftwareHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareHost")
            .field("transport", &self.transport)
            .field("opened", &self.open_count())
            .finish_non_exhaustive()
    }
}

impl UsbHost for SoftwareHost {
    fn open_class(&self, interface: &InterfaceInfo) -> Result<Arc<dyn UsbTransport>> {
        if self.fail_open.load(Ordering::Relaxed) {
            return Err(EdgeTpuError::transfer_failed(format!(
                "class init refused for interface {}",
                interface.number
            )));
        }
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(&self.transport))
    }

    fn close_class(&self, _interface: &InterfaceInfo) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn reset_bus(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn request_reenumeration(&self) -> Result<()> {
        self.reenumerations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Power switch that plugs a simulated device in when powered and pulls it
/// when not.
#[derive(Debug)]
pub struct SimulatedPlug {
    attach: AttachHandle,
    interfaces: Vec<InterfaceInfo>,
}

impl SimulatedPlug {
    /// Report `interfaces` to `attach` on every power-up.
    pub fn new(attach: AttachHandle, interfaces: Vec<InterfaceInfo>) -> Self {
        Self { attach, interfaces }
    }
}

impl PowerControl for SimulatedPlug {
    fn set_power(&self, on: bool) -> Result<()> {
        if on {
            self.attach
                .post_host_event(HostEvent::Attach(self.interfaces.clone()))?;
            self.attach.post_host_event(HostEvent::EnumerationDone)
        } else {
            self.attach.post_host_event(HostEvent::Detach)
        }
    }
}

/// Configuration an Edge TPU in application mode reports.
pub fn edgetpu_configuration() -> Vec<InterfaceInfo> {
    vec![InterfaceInfo {
        vendor_id: usb::EDGETPU_VID,
        product_id: usb::EDGETPU_PID,
        number: 0,
        class: usb::EDGETPU_CLASS,
        subclass: usb::EDGETPU_SUBCLASS,
        endpoints: EndpointDescriptor::edgetpu_interface(),
    }]
}

/// Configuration an Edge TPU in DFU mode reports.
pub fn dfu_configuration() -> Vec<InterfaceInfo> {
    vec![InterfaceInfo {
        vendor_id: usb::DFU_VID,
        product_id: usb::DFU_PID,
        number: 0,
        class: usb::DFU_CLASS,
        subclass: usb::DFU_SUBCLASS,
        endpoints: Vec::new(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CompletionChannel;

    fn bulk_out(model: &mut SimulatedBeagle, data: &[u8]) -> Result<usize> {
        model.bulk_out(endpoint::out_address(1), data)
    }

    #[test]
    fn test_beagle_power_state_follows_force_sleep() {
        let mut sim = SimulatedBeagle::new();
        let offset = sim.chip.scu.scu_ctrl_3;
        let sleep = ScuCtrl3::new().with_rg_force_sleep(values::FORCE_SLEEP_ENTER);
        sim.write_register(offset, u64::from(sleep.raw()));
        let reg = <ScuCtrl3 as Csr32>::from_raw(truncate(sim.register(offset)));
        assert_eq!(reg.cur_pwr_state(), values::PWR_STATE_SLEEP);

        let wake = reg.with_rg_force_sleep(values::FORCE_SLEEP_EXIT);
        sim.write_register(offset, u64::from(wake.raw()));
        let reg = <ScuCtrl3 as Csr32>::from_raw(truncate(sim.register(offset)));
        assert_eq!(reg.cur_pwr_state(), values::PWR_STATE_AWAKE);
    }

    #[test]
    fn test_beagle_reset_clears_run_controls() {
        let mut sim = SimulatedBeagle::new();
        let scalar = sim.chip.scalar_core_run_controls[0].offset;
        sim.set_register(scalar, 1);
        let sleep = ScuCtrl3::new().with_rg_force_sleep(values::FORCE_SLEEP_ENTER);
        sim.write_register(sim.chip.scu.scu_ctrl_3, u64::from(sleep.raw()));
        assert_eq!(sim.register(scalar), 0);
    }

    #[test]
    fn test_beagle_temperature_overlay() {
        let mut sim = SimulatedBeagle::new();
        sim.set_temperature_sample(662);
        let reg = <Omc0Dc as Csr32>::from_raw(truncate(sim.read_register(sim.chip.apex.omc0_dc)));
        assert_eq!(reg.millicelsius(), 550);
    }

    #[test]
    fn test_beagle_reassembles_stream() {
        let mut sim = SimulatedBeagle::new();
        let header = StreamHeader::new(DescriptorTag::InputActivations, 5).encode();
        bulk_out(&mut sim, &header).unwrap();
        bulk_out(&mut sim, &[1, 2, 3]).unwrap();
        bulk_out(&mut sim, &[4, 5]).unwrap();
        assert_eq!(sim.received(), &[(DescriptorTag::InputActivations, vec![1, 2, 3, 4, 5])]);

        let out = sim.bulk_in(endpoint::in_address(1), 8).unwrap();
        assert_eq!(&out[..], &[1, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn test_beagle_rejects_overrun() {
        let mut sim = SimulatedBeagle::new();
        let header = StreamHeader::new(DescriptorTag::Parameters, 2).encode();
        bulk_out(&mut sim, &header).unwrap();
        assert!(bulk_out(&mut sim, &[0; 3]).is_err());
    }

    #[test]
    fn test_dfu_upload_corruption() {
        let mut dev = SimulatedDfuDevice::new().corrupt_readback_at(300);
        let image: Vec<u8> = (0..=255u8).chain(0..=255u8).collect();
        for (block, chunk) in image.chunks(dfu::TRANSFER_UNIT).enumerate() {
            let setup = dfu::out_setup(dfu::DNLOAD, u16::try_from(block).unwrap(), 0, 0);
            dev.control(&setup, chunk).unwrap();
        }
        let first = dev.control(&dfu::in_setup(dfu::UPLOAD, 0, 0, 256), &[]).unwrap();
        assert_eq!(&first[..], &image[..256]);
        let second = dev.control(&dfu::in_setup(dfu::UPLOAD, 1, 0, 256), &[]).unwrap();
        assert_eq!(second[44], image[300] ^ 0xFF);
        assert_eq!(dev.count(dfu::DNLOAD), 2);
    }

    #[test]
    fn test_transport_completes_on_worker() {
        let transport = SoftwareTransport::new(SimulatedBeagle::new()).unwrap();
        let channel = CompletionChannel::<Bytes>::new("test");
        let setup = usb::csr_setup(0x1a000, RegisterWidth::Bits32, Direction::In);
        let reply = channel
            .transact(Duration::from_millis(500), |done| {
                transport.submit_control(setup, Bytes::new(), done)
            })
            .unwrap();
        assert_eq!(&reply[..], &0x089A_0000u32.to_le_bytes());
    }

    #[test]
    fn test_transport_refuses_failing_pipe() {
        let transport = SoftwareTransport::new(SimulatedBeagle::new()).unwrap();
        transport.fail_pipe(0x83).unwrap();
        let interrupt = EndpointDescriptor::edgetpu_interface()[5];
        assert!(transport.open_pipe(&interrupt).is_err());
    }
}
