//! End-to-end tests over the software transport
//!
//! Every layer runs for real; only the device on the far side of the
//! transport is simulated.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use edgetpu_chip::fields::{Csr32, ScuCtrl3};
use edgetpu_chip::{ChipConfig, DescriptorTag, PerformanceMode};
use edgetpu_driver::backends::{
    dfu_configuration, edgetpu_configuration, SimulatedBeagle, SimulatedDfuDevice, SimulatedPlug,
    SoftwareHost, SoftwareTransport,
};
use edgetpu_driver::{
    BulkStream, CsrChannel, DataStream, DfuState, DfuTask, DriverConfig, EdgeTpuError, HostEvent,
    LoadedExecutable, Manager, RegisterAccess, TpuDriver,
};
use edgetpu_models::{DataType, Description, DmaHint, Executable, ExecutableType, Layer, Package};

type Beagle = Arc<SoftwareTransport<SimulatedBeagle>>;

fn beagle() -> Beagle {
    Arc::new(SoftwareTransport::new(SimulatedBeagle::new()).unwrap())
}

fn echo_executable(executable_type: ExecutableType, token: u64) -> Executable {
    Executable {
        instruction_bitstreams: vec![Bytes::from_static(&[0xC0, 0xFF, 0xEE])],
        parameters: Bytes::from(vec![0x5A; 16]),
        dma_hints: vec![
            DmaHint::Instruction { chunk_index: 0 },
            DmaHint::Descriptor {
                desc: Description::InputActivation,
                name: "in".into(),
                offset: 0,
                size: 8,
            },
            DmaHint::Descriptor {
                desc: Description::OutputActivation,
                name: "out".into(),
                offset: 0,
                size: 8,
            },
        ],
        input_layers: vec![Layer::new("in", DataType::FixedPoint8, (1, 1, 8))],
        output_layers: vec![Layer::new("out", DataType::FixedPoint8, (1, 1, 8))],
        executable_type,
        parameter_caching_token: token,
    }
}

fn caching_executable(token: u64) -> Executable {
    Executable {
        instruction_bitstreams: vec![Bytes::from_static(&[0xCA])],
        parameters: Bytes::from(vec![0x11; 32]),
        dma_hints: vec![
            DmaHint::Instruction { chunk_index: 0 },
            DmaHint::Descriptor {
                desc: Description::Parameter,
                name: String::new(),
                offset: 0,
                size: 32,
            },
        ],
        input_layers: Vec::new(),
        output_layers: Vec::new(),
        executable_type: ExecutableType::ParameterCaching,
        parameter_caching_token: token,
    }
}

// ── Bring-up ────────────────────────────────────────────────────────────────

#[test]
fn test_bring_up_max_on_simulated_chip() {
    let transport = beagle();
    let driver = TpuDriver::open(transport.clone(), PerformanceMode::Max, DriverConfig::default()).unwrap();

    let chip = ChipConfig::beagle();
    transport
        .with_model(|sim| {
            let scu3 = <ScuCtrl3 as Csr32>::from_raw(sim.register(chip.scu.scu_ctrl_3) as u32);
            assert_eq!(scu3, PerformanceMode::Max.apply(scu3));
            assert_eq!(scu3.cur_pwr_state(), 0);
            // Every present run-control block ends up running.
            let writes = sim.writes();
            assert_eq!(writes.last().map(|w| w.1), Some(1));
        })
        .unwrap();
    assert!(driver.temperature().is_ok());
}

#[test]
fn test_chip_id_mismatch_stops_before_any_write() {
    let transport = Arc::new(SoftwareTransport::new(SimulatedBeagle::new().with_chip_id(0x1234)).unwrap());
    let err = TpuDriver::open(transport.clone(), PerformanceMode::High, DriverConfig::default()).unwrap_err();
    assert!(matches!(err, EdgeTpuError::ChipIdMismatch { found: 0x1234, .. }));
    transport
        .with_model(|sim| assert!(sim.writes().is_empty()))
        .unwrap();
}

// ── Register channel ────────────────────────────────────────────────────────

#[test]
fn test_late_completion_not_delivered_to_next_read() {
    let transport = beagle();
    transport
        .with_model(|sim| {
            sim.set_register(0x1000, 0x1111);
            sim.set_register(0x2000, 0x2222);
        })
        .unwrap();
    let csr = CsrChannel::new(transport.clone(), Duration::from_millis(200));

    transport.set_completion_delay(Duration::from_millis(300));
    let err = csr.read32(0x1000).unwrap_err();
    assert!(err.is_timeout());

    transport.set_completion_delay(Duration::ZERO);
    assert_eq!(csr.read32(0x2000).unwrap(), 0x2222);
}

// ── Streaming ───────────────────────────────────────────────────────────────

#[test]
fn test_bulk_out_chunking() {
    let transport = beagle();
    let config = DriverConfig::default();
    let stream = BulkStream::new(transport.clone(), &config);
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    stream
        .send(DescriptorTag::Parameters, &Bytes::from(payload.clone()))
        .unwrap();

    transport
        .with_model(|sim| {
            let transfers = sim.bulk_out_log();
            let chunks = payload.len().div_ceil(config.max_bulk_chunk);
            assert_eq!(transfers.len(), chunks + 1);
            assert_eq!(transfers[0].1, 8);
            assert!(transfers[1..].iter().all(|(_, len)| *len <= config.max_bulk_chunk));
            assert_eq!(sim.received(), &[(DescriptorTag::Parameters, payload.clone())]);
        })
        .unwrap();
}

#[test]
fn test_invoke_echoes_input() {
    let transport = beagle();
    let driver = TpuDriver::open(transport.clone(), PerformanceMode::Low, DriverConfig::default()).unwrap();
    let package = Package::from_bytes(Package::encode(&[echo_executable(ExecutableType::StandAlone, 0)])).unwrap();
    let mut loaded = LoadedExecutable::new(package.inference().clone()).unwrap();

    let input = [1, 2, 3, 4, 5, 6, 7, 8];
    let mut outputs = loaded.allocate_outputs();
    let event = driver.invoke(&mut loaded, &input, &mut outputs).unwrap();
    assert_eq!(outputs[0], input);
    assert_eq!(event.tag, DescriptorTag::Instructions as u8);

    transport
        .with_model(|sim| {
            let tags: Vec<DescriptorTag> = sim.received().iter().map(|r| r.0).collect();
            assert_eq!(tags, [DescriptorTag::Instructions, DescriptorTag::InputActivations]);
        })
        .unwrap();
}

// ── DFU ─────────────────────────────────────────────────────────────────────

fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

fn dfu_task(device: SimulatedDfuDevice, len: usize) -> (DfuTask, Arc<SoftwareHost>, Arc<SoftwareTransport<SimulatedDfuDevice>>) {
    let transport = Arc::new(SoftwareTransport::new(device).unwrap());
    let host = Arc::new(SoftwareHost::new(transport.clone()));
    let task = DfuTask::new(host.clone(), firmware(len)).unwrap();
    let handle = task.handle();
    thread::spawn(move || {
        handle.post_host_event(HostEvent::Attach(dfu_configuration())).unwrap();
        handle.post_host_event(HostEvent::EnumerationDone).unwrap();
    });
    (task, host, transport)
}

#[test]
fn test_dfu_downloads_verifies_and_detaches() {
    let (mut task, host, transport) = dfu_task(SimulatedDfuDevice::new(), 10_000);
    let report = task.run(Duration::from_secs(5)).unwrap();

    assert_eq!(report.count(DfuState::Transfer), 40);
    assert_eq!(report.count(DfuState::ZeroLengthTransfer), 1);
    assert_eq!(report.count(DfuState::ReadBack), 40);
    assert_eq!(report.readback_releases, 1);
    assert_eq!(
        &report.history[report.history.len() - 3..],
        &[DfuState::Detach, DfuState::CheckStatus, DfuState::Complete]
    );
    assert_eq!(host.reset_count(), 1);
    assert_eq!(host.reenumeration_count(), 1);

    transport
        .with_model(|dev| {
            assert_eq!(dev.flash(), firmware(10_000).as_slice());
            assert_eq!(dev.count(edgetpu_chip::usb::dfu::DNLOAD), 41);
            assert_eq!(dev.count(edgetpu_chip::usb::dfu::UPLOAD), 40);
            assert!(dev.detached());
        })
        .unwrap();
}

#[test]
fn test_dfu_readback_mismatch_fails() {
    let (mut task, host, transport) = dfu_task(SimulatedDfuDevice::new().corrupt_readback_at(4_321), 10_000);
    let err = task.run(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, EdgeTpuError::FirmwareMismatch { offset: 4_321 }));
    assert_eq!(task.state(), DfuState::Error);
    assert_eq!(task.readback_releases(), 1);
    assert_eq!(host.reset_count(), 0);
    transport
        .with_model(|dev| assert!(!dev.detached()))
        .unwrap();
}

// ── Manager ─────────────────────────────────────────────────────────────────

fn plugged_manager() -> (Arc<Manager>, Beagle) {
    let transport = beagle();
    let host = Arc::new(SoftwareHost::new(transport.clone()));
    let manager = Manager::new(host, DriverConfig::default().with_open_timeout(Duration::from_secs(2))).unwrap();
    let plug = Arc::new(SimulatedPlug::new(manager.attach().handle(), edgetpu_configuration()));
    manager.attach().set_power_control(plug).unwrap();
    (manager, transport)
}

fn caching_runs(transport: &Beagle) -> usize {
    transport
        .with_model(|sim| {
            sim.received()
                .iter()
                .filter(|r| r.0 == DescriptorTag::Parameters)
                .count()
        })
        .unwrap()
}

#[test]
fn test_open_device_shares_context_and_powers_off() {
    let (manager, transport) = plugged_manager();
    let first = manager.open_device(PerformanceMode::High).unwrap();
    let second = manager.open_device_default().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(manager.attach().get_power().unwrap());
    assert!(manager.temperature().unwrap() > 0.0);
    assert_eq!(transport.with_model(|sim| sim.alternate_setting()).unwrap(), Some(0));

    drop(first);
    drop(second);
    assert!(!manager.attach().get_power().unwrap());
    assert!((manager.temperature().unwrap() - edgetpu_driver::NO_DEVICE_TEMPERATURE).abs() < f32::EPSILON);
}

#[test]
fn test_parameter_cache_slots() {
    let (manager, transport) = plugged_manager();
    let _device = manager.open_device(PerformanceMode::Low).unwrap();

    let package = |token| {
        Bytes::from(Package::encode(&[
            caching_executable(token),
            echo_executable(ExecutableType::ExecutionOnly, token),
        ]))
    };
    let a = manager.register_package(package(7)).unwrap();
    let b = manager.register_package(package(7)).unwrap();
    let c = manager.register_package(package(9)).unwrap();
    assert_ne!(a, b);

    let input = [9u8; 8];
    let mut outputs = manager.allocate_outputs(a).unwrap();

    manager.invoke(a, &input, &mut outputs).unwrap();
    assert_eq!(outputs[0], input);
    assert_eq!(caching_runs(&transport), 1);
    assert_eq!(manager.cached_packages().unwrap(), [Some(a), None]);

    manager.invoke(a, &input, &mut outputs).unwrap();
    assert_eq!(caching_runs(&transport), 1);

    manager.invoke(b, &input, &mut outputs).unwrap();
    assert_eq!(caching_runs(&transport), 2);
    assert_eq!(manager.cached_packages().unwrap(), [Some(a), Some(b)]);

    manager.invoke(c, &input, &mut outputs).unwrap();
    assert_eq!(caching_runs(&transport), 3);
    assert_eq!(manager.cached_packages().unwrap(), [Some(c), None]);
}

#[test]
fn test_register_same_buffer_once() {
    let (manager, _) = plugged_manager();
    let bytes = Bytes::from(Package::encode(&[echo_executable(ExecutableType::StandAlone, 0)]));
    let first = manager.register_package(bytes.clone()).unwrap();
    let second = manager.register_package(bytes).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_package_without_inference_rejected() {
    let (manager, _) = plugged_manager();
    let bytes = Package::encode(&[caching_executable(1)]);
    assert!(matches!(
        manager.register_package(bytes),
        Err(EdgeTpuError::Model { .. })
    ));
}
