//! `edgetpu`: command-line interface for the Edge TPU USB driver.
//!
//! ```text
//! USAGE:
//!   edgetpu inspect <package>                 Decode a compiled package
//!   edgetpu simulate [--mode M]               Run the full stack on simulated devices
//!   edgetpu enumerate                         List accelerators on the USB bus
//!   edgetpu temperature [--mode M]            Bring up and read the die temperature
//!   edgetpu invoke <package> <input> [--mode M] [--output F]
//!   edgetpu dfu <firmware>                    Download firmware to a DFU-mode device
//! ```
//!
//! Hardware commands need a build with `--features usb`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use edgetpu_chip::PerformanceMode;
use edgetpu_driver::backends::{
    dfu_configuration, edgetpu_configuration, SimulatedBeagle, SimulatedDfuDevice, SimulatedPlug,
    SoftwareHost, SoftwareTransport,
};
use edgetpu_driver::{DfuState, DfuTask, DriverConfig, HostEvent, Manager};
use edgetpu_models::{
    DataType, Description, DmaHint, Executable, ExecutableType, Layer, Package,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "edgetpu", about = "Edge TPU USB driver CLI", version)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Decode a compiled package and print its executables.
    Inspect {
        /// Package file.
        package: PathBuf,
    },
    /// Bring up a simulated chip, run an echo model and a simulated firmware download.
    Simulate {
        /// Performance mode (low, medium, high, max).
        #[arg(long, default_value = "high")]
        mode: PerformanceMode,
    },
    /// List Edge TPUs on the USB bus.
    Enumerate,
    /// Bring the device up and print its die temperature.
    Temperature {
        /// Performance mode (low, medium, high, max).
        #[arg(long, default_value = "high")]
        mode: PerformanceMode,
    },
    /// Run one inference.
    Invoke {
        /// Package file.
        package: PathBuf,
        /// Raw input tensor.
        input: PathBuf,
        /// Performance mode (low, medium, high, max).
        #[arg(long, default_value = "high")]
        mode: PerformanceMode,
        /// Write the outputs, concatenated, to this file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Download firmware to a device in DFU mode.
    Dfu {
        /// Firmware image.
        firmware: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Cmd::Inspect { package } => cmd_inspect(&package)?,
        Cmd::Simulate { mode } => cmd_simulate(mode)?,
        Cmd::Enumerate => hardware::enumerate()?,
        Cmd::Temperature { mode } => hardware::temperature(mode)?,
        Cmd::Invoke {
            package,
            input,
            mode,
            output,
        } => hardware::invoke(&package, &input, mode, output.as_deref())?,
        Cmd::Dfu { firmware } => hardware::dfu(&firmware)?,
    }

    Ok(())
}

// ── inspect ─────────────────────────────────────────────────────────────────

fn cmd_inspect(path: &Path) -> Result<()> {
    let package = Package::from_file(path).with_context(|| format!("decoding {}", path.display()))?;

    println!("Package      : {} ({} bytes)", path.display(), package.as_bytes().len());
    println!("Executables  : {}", package.executables().len());
    for (i, exe) in package.executables().iter().enumerate() {
        println!();
        println!("[{i}] {:?}", exe.executable_type);
        if exe.executable_type == ExecutableType::ParameterCaching || exe.parameter_caching_token != 0 {
            println!("     Caching token  {:#018x}", exe.parameter_caching_token);
        }
        let bitstream_bytes: usize = exe.instruction_bitstreams.iter().map(Bytes::len).sum();
        println!(
            "     Instructions   {} chunks, {} bytes",
            exe.instruction_bitstreams.len(),
            bitstream_bytes
        );
        println!("     Parameters     {} bytes", exe.parameters.len());
        println!("     DMA hints      {}", exe.dma_hints.len());
        for layer in &exe.input_layers {
            print_layer("in ", layer);
        }
        for layer in &exe.output_layers {
            print_layer("out", layer);
        }
    }
    Ok(())
}

fn print_layer(direction: &str, layer: &Layer) {
    println!(
        "     {direction} {:<16} {:?} {}x{}x{} ({} bytes{})",
        layer.name,
        layer.data_type,
        layer.y_dim,
        layer.x_dim,
        layer.z_dim,
        layer.size_bytes,
        if layer.layout.is_some() { ", tiled" } else { "" }
    );
}

// ── simulate ────────────────────────────────────────────────────────────────

const DEMO_TENSOR: usize = 64;
const DEMO_FIRMWARE: usize = 10_000;

fn demo_package() -> Bytes {
    let executable = Executable {
        instruction_bitstreams: vec![Bytes::from_static(&[0xC0, 0xDE])],
        parameters: Bytes::new(),
        dma_hints: vec![
            DmaHint::Instruction { chunk_index: 0 },
            DmaHint::Descriptor {
                desc: Description::InputActivation,
                name: "input".into(),
                offset: 0,
                size: DEMO_TENSOR,
            },
            DmaHint::Descriptor {
                desc: Description::OutputActivation,
                name: "output".into(),
                offset: 0,
                size: DEMO_TENSOR,
            },
        ],
        input_layers: vec![Layer::new("input", DataType::FixedPoint8, (1, 1, DEMO_TENSOR))],
        output_layers: vec![Layer::new("output", DataType::FixedPoint8, (1, 1, DEMO_TENSOR))],
        executable_type: ExecutableType::StandAlone,
        parameter_caching_token: 0,
    };
    Bytes::from(Package::encode(&[executable]))
}

fn cmd_simulate(mode: PerformanceMode) -> Result<()> {
    let config = DriverConfig::from_env()?.with_performance_mode(mode);

    println!("Simulated Beagle ({mode} mode)");
    let transport = Arc::new(SoftwareTransport::new(SimulatedBeagle::new())?);
    let host = Arc::new(SoftwareHost::new(transport.clone()));
    let manager = Manager::new(host, config)?;
    manager.attach().set_power_control(Arc::new(SimulatedPlug::new(
        manager.attach().handle(),
        edgetpu_configuration(),
    )))?;

    let device = manager.open_device_default()?;
    println!("  Bring-up     ok");
    println!("  Temperature  {:.2} °C", manager.temperature()?);

    let package = manager.register_package(demo_package())?;
    let input: Vec<u8> = (0..DEMO_TENSOR).map(|i| (i * 3) as u8).collect();
    let mut outputs = manager.allocate_outputs(package)?;
    let event = manager.invoke(package, &input, &mut outputs)?;
    println!(
        "  Invoke       {} bytes out, event tag {}, echo {}",
        outputs[0].len(),
        event.tag,
        if outputs[0] == input { "matches" } else { "DIFFERS" }
    );
    let register_writes = transport.with_model(|sim| sim.writes().len())?;
    println!("  CSR writes   {register_writes}");
    drop(device);

    println!();
    println!("Simulated DFU device");
    let dfu_transport = Arc::new(SoftwareTransport::new(SimulatedDfuDevice::new())?);
    let dfu_host = Arc::new(SoftwareHost::new(dfu_transport));
    let image: Vec<u8> = (0..DEMO_FIRMWARE).map(|i| (i % 251) as u8).collect();
    let mut task = DfuTask::new(dfu_host, image)?;
    let handle = task.handle();
    handle.post_host_event(HostEvent::Attach(dfu_configuration()))?;
    handle.post_host_event(HostEvent::EnumerationDone)?;
    let report = task.run(Duration::from_secs(5))?;
    println!(
        "  Download     {} bytes, {} blocks, {} readbacks",
        report.bytes,
        report.count(DfuState::Transfer),
        report.count(DfuState::ReadBack)
    );
    println!("  Final state  {}", task.state());
    info!("Simulation finished");
    Ok(())
}

// ── hardware ────────────────────────────────────────────────────────────────

#[cfg(feature = "usb")]
mod hardware {
    use std::path::Path;
    use std::sync::Arc;

    use anyhow::{anyhow, Context, Result};
    use edgetpu_chip::PerformanceMode;
    use edgetpu_driver::backends::{self, LibusbHost, UsbDevice, UsbDeviceKind};
    use edgetpu_driver::{DfuState, DfuTask, DriverConfig, Manager};
    use tracing::info;

    fn find(kind: UsbDeviceKind) -> Result<UsbDevice> {
        backends::enumerate()?
            .into_iter()
            .find(|d| d.kind == kind)
            .ok_or_else(|| anyhow!("no Edge TPU in {kind:?} mode on the bus"))
    }

    fn manager(config: &DriverConfig) -> Result<Arc<Manager>> {
        let device = find(UsbDeviceKind::Application)?;
        let events = device.attach_events()?;
        info!("Using {}", device);
        let host = Arc::new(LibusbHost::new(device, config.clone()));
        let manager = Manager::new(host, config.clone())?;
        for event in events {
            manager.attach().post_host_event(event)?;
        }
        Ok(manager)
    }

    pub fn enumerate() -> Result<()> {
        let devices = backends::enumerate()?;
        println!("Edge TPU devices: {}", devices.len());
        for device in &devices {
            println!("  {device}");
        }
        Ok(())
    }

    pub fn temperature(mode: PerformanceMode) -> Result<()> {
        let config = DriverConfig::from_env()?;
        let manager = manager(&config)?;
        let _device = manager.open_device(mode)?;
        println!("{:.2} °C", manager.temperature()?);
        Ok(())
    }

    pub fn invoke(package: &Path, input: &Path, mode: PerformanceMode, output: Option<&Path>) -> Result<()> {
        let config = DriverConfig::from_env()?;
        let package_bytes = std::fs::read(package).with_context(|| format!("reading {}", package.display()))?;
        let input_bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;

        let manager = manager(&config)?;
        let _device = manager.open_device(mode)?;
        let id = manager.register_package(package_bytes)?;
        let mut outputs = manager.allocate_outputs(id)?;
        let event = manager.invoke(id, &input_bytes, &mut outputs)?;

        println!("Completion event: tag {} address {:#x}", event.tag, event.address);
        for (i, out) in outputs.iter().enumerate() {
            let preview: Vec<String> = out.iter().take(16).map(|b| format!("{b:02x}")).collect();
            println!("  output[{i}] {} bytes: {}", out.len(), preview.join(" "));
        }
        if let Some(path) = output {
            std::fs::write(path, outputs.concat()).with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        Ok(())
    }

    pub fn dfu(firmware: &Path) -> Result<()> {
        let config = DriverConfig::from_env()?;
        let device = find(UsbDeviceKind::Dfu)?;
        let events = device.attach_events()?;
        println!("Downloading {} to {}", firmware.display(), device);
        let host = Arc::new(LibusbHost::new(device, config.clone()));
        let mut task = DfuTask::from_file(host, firmware)?;
        let handle = task.handle();
        for event in events {
            handle.post_host_event(event)?;
        }
        let report = task.run(config.open_timeout)?;
        println!(
            "Done: {} bytes in {} blocks, verified; device re-enumerating",
            report.bytes,
            report.count(DfuState::Transfer)
        );
        Ok(())
    }
}

#[cfg(not(feature = "usb"))]
mod hardware {
    use std::path::Path;

    use anyhow::{bail, Result};
    use edgetpu_chip::PerformanceMode;

    const NEEDS_USB: &str = "this command needs a build with `--features usb`";

    pub fn enumerate() -> Result<()> {
        bail!(NEEDS_USB)
    }

    pub fn temperature(_mode: PerformanceMode) -> Result<()> {
        bail!(NEEDS_USB)
    }

    pub fn invoke(_package: &Path, _input: &Path, _mode: PerformanceMode, _output: Option<&Path>) -> Result<()> {
        bail!(NEEDS_USB)
    }

    pub fn dfu(_firmware: &Path) -> Result<()> {
        bail!(NEEDS_USB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_mode_argument() {
        let cli = Cli::try_parse_from(["edgetpu", "simulate", "--mode", "max"]).unwrap();
        assert!(matches!(cli.command, Cmd::Simulate { mode: PerformanceMode::Max }));
        assert!(Cli::try_parse_from(["edgetpu", "simulate", "--mode", "turbo"]).is_err());
    }

    #[test]
    fn test_demo_package_decodes() {
        let package = Package::from_bytes(demo_package()).unwrap();
        assert_eq!(package.inference().input_layers[0].size_bytes, DEMO_TENSOR);
    }
}
