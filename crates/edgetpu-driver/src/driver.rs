//! One accelerator behind one transport
//!
//! [`TpuDriver`] bundles the register channel, the bulk stream and the chip
//! description for a connected Edge TPU. It is the caller-facing surface:
//! `initialize`, `invoke` and `temperature`.

use std::sync::Arc;

use edgetpu_chip::{ChipConfig, EventRecord, PerformanceMode, RunControl};
use tracing::info;

use crate::bringup::BringUp;
use crate::config::DriverConfig;
use crate::csr::CsrChannel;
use crate::error::Result;
use crate::executable::LoadedExecutable;
use crate::stream::BulkStream;
use crate::transport::UsbTransport;

/// A connected Edge TPU.
#[derive(Debug)]
pub struct TpuDriver {
    transport: Arc<dyn UsbTransport>,
    csr: CsrChannel,
    stream: BulkStream,
    chip: ChipConfig,
    config: DriverConfig,
}

impl TpuDriver {
    /// Driver for a Beagle behind `transport`. Nothing is sent yet.
    pub fn new(transport: Arc<dyn UsbTransport>, config: DriverConfig) -> Self {
        Self::with_chip(transport, ChipConfig::beagle(), config)
    }

    /// Driver for the chip described by `chip`.
    pub fn with_chip(transport: Arc<dyn UsbTransport>, chip: ChipConfig, config: DriverConfig) -> Self {
        info!("{} driver over {}", chip.name, transport.transport_type());
        Self {
            csr: CsrChannel::new(Arc::clone(&transport), config.control_timeout),
            stream: BulkStream::new(Arc::clone(&transport), &config),
            transport,
            chip,
            config,
        }
    }

    /// Create a driver and bring the chip up at `mode`.
    ///
    /// # Errors
    ///
    /// Returns the first bring-up failure.
    pub fn open(transport: Arc<dyn UsbTransport>, mode: PerformanceMode, config: DriverConfig) -> Result<Self> {
        let driver = Self::new(transport, config);
        driver.initialize(mode)?;
        Ok(driver)
    }

    /// Run the bring-up sequence.
    ///
    /// # Errors
    ///
    /// Returns the first register failure, a chip id or test register
    /// mismatch, or an exhausted poll loop.
    pub fn initialize(&self, mode: PerformanceMode) -> Result<()> {
        self.sequencer().run(mode)
    }

    /// Move every run-control block to `state`.
    ///
    /// # Errors
    ///
    /// Returns the first register failure.
    pub fn set_run_control(&self, state: RunControl) -> Result<()> {
        self.sequencer().set_run_control(state)
    }

    /// Die temperature in degrees Celsius.
    ///
    /// # Errors
    ///
    /// Returns error if the sensor register cannot be read.
    pub fn temperature(&self) -> Result<f32> {
        self.sequencer().temperature()
    }

    /// Run `executable` once. See [`LoadedExecutable::invoke`].
    ///
    /// # Errors
    ///
    /// Returns the first argument, streaming or relayout failure.
    pub fn invoke<O: AsMut<[u8]>>(
        &self,
        executable: &mut LoadedExecutable,
        input: &[u8],
        outputs: &mut [O],
    ) -> Result<EventRecord> {
        executable.invoke(&self.stream, input, outputs)
    }

    /// Register channel.
    pub const fn csr(&self) -> &CsrChannel {
        &self.csr
    }

    /// Bulk stream.
    pub const fn stream(&self) -> &BulkStream {
        &self.stream
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Arc<dyn UsbTransport> {
        &self.transport
    }

    /// Chip description.
    pub const fn chip(&self) -> &ChipConfig {
        &self.chip
    }

    /// Configuration in effect.
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn sequencer(&self) -> BringUp<'_, CsrChannel> {
        BringUp::new(&self.csr, &self.chip, self.config.poll_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimulatedBeagle, SoftwareTransport};

    #[test]
    fn test_temperature_from_simulated_sensor() {
        let transport = Arc::new(SoftwareTransport::new(SimulatedBeagle::new()).unwrap());
        let driver = TpuDriver::open(transport, PerformanceMode::Low, DriverConfig::default()).unwrap();
        let celsius = driver.temperature().unwrap();
        assert!((celsius - 51.05).abs() < 1e-3);
    }
}
