//! Bring-up sequence: reset to running at a chosen performance mode
//!
//! One forward path with three poll loops. Every register access is
//! fallible and the first failure aborts; there is no partial state worth
//! resuming from, so the caller simply runs the whole sequence again.
//!
//! | Step | Register(s) | Action |
//! |------|-------------|--------|
//! | 1 | `omc0_00` | check `chip_id` |
//! | 2 | `omc0_00` | write/read back `test_reg0 = 0xAA` |
//! | 3 | `scu_ctrl_0` | clear PCIe/USB inactive PHY modes |
//! | 4 | `scu_ctrl_2` | disable GCB clock gating |
//! | 5 | `scu_ctrl_3`, `gcbb_credit0` | force sleep, wait for state 2, pulse credits |
//! | 6 | `scu_ctrl_3` | leave sleep with the mode's clocks, wait for state 0 |
//! | 7 | `scalarCoreRunControl` | wait for 0 |
//! | 8 | `idleRegister`, `tileconfig0` | enable idle, broadcast tile select |
//! | 9 | tile `deepSleep` | sleep/wake delays |
//! | 10 | `scu_ctrl_2` | re-enable GCB clock gating |
//! | 11 | USB DMA block | descriptor/bulk-out endpoints, outfeed chunk |
//! | 12 | `omc0_d0`, `omc0_d8`, `omc0_dc` | start the temperature sensor |
//! | 13 | run controls | move every block to `Run` |

use std::thread;
use std::time::Duration;

use edgetpu_chip::fields::{
    Csr32, Csr64, DeepSleep, IdleRegister, Omc000, Omc0D0, Omc0D8, Omc0Dc, ScuCtrl0, ScuCtrl2,
    ScuCtrl3, TileConfig,
};
use edgetpu_chip::regs::values;
use edgetpu_chip::run_control::{self, RunControl};
use edgetpu_chip::{ChipConfig, PerformanceMode};
use tracing::{debug, info};

use crate::csr::RegisterAccess;
use crate::error::{EdgeTpuError, Result};

/// Runs the bring-up sequence and run-control changes against one chip.
#[derive(Debug)]
pub struct BringUp<'a, R> {
    csr: &'a R,
    chip: &'a ChipConfig,
    poll_limit: u32,
}

impl<'a, R: RegisterAccess> BringUp<'a, R> {
    /// Sequencer over `csr` for the chip described by `chip`.
    pub const fn new(csr: &'a R, chip: &'a ChipConfig, poll_limit: u32) -> Self {
        Self {
            csr,
            chip,
            poll_limit,
        }
    }

    /// Run every step in order.
    ///
    /// # Errors
    ///
    /// Returns the first register failure, [`EdgeTpuError::ChipIdMismatch`],
    /// a protocol error if the test register does not read back, or
    /// [`EdgeTpuError::PollExhausted`] if a poll loop never settles.
    pub fn run(&self, mode: PerformanceMode) -> Result<()> {
        info!("Bringing up {} at {} performance", self.chip.name, mode);
        let omc = self.check_chip_id()?;
        self.check_test_register(omc)?;
        self.disable_inactive_phy_modes()?;
        self.set_clock_gating(values::GCB_GATING_DISABLED, true)?;
        self.enter_reset()?;
        self.exit_reset(mode)?;
        self.wait_scalar_core()?;
        self.configure_idle_and_tiles()?;
        self.configure_deep_sleep()?;
        self.set_clock_gating(values::GCB_GATING_ENABLED, false)?;
        self.configure_usb_dma()?;
        self.enable_temperature_sensor()?;
        self.set_run_control(RunControl::Run)?;
        info!("{} running at {} MHz GCB", self.chip.name, mode.gcb_mhz());
        Ok(())
    }

    /// Step 1. Returns the register for step 2 to modify.
    fn check_chip_id(&self) -> Result<Omc000> {
        let omc: Omc000 = self.csr.read_view32(self.chip.apex.omc0_00)?;
        debug!("omc0_00 = {:#010x}, chip id {:#x}", omc.raw(), omc.chip_id());
        if omc.chip_id() != self.chip.chip_id {
            return Err(EdgeTpuError::ChipIdMismatch {
                expected: self.chip.chip_id,
                found: omc.chip_id(),
            });
        }
        Ok(omc)
    }

    /// Step 2.
    fn check_test_register(&self, omc: Omc000) -> Result<()> {
        let offset = self.chip.apex.omc0_00;
        self.csr
            .write32(offset, omc.with_test_reg0(values::TEST_PATTERN).raw())?;
        let readback: Omc000 = self.csr.read_view32(offset)?;
        if readback.test_reg0() != values::TEST_PATTERN {
            return Err(EdgeTpuError::protocol(format!(
                "test register read back {:#04x}, wrote {:#04x}",
                readback.test_reg0(),
                values::TEST_PATTERN
            )));
        }
        debug!("Test register ok");
        Ok(())
    }

    /// Step 3.
    fn disable_inactive_phy_modes(&self) -> Result<()> {
        let offset = self.chip.scu.scu_ctrl_0;
        let reg = self
            .csr
            .read_view32::<ScuCtrl0>(offset)?
            .with_rg_pcie_inact_phy_mode(0)
            .with_rg_usb_inact_phy_mode(0);
        self.csr.write32(offset, reg.raw())?;
        self.csr.read32(offset)?;
        debug!("Inactive PHY modes disabled");
        Ok(())
    }

    /// Steps 4 and 10.
    fn set_clock_gating(&self, gated_gcb: u8, read_back: bool) -> Result<()> {
        let offset = self.chip.scu.scu_ctrl_2;
        let reg = self
            .csr
            .read_view32::<ScuCtrl2>(offset)?
            .with_rg_gated_gcb(gated_gcb);
        self.csr.write32(offset, reg.raw())?;
        if read_back {
            self.csr.read32(offset)?;
        }
        debug!("rg_gated_gcb = {}", gated_gcb);
        Ok(())
    }

    /// Step 5.
    fn enter_reset(&self) -> Result<()> {
        let offset = self.chip.scu.scu_ctrl_3;
        let reg: ScuCtrl3 = self.csr.read_view32(offset)?;
        if reg.rg_force_sleep() == values::FORCE_SLEEP_ENTER {
            debug!("Already in reset");
            return Ok(());
        }
        self.csr
            .write32(offset, reg.with_rg_force_sleep(values::FORCE_SLEEP_ENTER).raw())?;
        self.poll32::<ScuCtrl3>(offset, "cur_pwr_state == sleep", |r| {
            r.cur_pwr_state() == values::PWR_STATE_SLEEP
        })?;
        self.csr
            .write32(self.chip.gcbb_credit0, values::GCBB_CREDIT_PULSE)?;
        self.csr.write32(self.chip.gcbb_credit0, 0)?;
        debug!("Entered reset");
        Ok(())
    }

    /// Step 6.
    fn exit_reset(&self, mode: PerformanceMode) -> Result<()> {
        let offset = self.chip.scu.scu_ctrl_3;
        let reg = mode.apply(
            self.csr
                .read_view32::<ScuCtrl3>(offset)?
                .with_rg_force_sleep(values::FORCE_SLEEP_EXIT),
        );
        self.csr.write32(offset, reg.raw())?;
        self.poll32::<ScuCtrl3>(offset, "cur_pwr_state == awake", |r| {
            r.cur_pwr_state() == values::PWR_STATE_AWAKE
        })?;
        debug!("Left reset, scu_ctrl_3 = {:#010x}", reg.raw());
        Ok(())
    }

    /// Step 7.
    fn wait_scalar_core(&self) -> Result<()> {
        let Some(offset) = self.chip.scalar_core_run_control() else {
            return Ok(());
        };
        self.poll64(offset, "scalarCoreRunControl == 0", |v| v == 0)?;
        debug!("Scalar core out of reset");
        Ok(())
    }

    /// Step 8.
    fn configure_idle_and_tiles(&self) -> Result<()> {
        let idle = IdleRegister::new().with_disable_idle(false).with_counter(1);
        self.csr.write64(self.chip.idle_register, idle.raw())?;
        self.broadcast_tiles()
    }

    fn broadcast_tiles(&self) -> Result<()> {
        let broadcast = TileConfig::broadcast().raw();
        self.csr.write64(self.chip.tileconfig0, broadcast)?;
        self.poll64(self.chip.tileconfig0, "tileconfig0 == broadcast", |v| {
            v == broadcast
        })?;
        debug!("Tile select broadcast");
        Ok(())
    }

    /// Step 9.
    fn configure_deep_sleep(&self) -> Result<()> {
        let reg = DeepSleep::new()
            .with_to_sleep_delay(values::TO_SLEEP_DELAY)
            .with_to_wake_delay(values::TO_WAKE_DELAY);
        self.csr.write64(self.chip.deep_sleep, reg.raw())
    }

    /// Step 11.
    fn configure_usb_dma(&self) -> Result<()> {
        let usb = &self.chip.usb;
        self.csr.write64(usb.descr_ep, values::DESCR_EP)?;
        self.csr.write64(usb.multi_bo_ep, values::MULTI_BO_EP)?;
        self.csr
            .write64(usb.outfeed_chunk_length, values::OUTFEED_CHUNK_LENGTH)?;
        debug!("USB DMA configured");
        Ok(())
    }

    /// Step 12.
    fn enable_temperature_sensor(&self) -> Result<()> {
        let apex = &self.chip.apex;
        let d0 = self
            .csr
            .read_view32::<Omc0D0>(apex.omc0_d0)?
            .with_clk_en(true)
            .with_adr(values::TEMPSENSE_ADR)
            .with_tref(0)
            .with_tslope(0)
            .with_t_setting(0);
        self.csr.write32(apex.omc0_d0, d0.raw())?;

        let d8 = self
            .csr
            .read_view32::<Omc0D8>(apex.omc0_d8)?
            .with_enbg(true)
            .with_envr(true)
            .with_enad(true);
        self.csr.write32(apex.omc0_d8, d8.raw())?;

        thread::sleep(Duration::from_micros(values::TEMPSENSE_SETTLE_US));

        let dc = self
            .csr
            .read_view32::<Omc0Dc>(apex.omc0_dc)?
            .with_enthmc(true);
        self.csr.write32(apex.omc0_dc, dc.raw())?;
        debug!("Temperature sensor enabled");
        Ok(())
    }

    /// Step 13: write `state` into every run-control register, scalar core
    /// first, then (after re-selecting all tiles) every tile block.
    ///
    /// # Errors
    ///
    /// Returns the first register failure.
    pub fn set_run_control(&self, state: RunControl) -> Result<()> {
        for block in run_control::present(&self.chip.scalar_core_run_controls) {
            debug!("{} <- {:?}", block.name, state);
            self.csr.write64(block.offset, state.value())?;
        }
        self.broadcast_tiles()?;
        for block in run_control::present(&self.chip.tile_run_controls) {
            debug!("{} <- {:?}", block.name, state);
            self.csr.write64(block.offset, state.value())?;
        }
        Ok(())
    }

    /// Read the temperature sensor, in degrees Celsius.
    ///
    /// # Errors
    ///
    /// Returns error if the register read fails.
    pub fn temperature(&self) -> Result<f32> {
        let reg: Omc0Dc = self.csr.read_view32(self.chip.apex.omc0_dc)?;
        Ok(reg.celsius())
    }

    fn poll32<V: Csr32>(&self, offset: u64, condition: &'static str, done: impl Fn(V) -> bool) -> Result<V> {
        for _ in 0..self.poll_limit {
            let reg: V = self.csr.read_view32(offset)?;
            if done(reg) {
                return Ok(reg);
            }
        }
        Err(self.exhausted(offset, condition))
    }

    fn poll64(&self, offset: u64, condition: &'static str, done: impl Fn(u64) -> bool) -> Result<u64> {
        for _ in 0..self.poll_limit {
            let value = self.csr.read64(offset)?;
            if done(value) {
                return Ok(value);
            }
        }
        Err(self.exhausted(offset, condition))
    }

    const fn exhausted(&self, offset: u64, condition: &'static str) -> EdgeTpuError {
        EdgeTpuError::PollExhausted {
            offset,
            condition,
            attempts: self.poll_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Access {
        Read(u64),
        Write(u64, u64),
    }

    /// Register file where every write sticks, with chip id and power state
    /// behaviour layered on top.
    #[derive(Debug, Default)]
    struct Registers {
        values: RefCell<HashMap<u64, u64>>,
        log: RefCell<Vec<Access>>,
        sleep_never_settles: bool,
    }

    impl Registers {
        fn beagle() -> Self {
            let regs = Self::default();
            regs.values.borrow_mut().insert(0x1a000, 0x089A_0000);
            regs.values.borrow_mut().insert(0x1a318, 0x0080_0000);
            regs
        }

        fn writes(&self) -> Vec<(u64, u64)> {
            self.log
                .borrow()
                .iter()
                .filter_map(|a| match *a {
                    Access::Write(o, v) => Some((o, v)),
                    Access::Read(_) => None,
                })
                .collect()
        }
    }

    impl RegisterAccess for Registers {
        fn read32(&self, offset: u64) -> Result<u32> {
            self.read64(offset).map(|v| v as u32)
        }

        fn read64(&self, offset: u64) -> Result<u64> {
            self.log.borrow_mut().push(Access::Read(offset));
            Ok(self.values.borrow().get(&offset).copied().unwrap_or(0))
        }

        fn write32(&self, offset: u64, value: u32) -> Result<()> {
            self.write64(offset, u64::from(value))
        }

        fn write64(&self, offset: u64, value: u64) -> Result<()> {
            self.log.borrow_mut().push(Access::Write(offset, value));
            let mut value = value;
            if offset == 0x1a318 {
                let reg = <ScuCtrl3 as Csr32>::from_raw(value as u32);
                let state = match reg.rg_force_sleep() {
                    3 if !self.sleep_never_settles => 2,
                    3 => 1,
                    _ => 0,
                };
                value = u64::from(reg.with_cur_pwr_state(state).raw());
            }
            self.values.borrow_mut().insert(offset, value);
            Ok(())
        }
    }

    #[test]
    fn test_bring_up_max_programs_clocks() {
        let regs = Registers::beagle();
        let chip = ChipConfig::beagle();
        BringUp::new(&regs, &chip, 10).run(PerformanceMode::Max).unwrap();

        let scu3 = <ScuCtrl3 as Csr32>::from_raw(regs.values.borrow()[&0x1a318] as u32);
        assert_eq!(scu3.rg_force_sleep(), 2);
        assert_eq!(scu3, PerformanceMode::Max.apply(scu3));

        let writes = regs.writes();
        let credits: Vec<u64> = writes
            .iter()
            .filter(|(o, _)| *o == chip.gcbb_credit0)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(credits, [0xF, 0]);
        assert!(writes.contains(&(0x4c148, 0xF0)));
        assert!(writes.contains(&(0x4c058, 0x20)));
        assert!(writes.contains(&(0x4a000, 1)));
        assert!(writes.contains(&(0x40020, 0x1e02)));
        assert_eq!(writes.last(), Some(&(0x40210, 1)));
    }

    #[test]
    fn test_run_control_order() {
        let regs = Registers::beagle();
        let chip = ChipConfig::beagle();
        BringUp::new(&regs, &chip, 10)
            .set_run_control(RunControl::Run)
            .unwrap();
        let offsets: Vec<u64> = regs.writes().iter().map(|(o, _)| *o).collect();
        assert_eq!(&offsets[..5], &[0x44018, 0x44158, 0x44198, 0x441d8, 0x44218]);
        assert_eq!(offsets[5], chip.tileconfig0);
        assert_eq!(offsets.len(), 5 + 1 + 10);
        assert!(!offsets.contains(&u64::MAX));
        assert!(regs.writes().iter().skip(6).all(|(_, v)| *v == 1));
    }

    #[test]
    fn test_chip_id_mismatch_stops_before_writes() {
        let regs = Registers::beagle();
        regs.values.borrow_mut().insert(0x1a000, 0x0123_0000);
        let chip = ChipConfig::beagle();
        let err = BringUp::new(&regs, &chip, 10)
            .run(PerformanceMode::High)
            .unwrap_err();
        assert!(matches!(
            err,
            EdgeTpuError::ChipIdMismatch {
                expected: 0x89A,
                found: 0x123
            }
        ));
        assert!(regs.writes().is_empty());
    }

    #[test]
    fn test_test_register_reuses_chip_id_read() {
        let regs = Registers::beagle();
        let chip = ChipConfig::beagle();
        BringUp::new(&regs, &chip, 10).run(PerformanceMode::High).unwrap();

        let log = regs.log.borrow();
        let omc = chip.apex.omc0_00;
        assert!(matches!(log[0], Access::Read(o) if o == omc));
        assert!(matches!(log[1], Access::Write(o, _) if o == omc));
        assert!(matches!(log[2], Access::Read(o) if o == omc));
        let omc_reads = log
            .iter()
            .filter(|a| matches!(a, Access::Read(o) if *o == omc))
            .count();
        assert_eq!(omc_reads, 2);
    }

    #[test]
    fn test_poll_limit_bounds_sleep_wait() {
        let regs = Registers {
            sleep_never_settles: true,
            ..Registers::beagle()
        };
        let chip = ChipConfig::beagle();
        let err = BringUp::new(&regs, &chip, 5)
            .run(PerformanceMode::Low)
            .unwrap_err();
        assert!(matches!(
            err,
            EdgeTpuError::PollExhausted {
                offset: 0x1a318,
                attempts: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_temperature_conversion() {
        let regs = Registers::beagle();
        regs.values.borrow_mut().insert(0x1a0dc, 460 << 16);
        let chip = ChipConfig::beagle();
        let celsius = BringUp::new(&regs, &chip, 1).temperature().unwrap();
        assert!((celsius - 51.05).abs() < 1e-3);
    }
}
