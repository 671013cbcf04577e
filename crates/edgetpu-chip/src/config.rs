//! Chip configuration: the register offsets and constants bring-up needs.
//!
//! [`ChipConfig::beagle`] describes the USB accelerator. The driver never
//! reads [`crate::regs`] directly, only a `ChipConfig`, so tests can swap in a
//! configuration with different offsets or run-control tables.

use crate::regs::{self, values};
use crate::run_control::{RunControlBlock, BEAGLE_SCALAR_CORE, BEAGLE_TILE};

/// OMC offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApexOffsets {
    /// `omc0_00`.
    pub omc0_00: u64,
    /// `omc0_d0`.
    pub omc0_d0: u64,
    /// `omc0_d8`.
    pub omc0_d8: u64,
    /// `omc0_dc`.
    pub omc0_dc: u64,
}

/// SCU offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScuOffsets {
    /// `scu_ctrl_0`.
    pub scu_ctrl_0: u64,
    /// `scu_ctrl_2`.
    pub scu_ctrl_2: u64,
    /// `scu_ctrl_3`.
    pub scu_ctrl_3: u64,
}

/// USB front-end DMA offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbOffsets {
    /// `descr_ep`.
    pub descr_ep: u64,
    /// `multi_bo_ep`.
    pub multi_bo_ep: u64,
    /// `outfeed_chunk_length`.
    pub outfeed_chunk_length: u64,
}

/// Everything the bring-up sequence and temperature readout need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipConfig {
    /// Human-readable chip name.
    pub name: &'static str,
    /// Expected `omc0_00.chip_id`.
    pub chip_id: u16,
    /// OMC block.
    pub apex: ApexOffsets,
    /// SCU block.
    pub scu: ScuOffsets,
    /// `gcbb_credit0`.
    pub gcbb_credit0: u64,
    /// `idleRegister`.
    pub idle_register: u64,
    /// `tileconfig0`.
    pub tileconfig0: u64,
    /// Tile `deepSleep`.
    pub deep_sleep: u64,
    /// USB DMA block.
    pub usb: UsbOffsets,
    /// Scalar-core run controls, in write order.
    pub scalar_core_run_controls: Vec<RunControlBlock>,
    /// Tile run controls, in write order.
    pub tile_run_controls: Vec<RunControlBlock>,
}

impl ChipConfig {
    /// Beagle (Edge TPU USB accelerator).
    #[must_use]
    pub fn beagle() -> Self {
        Self {
            name: "beagle",
            chip_id: values::CHIP_ID,
            apex: ApexOffsets {
                omc0_00: regs::apex::OMC0_00,
                omc0_d0: regs::apex::OMC0_D0,
                omc0_d8: regs::apex::OMC0_D8,
                omc0_dc: regs::apex::OMC0_DC,
            },
            scu: ScuOffsets {
                scu_ctrl_0: regs::scu::SCU_CTRL_0,
                scu_ctrl_2: regs::scu::SCU_CTRL_2,
                scu_ctrl_3: regs::scu::SCU_CTRL_3,
            },
            gcbb_credit0: regs::cb_bridge::GCBB_CREDIT0,
            idle_register: regs::misc::IDLE_REGISTER,
            tileconfig0: regs::tile_config::TILECONFIG0,
            deep_sleep: regs::tile::DEEP_SLEEP,
            usb: UsbOffsets {
                descr_ep: regs::usb::DESCR_EP,
                multi_bo_ep: regs::usb::MULTI_BO_EP,
                outfeed_chunk_length: regs::usb::OUTFEED_CHUNK_LENGTH,
            },
            scalar_core_run_controls: BEAGLE_SCALAR_CORE.to_vec(),
            tile_run_controls: BEAGLE_TILE.to_vec(),
        }
    }

    /// First scalar-core run control: polled until the core leaves reset.
    #[must_use]
    pub fn scalar_core_run_control(&self) -> Option<u64> {
        self.scalar_core_run_controls
            .iter()
            .find(|block| !block.is_absent())
            .map(|block| block.offset)
    }
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self::beagle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beagle_offsets() {
        let config = ChipConfig::beagle();
        assert_eq!(config.chip_id, 0x89A);
        assert_eq!(config.apex.omc0_00, 0x1a000);
        assert_eq!(config.scu.scu_ctrl_3, 0x1a318);
        assert_eq!(config.tileconfig0, 0x48788);
        assert_eq!(config.scalar_core_run_control(), Some(0x44018));
    }

    #[test]
    fn test_tables_are_swappable() {
        let mut config = ChipConfig::beagle();
        config.tile_run_controls = vec![RunControlBlock::new("opRunControl", 0x1000)];
        assert_eq!(config.tile_run_controls.len(), 1);
        assert_ne!(config, ChipConfig::beagle());
    }
}
