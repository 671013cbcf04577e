//! CSR offset map for the Beagle chip.
//!
//! Offsets are 64-bit CSR addresses as carried by the control request
//! (`wValue` = low 16 bits, `wIndex` = high 16 bits). Only the blocks the
//! host driver touches are listed. Registers the chip does not implement are
//! marked with [`ABSENT`].
//!
//! ```text
//! 0x19000  cb_bridge   GCB bridge credits
//! 0x1a000  apex        OMC: chip id, test register, temperature sensor
//! 0x1a300  scu         power / clock control unit
//! 0x40000  tile        per-tile run controls, deep sleep (broadcast)
//! 0x44000  scalar_core scalar core + DMA pop/feed run controls
//! 0x48788  tile_config tile broadcast selector
//! 0x4a000  misc        idle register
//! 0x4c000  usb         USB front-end DMA configuration
//! ```

/// Sentinel for a register the chip configuration marks as not present.
pub const ABSENT: u64 = u64::MAX;

// ── Apex (OMC) ───────────────────────────────────────────────────────────────

/// OMC registers: identity and temperature sensor.
pub mod apex {
    /// `omc0_00`: chip id and scratch test register.
    pub const OMC0_00: u64 = 0x1a000;
    /// `omc0_d0`: temperature sensor clock and trim.
    pub const OMC0_D0: u64 = 0x1a0d0;
    /// `omc0_d4`.
    pub const OMC0_D4: u64 = 0x1a0d4;
    /// `omc0_d8`: temperature sensor input enables.
    pub const OMC0_D8: u64 = 0x1a0d8;
    /// `omc0_dc`: temperature sensor flow enable and sample data.
    pub const OMC0_DC: u64 = 0x1a0dc;
    /// `efuse_00`.
    pub const EFUSE_00: u64 = 0x1a200;
}

// ── SCU ──────────────────────────────────────────────────────────────────────

/// System control unit: power and clocks.
pub mod scu {
    /// `scu_ctrl_0`: inactive-mode PHY selection.
    pub const SCU_CTRL_0: u64 = 0x1a30c;
    /// `scu_ctrl_1`.
    pub const SCU_CTRL_1: u64 = 0x1a310;
    /// `scu_ctrl_2`: clock gating.
    pub const SCU_CTRL_2: u64 = 0x1a314;
    /// `scu_ctrl_3`: force-sleep, power state, clock rates.
    pub const SCU_CTRL_3: u64 = 0x1a318;
    /// `scu_ctrl_4`.
    pub const SCU_CTRL_4: u64 = 0x1a31c;
    /// `scu_ctrl_5`.
    pub const SCU_CTRL_5: u64 = 0x1a320;
}

// ── CB bridge ────────────────────────────────────────────────────────────────

/// Bridge between the USB core and the GCB.
pub mod cb_bridge {
    /// `gcbb_credit0`: pulsed 0xF then 0x0 after entering force-sleep.
    pub const GCBB_CREDIT0: u64 = 0x1907c;
}

// ── Misc ─────────────────────────────────────────────────────────────────────

/// Miscellaneous.
pub mod misc {
    /// `idleRegister`.
    pub const IDLE_REGISTER: u64 = 0x4a000;
}

// ── Scalar core ──────────────────────────────────────────────────────────────

/// Scalar core and its DMA pop/feed units.
pub mod scalar_core {
    /// `scalarCoreRunControl`. Reads 0 once the core has left reset.
    pub const SCALAR_CORE_RUN_CONTROL: u64 = 0x44018;
    /// `avDataPopRunControl`.
    pub const AV_DATA_POP_RUN_CONTROL: u64 = 0x44158;
    /// `parameterPopRunControl`.
    pub const PARAMETER_POP_RUN_CONTROL: u64 = 0x44198;
    /// `infeedRunControl`.
    pub const INFEED_RUN_CONTROL: u64 = 0x441d8;
    /// `outfeedRunControl`.
    pub const OUTFEED_RUN_CONTROL: u64 = 0x44218;
}

// ── Tile config ──────────────────────────────────────────────────────────────

/// Tile selector used for broadcast writes to tile CSRs.
pub mod tile_config {
    /// `tileconfig0`.
    pub const TILECONFIG0: u64 = 0x48788;
    /// `tileconfig1`.
    pub const TILECONFIG1: u64 = 0x48790;
}

// ── Tile ─────────────────────────────────────────────────────────────────────

/// Tile CSRs. Writes land on whichever tiles `tileconfig0` selects.
pub mod tile {
    use super::ABSENT;

    /// `opRunControl`.
    pub const OP_RUN_CONTROL: u64 = 0x400c0;
    /// `narrowToNarrowRunControl` (not on Beagle).
    pub const NARROW_TO_NARROW_RUN_CONTROL: u64 = ABSENT;
    /// `narrowToWideRunControl`.
    pub const NARROW_TO_WIDE_RUN_CONTROL: u64 = 0x40150;
    /// `wideToNarrowRunControl`.
    pub const WIDE_TO_NARROW_RUN_CONTROL: u64 = 0x40110;
    /// `ringBusConsumer0RunControl`.
    pub const RING_BUS_CONSUMER0_RUN_CONTROL: u64 = 0x40190;
    /// `ringBusConsumer1RunControl`.
    pub const RING_BUS_CONSUMER1_RUN_CONTROL: u64 = 0x401d0;
    /// `ringBusProducerRunControl`.
    pub const RING_BUS_PRODUCER_RUN_CONTROL: u64 = 0x40210;
    /// `meshBus0RunControl`.
    pub const MESH_BUS0_RUN_CONTROL: u64 = 0x40250;
    /// `meshBus1RunControl`.
    pub const MESH_BUS1_RUN_CONTROL: u64 = 0x40298;
    /// `meshBus2RunControl`.
    pub const MESH_BUS2_RUN_CONTROL: u64 = 0x402e0;
    /// `meshBus3RunControl`.
    pub const MESH_BUS3_RUN_CONTROL: u64 = 0x40328;
    /// `deepSleep`.
    pub const DEEP_SLEEP: u64 = 0x40020;
}

// ── USB front-end ────────────────────────────────────────────────────────────

/// USB DMA configuration.
pub mod usb {
    /// `outfeed_chunk_length`.
    pub const OUTFEED_CHUNK_LENGTH: u64 = 0x4c058;
    /// `descr_ep`.
    pub const DESCR_EP: u64 = 0x4c148;
    /// `ep_status_credit`.
    pub const EP_STATUS_CREDIT: u64 = 0x4c150;
    /// `multi_bo_ep`.
    pub const MULTI_BO_EP: u64 = 0x4c160;
}

/// Constants the bring-up sequence programs or expects.
pub mod values {
    /// `omc0_00.chip_id` on Beagle.
    pub const CHIP_ID: u16 = 0x89A;
    /// Scratch pattern written to `omc0_00.test_reg0`.
    pub const TEST_PATTERN: u8 = 0xAA;
    /// `rg_force_sleep` requesting sleep.
    pub const FORCE_SLEEP_ENTER: u8 = 0x3;
    /// `rg_force_sleep` releasing sleep.
    pub const FORCE_SLEEP_EXIT: u8 = 0x2;
    /// `cur_pwr_state` once asleep.
    pub const PWR_STATE_SLEEP: u8 = 0x2;
    /// `cur_pwr_state` once awake.
    pub const PWR_STATE_AWAKE: u8 = 0x0;
    /// `rg_gated_gcb` value that disables clock gating.
    pub const GCB_GATING_DISABLED: u8 = 0x2;
    /// `rg_gated_gcb` value that enables clock gating.
    pub const GCB_GATING_ENABLED: u8 = 0x1;
    /// First `gcbb_credit0` pulse value.
    pub const GCBB_CREDIT_PULSE: u32 = 0xF;
    /// `descr_ep`.
    pub const DESCR_EP: u64 = 0xF0;
    /// `multi_bo_ep`.
    pub const MULTI_BO_EP: u64 = 0;
    /// `outfeed_chunk_length`.
    pub const OUTFEED_CHUNK_LENGTH: u64 = 0x20;
    /// `deepSleep.to_sleep_delay`.
    pub const TO_SLEEP_DELAY: u8 = 2;
    /// `deepSleep.to_wake_delay`.
    pub const TO_WAKE_DELAY: u8 = 30;
    /// `omc0_d0.adr` selecting the temperature sensor.
    pub const TEMPSENSE_ADR: u8 = 0xC;
    /// Settling time between enabling sensor inputs and sampling flow.
    pub const TEMPSENSE_SETTLE_US: u64 = 100;
}
