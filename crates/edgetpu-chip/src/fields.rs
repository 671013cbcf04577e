//! Typed bitfield views of the registers bring-up touches.
//!
//! Each view is generated by `modular_bitfield` from a field list, so field
//! widths are part of the type. Fields are packed from bit 0 upwards, and
//! the raw register value is the little-endian reading of the view's bytes.
//!
//! Writing a value that does not fit a field is rejected:
//! `set_<field>_checked` / `with_<field>_checked` return
//! [`OutOfBounds`](modular_bitfield::error::OutOfBounds), the unchecked
//! setters panic. Nothing is ever silently truncated.
//!
//! ```text
//! omc0_00     [31:16] chip_id          [7:0] test_reg0
//! scu_ctrl_0  [17:15] usb_inact_phy    [14:12] pcie_inact_phy
//! scu_ctrl_2  [19:18] rg_gated_gcb
//! scu_ctrl_3  [30] usb_8051_clk [28] axi_clk [27:26] gcb_clk
//!             [23:22] rg_force_sleep   [9:8] cur_pwr_state
//! omc0_d0     [21:16] t_setting [15:12] tslope [11:8] tref [4] clk_en [3:0] adr
//! omc0_d8     [2] enbg [1] envr [0] enad
//! omc0_dc     [25:16] data             [0] enthmc
//! idle        [31] disable_idle        [30:0] counter
//! tileconfig  [6:0] tile
//! deepSleep   [15:8] to_wake_delay     [7:0] to_sleep_delay
//! ```

#![allow(missing_docs)] // accessors are generated

use modular_bitfield::prelude::*;

/// Conversion between a register view and its raw 32-bit value.
pub trait Csr32: Copy {
    /// Decode a raw register value.
    fn from_raw(raw: u32) -> Self;
    /// Encode to a raw register value.
    fn raw(self) -> u32;
}

/// Conversion between a register view and its raw 64-bit value.
pub trait Csr64: Copy {
    /// Decode a raw register value.
    fn from_raw(raw: u64) -> Self;
    /// Encode to a raw register value.
    fn raw(self) -> u64;
}

macro_rules! csr_view {
    (Csr32: $($ty:ident),+ $(,)?) => {$(
        impl Csr32 for $ty {
            fn from_raw(raw: u32) -> Self {
                Self::from_bytes(raw.to_le_bytes())
            }
            fn raw(self) -> u32 {
                u32::from_le_bytes(self.into_bytes())
            }
        }
    )+};
    (Csr64: $($ty:ident),+ $(,)?) => {$(
        impl Csr64 for $ty {
            fn from_raw(raw: u64) -> Self {
                Self::from_bytes(raw.to_le_bytes())
            }
            fn raw(self) -> u64 {
                u64::from_le_bytes(self.into_bytes())
            }
        }
    )+};
}

// ── Clock selectors ──────────────────────────────────────────────────────────

/// `scu_ctrl_3.gcb_clock_rate`.
#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 2]
pub enum GcbClock {
    K500 = 0,
    K250 = 1,
    K125 = 2,
    K63 = 3,
}

/// `scu_ctrl_3.axi_clock_rate`.
#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 1]
pub enum AxiClock {
    K125 = 0,
    K250 = 1,
}

/// `scu_ctrl_3.usb_8051_clock_rate`.
#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 1]
pub enum Usb8051Clock {
    K250 = 0,
    K500 = 1,
}

// ── 32-bit views ─────────────────────────────────────────────────────────────

/// `omc0_00`.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Omc000 {
    pub test_reg0: B8,
    #[skip]
    reserved_8: B8,
    pub chip_id: B16,
}

/// `scu_ctrl_0`.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScuCtrl0 {
    #[skip]
    reserved_0: B12,
    pub rg_pcie_inact_phy_mode: B3,
    pub rg_usb_inact_phy_mode: B3,
    #[skip]
    reserved_18: B14,
}

/// `scu_ctrl_2`.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScuCtrl2 {
    #[skip]
    reserved_0: B18,
    pub rg_gated_gcb: B2,
    #[skip]
    reserved_20: B12,
}

/// `scu_ctrl_3`.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScuCtrl3 {
    #[skip]
    reserved_0: B8,
    pub cur_pwr_state: B2,
    #[skip]
    reserved_10: B12,
    pub rg_force_sleep: B2,
    #[skip]
    reserved_24: B2,
    pub gcb_clock_rate: GcbClock,
    pub axi_clock_rate: AxiClock,
    #[skip]
    reserved_29: B1,
    pub usb_8051_clock_rate: Usb8051Clock,
    #[skip]
    reserved_31: B1,
}

/// `omc0_d0`: temperature sensor address and trim.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Omc0D0 {
    pub adr: B4,
    pub clk_en: bool,
    #[skip]
    reserved_5: B3,
    pub tref: B4,
    pub tslope: B4,
    pub t_setting: B6,
    #[skip]
    reserved_22: B10,
}

/// `omc0_d8`: temperature sensor input enables.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Omc0D8 {
    pub enad: bool,
    pub envr: bool,
    pub enbg: bool,
    #[skip]
    reserved_3: B29,
}

/// `omc0_dc`: temperature sensor flow and sample.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Omc0Dc {
    pub enthmc: bool,
    #[skip]
    reserved_1: B15,
    pub data: B10,
    #[skip]
    reserved_26: B6,
}

impl Omc0Dc {
    /// Sensor sample converted to milli-degrees Celsius.
    #[must_use]
    pub fn millicelsius(self) -> i32 {
        (662 - i32::from(self.data())) * 250 + 550
    }

    /// Sensor sample converted to degrees Celsius.
    #[must_use]
    pub fn celsius(self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let milli = self.millicelsius() as f32;
        milli / 1000.0
    }
}

csr_view!(Csr32: Omc000, ScuCtrl0, ScuCtrl2, ScuCtrl3, Omc0D0, Omc0D8, Omc0Dc);

// ── 64-bit views ─────────────────────────────────────────────────────────────

/// `idleRegister`.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleRegister {
    pub counter: B31,
    pub disable_idle: bool,
    #[skip]
    reserved_32: B32,
}

/// `tileconfig0`: Beagle has 7 tile-select bits.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileConfig {
    pub tile: B7,
    #[skip]
    reserved_7: B57,
}

impl TileConfig {
    /// All tile bits set: subsequent tile CSR writes reach every tile.
    pub const BROADCAST_TILE: u8 = 0x7F;

    /// Selector addressing every tile.
    #[must_use]
    pub fn broadcast() -> Self {
        Self::new().with_tile(Self::BROADCAST_TILE)
    }
}

/// Tile `deepSleep`.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeepSleep {
    pub to_sleep_delay: B8,
    pub to_wake_delay: B8,
    #[skip]
    reserved_16: B48,
}

csr_view!(Csr64: IdleRegister, TileConfig, DeepSleep);
