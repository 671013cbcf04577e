//! Performance presets.
//!
//! The chip exposes three clock selectors in `scu_ctrl_3`. The driver only
//! ever programs one of four fixed combinations:
//!
//! | Mode | GCB | AXI | USB-8051 |
//! |------|-----|-----|----------|
//! | Max | 500 MHz | 250 MHz | 500 MHz |
//! | High | 250 MHz | 125 MHz | 500 MHz |
//! | Medium | 125 MHz | 125 MHz | 500 MHz |
//! | Low | 63 MHz | 125 MHz | 250 MHz |

use std::fmt;
use std::str::FromStr;

use crate::fields::{AxiClock, GcbClock, ScuCtrl3, Usb8051Clock};

/// Clock preset applied during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PerformanceMode {
    /// Lowest power.
    Low,
    /// Reduced GCB clock.
    Medium,
    /// Default preset.
    #[default]
    High,
    /// Every clock at its maximum.
    Max,
}

/// Clock selector values for one preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTriple {
    /// Core (GCB) clock.
    pub gcb: GcbClock,
    /// AXI fabric clock.
    pub axi: AxiClock,
    /// USB 8051 controller clock.
    pub usb_8051: Usb8051Clock,
}

impl PerformanceMode {
    /// All presets, slowest first.
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Max];

    /// Clock selectors for this preset.
    #[must_use]
    pub const fn clocks(self) -> ClockTriple {
        let (gcb, axi, usb_8051) = match self {
            Self::Max => (GcbClock::K500, AxiClock::K250, Usb8051Clock::K500),
            Self::High => (GcbClock::K250, AxiClock::K125, Usb8051Clock::K500),
            Self::Medium => (GcbClock::K125, AxiClock::K125, Usb8051Clock::K500),
            Self::Low => (GcbClock::K63, AxiClock::K125, Usb8051Clock::K250),
        };
        ClockTriple { gcb, axi, usb_8051 }
    }

    /// Nominal GCB frequency in MHz.
    #[must_use]
    pub const fn gcb_mhz(self) -> u32 {
        match self {
            Self::Max => 500,
            Self::High => 250,
            Self::Medium => 125,
            Self::Low => 63,
        }
    }

    /// Write this preset's clock selectors into a `scu_ctrl_3` view.
    #[must_use]
    pub fn apply(self, reg: ScuCtrl3) -> ScuCtrl3 {
        let clocks = self.clocks();
        reg.with_gcb_clock_rate(clocks.gcb)
            .with_axi_clock_rate(clocks.axi)
            .with_usb_8051_clock_rate(clocks.usb_8051)
    }

    /// Lower-case name, as accepted by [`FromStr`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Max => "max",
        }
    }
}

impl fmt::Display for PerformanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown preset name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePerformanceModeError(String);

impl fmt::Display for ParsePerformanceModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown performance mode '{}' (expected low, medium, high or max)",
            self.0
        )
    }
}

impl std::error::Error for ParsePerformanceModeError {}

impl FromStr for PerformanceMode {
    type Err = ParsePerformanceModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "max" => Ok(Self::Max),
            _ => Err(ParsePerformanceModeError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Csr32;

    #[test]
    fn test_default_is_high() {
        assert_eq!(PerformanceMode::default(), PerformanceMode::High);
    }

    #[test]
    fn test_clock_table() {
        let max = PerformanceMode::Max.clocks();
        assert_eq!(max.gcb, GcbClock::K500);
        assert_eq!(max.axi, AxiClock::K250);
        assert_eq!(max.usb_8051, Usb8051Clock::K500);

        let low = PerformanceMode::Low.clocks();
        assert_eq!(low.gcb, GcbClock::K63);
        assert_eq!(low.axi, AxiClock::K125);
        assert_eq!(low.usb_8051, Usb8051Clock::K250);

        assert_eq!(PerformanceMode::Medium.clocks().gcb, GcbClock::K125);
        assert_eq!(PerformanceMode::High.clocks().gcb, GcbClock::K250);
    }

    #[test]
    fn test_apply_keeps_sleep_request() {
        let reg = ScuCtrl3::new().with_rg_force_sleep(2);
        let reg = PerformanceMode::Max.apply(reg);
        assert_eq!(reg.rg_force_sleep(), 2);
        assert_eq!(reg.raw(), 0x5080_0000);
    }

    #[test]
    fn test_parse() {
        for mode in PerformanceMode::ALL {
            assert_eq!(mode.as_str().parse::<PerformanceMode>(), Ok(mode));
        }
        assert_eq!("MAX".parse::<PerformanceMode>(), Ok(PerformanceMode::Max));
        assert!("turbo".parse::<PerformanceMode>().is_err());
    }
}
