//! Run-control states and block tables.
//!
//! Moving the chip into `Run` means writing the same value into every
//! run-control register, first the scalar-core block and then (after
//! selecting all tiles) every tile block. The register lists are data, so a
//! chip variant only has to supply different tables. Entries whose offset is
//! [`ABSENT`] do not exist on that chip and are skipped.

use crate::regs::{scalar_core, tile, ABSENT};

/// Value written to a run-control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum RunControl {
    /// Stop and return to idle.
    Idle = 0,
    /// Start executing.
    Run = 1,
    /// Halt at the next boundary.
    Halt = 2,
    /// Execute a single step.
    SingleStep = 3,
}

impl RunControl {
    /// Raw register value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self as u64
    }
}

/// Value reported by a run-status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    /// Idle.
    Idle,
    /// Running.
    Run,
    /// Single stepping.
    SingleStep,
    /// Halt requested, not yet reached.
    Halting,
    /// Halted.
    Halted,
}

impl RunStatus {
    /// Decode a raw status value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::Run),
            2 => Some(Self::SingleStep),
            3 => Some(Self::Halting),
            4 => Some(Self::Halted),
            _ => None,
        }
    }
}

/// One named run-control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunControlBlock {
    /// Register name.
    pub name: &'static str,
    /// CSR offset, or [`ABSENT`].
    pub offset: u64,
}

impl RunControlBlock {
    /// Build a table entry.
    #[must_use]
    pub const fn new(name: &'static str, offset: u64) -> Self {
        Self { name, offset }
    }

    /// True if the chip does not implement this register.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        self.offset == ABSENT
    }
}

/// Beagle scalar-core run controls, in write order.
pub const BEAGLE_SCALAR_CORE: &[RunControlBlock] = &[
    RunControlBlock::new("scalarCoreRunControl", scalar_core::SCALAR_CORE_RUN_CONTROL),
    RunControlBlock::new("avDataPopRunControl", scalar_core::AV_DATA_POP_RUN_CONTROL),
    RunControlBlock::new("parameterPopRunControl", scalar_core::PARAMETER_POP_RUN_CONTROL),
    RunControlBlock::new("infeedRunControl", scalar_core::INFEED_RUN_CONTROL),
    RunControlBlock::new("outfeedRunControl", scalar_core::OUTFEED_RUN_CONTROL),
];

/// Beagle tile run controls, in write order.
///
/// The per-issue `_0`..`_7` variants belong to wider tile designs and are
/// all absent here.
pub const BEAGLE_TILE: &[RunControlBlock] = &[
    RunControlBlock::new("opRunControl", tile::OP_RUN_CONTROL),
    RunControlBlock::new("opRunControl_0", ABSENT),
    RunControlBlock::new("opRunControl_1", ABSENT),
    RunControlBlock::new("opRunControl_2", ABSENT),
    RunControlBlock::new("opRunControl_3", ABSENT),
    RunControlBlock::new("opRunControl_4", ABSENT),
    RunControlBlock::new("opRunControl_5", ABSENT),
    RunControlBlock::new("opRunControl_6", ABSENT),
    RunControlBlock::new("opRunControl_7", ABSENT),
    RunControlBlock::new("narrowToWideRunControl", tile::NARROW_TO_WIDE_RUN_CONTROL),
    RunControlBlock::new("narrowToWideRunControl_0", ABSENT),
    RunControlBlock::new("narrowToWideRunControl_1", ABSENT),
    RunControlBlock::new("narrowToWideRunControl_2", ABSENT),
    RunControlBlock::new("narrowToWideRunControl_3", ABSENT),
    RunControlBlock::new("narrowToWideRunControl_4", ABSENT),
    RunControlBlock::new("narrowToWideRunControl_5", ABSENT),
    RunControlBlock::new("narrowToWideRunControl_6", ABSENT),
    RunControlBlock::new("narrowToWideRunControl_7", ABSENT),
    RunControlBlock::new("wideToNarrowRunControl", tile::WIDE_TO_NARROW_RUN_CONTROL),
    RunControlBlock::new("wideToNarrowRunControl_0", ABSENT),
    RunControlBlock::new("wideToNarrowRunControl_1", ABSENT),
    RunControlBlock::new("wideToNarrowRunControl_2", ABSENT),
    RunControlBlock::new("wideToNarrowRunControl_3", ABSENT),
    RunControlBlock::new("wideToNarrowRunControl_4", ABSENT),
    RunControlBlock::new("wideToNarrowRunControl_5", ABSENT),
    RunControlBlock::new("wideToNarrowRunControl_6", ABSENT),
    RunControlBlock::new("wideToNarrowRunControl_7", ABSENT),
    RunControlBlock::new("meshBus0RunControl", tile::MESH_BUS0_RUN_CONTROL),
    RunControlBlock::new("meshBus1RunControl", tile::MESH_BUS1_RUN_CONTROL),
    RunControlBlock::new("meshBus2RunControl", tile::MESH_BUS2_RUN_CONTROL),
    RunControlBlock::new("meshBus3RunControl", tile::MESH_BUS3_RUN_CONTROL),
    RunControlBlock::new("ringBusConsumer0RunControl", tile::RING_BUS_CONSUMER0_RUN_CONTROL),
    RunControlBlock::new("ringBusConsumer1RunControl", tile::RING_BUS_CONSUMER1_RUN_CONTROL),
    RunControlBlock::new("ringBusProducerRunControl", tile::RING_BUS_PRODUCER_RUN_CONTROL),
    RunControlBlock::new("narrowToNarrowRunControl", tile::NARROW_TO_NARROW_RUN_CONTROL),
];

/// Present entries of a table, in order.
pub fn present(table: &[RunControlBlock]) -> impl Iterator<Item = &RunControlBlock> {
    table.iter().filter(|block| !block.is_absent())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_control_values() {
        assert_eq!(RunControl::Idle.value(), 0);
        assert_eq!(RunControl::Run.value(), 1);
        assert_eq!(RunControl::Halt.value(), 2);
        assert_eq!(RunControl::SingleStep.value(), 3);
    }

    #[test]
    fn test_run_status_decode() {
        assert_eq!(RunStatus::from_raw(4), Some(RunStatus::Halted));
        assert_eq!(RunStatus::from_raw(5), None);
    }

    #[test]
    fn test_scalar_core_table() {
        let offsets: Vec<u64> = present(BEAGLE_SCALAR_CORE).map(|b| b.offset).collect();
        assert_eq!(offsets, [0x44018, 0x44158, 0x44198, 0x441d8, 0x44218]);
    }

    #[test]
    fn test_tile_table_skips_absent() {
        let present: Vec<_> = present(BEAGLE_TILE).collect();
        assert_eq!(present.len(), 10);
        assert_eq!(present[0].name, "opRunControl");
        assert_eq!(present[1].offset, 0x40150);
        assert_eq!(present[6].offset, 0x40328);
        assert_eq!(present[9].name, "ringBusProducerRunControl");
        assert!(BEAGLE_TILE
            .iter()
            .filter(|b| b.name.contains('_'))
            .all(RunControlBlock::is_absent));
    }
}
