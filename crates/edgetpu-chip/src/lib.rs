//! Silicon model for the Edge TPU ("Beagle") USB accelerator.
//!
//! This crate performs **no I/O**. It is a pure model of the chip as seen
//! from a USB host: identifiers and endpoint layout, the vendor control
//! request that carries register accesses, the CSR offset map, typed views
//! of the registers the driver touches, the run-control block tables, and
//! the byte layouts exchanged on the bulk pipes.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`usb`] | VID/PID pairs, interface class codes, endpoints, setup packets |
//! | [`regs`] | Beagle CSR offsets grouped by block |
//! | [`fields`] | Typed bitfield views (`Omc000`, `ScuCtrl3`, `TileConfig`, ...) |
//! | [`run_control`] | Run-control states and the per-block offset tables |
//! | [`config`] | `ChipConfig`: everything bring-up needs, swappable in tests |
//! | [`wire`] | Streaming header, descriptor tags, event record |
//! | [`perf`] | The four performance presets and their clock triples |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod fields;
pub mod perf;
pub mod regs;
pub mod run_control;
pub mod usb;
pub mod wire;

pub use config::ChipConfig;
pub use perf::PerformanceMode;
pub use run_control::{RunControl, RunControlBlock, RunStatus};
pub use wire::{DescriptorTag, EventRecord, StreamHeader};
