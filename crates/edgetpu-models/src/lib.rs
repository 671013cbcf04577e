#![deny(unsafe_code)]

//! Edge TPU compiled-model packages
//!
//! This crate decodes the subset of the compiled-model format the USB
//! driver consumes and turns the chip's tiled output buffers back into
//! dense tensors.
//!
//! # Format
//!
//! Packages are nested `FlatBuffers`:
//!
//! - **Package**: wraps one serialized multi-executable
//! - **MultiExecutable**: a list of serialized executables
//! - **Executable**: instruction bitstreams, parameters, ordered DMA hints,
//!   input/output layers, type and parameter-caching token
//!
//! # Example
//!
//! ```no_run
//! use edgetpu_models::Package;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let package = Package::from_file("model_edgetpu.bin")?;
//! let exe = package.inference();
//!
//! println!("DMA hints: {}", exe.dma_hints.len());
//! println!("Outputs: {}", exe.output_layers.len());
//! println!("Parameter caching: {}", package.parameter_caching().is_some());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod error;
mod executable;
pub mod flatbuf;
mod package;
mod relayout;

pub use error::{ModelError, Result};
pub use executable::{DataType, Description, DmaHint, Executable, ExecutableType, Layer, OutputLayout};
pub use package::{Package, PACKAGE_IDENTIFIER};
pub use relayout::{transform_signed, OutputLayer};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{DataType, DmaHint, Executable, Layer, OutputLayer, Package, Result};
}
