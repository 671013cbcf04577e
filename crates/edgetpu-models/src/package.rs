//! Compiled-model package.
//!
//! ```text
//! Package
//!  └─ serialized_multi_executable: [ubyte]   (a MultiExecutable buffer)
//!      └─ serialized_executables: [string]   (one Executable buffer each)
//! ```
//!
//! A package carries one inference executable (`STAND_ALONE` or
//! `EXECUTION_ONLY`) and optionally one `PARAMETER_CACHING` executable
//! that preloads parameters shared between packages with the same token.

use std::fs;
use std::path::Path;

use bytes::Bytes;

use crate::error::{ModelError, Result};
use crate::executable::{Executable, ExecutableType};
use crate::flatbuf::{Table, TableBuilder, Value};

/// File identifier written at bytes 4..8 of encoded packages.
pub const PACKAGE_IDENTIFIER: &[u8; 4] = b"DWN1";

const PACKAGE_SERIALIZED_MULTI_EXECUTABLE: u16 = 1;
const MULTI_EXECUTABLE_SERIALIZED_EXECUTABLES: u16 = 0;

/// A decoded package.
#[derive(Debug, Clone)]
pub struct Package {
    bytes: Bytes,
    executables: Vec<Executable>,
    inference: usize,
    parameter_caching: Option<usize>,
}

impl Package {
    /// Decode a package buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] if any level of the table tree is malformed,
    /// the package holds no executables, or none of them runs inference.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        tracing::debug!("Decoding package ({} bytes)", bytes.len());

        let root = Table::root(&bytes)?;
        let multi = root
            .bytes(PACKAGE_SERIALIZED_MULTI_EXECUTABLE)?
            .filter(|multi| !multi.is_empty())
            .ok_or(ModelError::missing("Package", "serialized_multi_executable"))?;
        let serialized = Table::root(multi)?.byte_strings(MULTI_EXECUTABLE_SERIALIZED_EXECUTABLES)?;

        let executables = serialized
            .into_iter()
            .map(|data| Executable::decode(&bytes, data))
            .collect::<Result<Vec<_>>>()?;

        // Later executables of the same role win.
        let mut inference = None;
        let mut parameter_caching = None;
        for (i, executable) in executables.iter().enumerate() {
            match executable.executable_type {
                ExecutableType::StandAlone | ExecutableType::ExecutionOnly => inference = Some(i),
                ExecutableType::ParameterCaching => parameter_caching = Some(i),
            }
        }
        let inference = inference.ok_or(ModelError::NoInferenceExecutable)?;

        tracing::info!(
            "Package: {} executables, parameter caching: {}",
            executables.len(),
            parameter_caching.is_some()
        );
        Ok(Self {
            bytes,
            executables,
            inference,
            parameter_caching,
        })
    }

    /// Load and decode a package file.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::FileNotFound`] if the path does not exist, an
    /// I/O error if it cannot be read, or a decode error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading package from: {}", path.display());
        if !path.exists() {
            return Err(ModelError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::from_bytes(fs::read(path)?)
    }

    /// Serialize executables into a package buffer.
    #[must_use]
    pub fn encode(executables: &[Executable]) -> Vec<u8> {
        let serialized = executables.iter().map(Executable::encode).collect();
        let multi = TableBuilder::new()
            .field(MULTI_EXECUTABLE_SERIALIZED_EXECUTABLES, Value::ByteStrings(serialized))
            .finish(None);
        TableBuilder::new()
            .field(PACKAGE_SERIALIZED_MULTI_EXECUTABLE, Value::Bytes(multi))
            .finish(Some(PACKAGE_IDENTIFIER))
    }

    /// The buffer the package was decoded from.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Every executable, in package order.
    #[must_use]
    pub fn executables(&self) -> &[Executable] {
        &self.executables
    }

    /// The executable that runs inference.
    #[must_use]
    pub fn inference(&self) -> &Executable {
        &self.executables[self.inference]
    }

    /// The parameter-caching executable, if the package has one.
    #[must_use]
    pub fn parameter_caching(&self) -> Option<&Executable> {
        self.parameter_caching.map(|i| &self.executables[i])
    }
}
