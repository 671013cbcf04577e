//! Executable: the unit the driver streams to the chip.
//!
//! Decoded from one serialized `Executable` table. Large payloads
//! (parameters, instruction bitstreams) are [`Bytes`] slices of the package
//! buffer, so decoding copies no model data.

use bytes::Bytes;

use crate::error::{ModelError, Result};
use crate::flatbuf::{Table, TableBuilder, Value};

/// Vtable slots of the tables the driver reads.
mod slot {
    pub mod executable {
        pub const INSTRUCTION_BITSTREAMS: u16 = 5;
        pub const PARAMETERS: u16 = 6;
        pub const DMA_HINTS: u16 = 7;
        pub const INPUT_LAYERS: u16 = 8;
        pub const OUTPUT_LAYERS: u16 = 9;
        pub const TYPE: u16 = 13;
        pub const PARAMETER_CACHING_TOKEN: u16 = 14;
    }
    pub mod bitstream {
        pub const BITSTREAM: u16 = 0;
    }
    pub mod dma_hints {
        pub const HINTS: u16 = 0;
    }
    pub mod hint {
        pub const ANY_HINT_TYPE: u16 = 0;
        pub const ANY_HINT: u16 = 1;
    }
    pub mod descriptor {
        pub const META: u16 = 0;
        pub const OFFSET_IN_BYTES: u16 = 1;
        pub const SIZE_IN_BYTES: u16 = 2;
    }
    pub mod meta {
        pub const DESC: u16 = 0;
        pub const NAME: u16 = 1;
    }
    pub mod instruction {
        pub const CHUNK_INDEX: u16 = 0;
    }
    pub mod layer {
        pub const NAME: u16 = 0;
        pub const SIZE_BYTES: u16 = 1;
        pub const Y_DIM: u16 = 2;
        pub const X_DIM: u16 = 3;
        pub const Z_DIM: u16 = 4;
        pub const DATA_TYPE: u16 = 6;
        pub const ANY_LAYER_TYPE: u16 = 7;
        pub const ANY_LAYER: u16 = 8;
        pub const EXECUTION_COUNT_PER_INFERENCE: u16 = 9;
    }
    pub mod output_layer {
        pub const LAYOUT: u16 = 0;
    }
    pub mod layout {
        pub const Y_TO_LINEAR_TILE_ID: u16 = 0;
        pub const X_TO_LINEAR_TILE_ID: u16 = 1;
        pub const LINEARIZED_TILE_BYTE_OFFSET: u16 = 2;
        pub const X_TO_LOCAL_BYTE_OFFSET: u16 = 3;
        pub const Y_TO_LOCAL_Y_OFFSET: u16 = 4;
        pub const X_TO_LOCAL_Y_ROW_SIZE: u16 = 5;
    }
}

/// Union tag of `DmaHint.any_hint`.
const HINT_DESCRIPTOR: u8 = 1;
const HINT_INSTRUCTION: u8 = 2;

/// Union tag of `Layer.any_layer`.
const LAYER_OUTPUT: u8 = 1;

// ── Enumerations ─────────────────────────────────────────────────────────────

/// Element type of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Unsigned 8-bit fixed point.
    FixedPoint8,
    /// Unsigned 16-bit fixed point.
    FixedPoint16,
    /// Signed 32-bit fixed point.
    SignedFixedPoint32,
    /// bfloat16.
    Bfloat,
    /// IEEE half.
    Half,
    /// IEEE single.
    Single,
    /// Signed 8-bit fixed point.
    SignedFixedPoint8,
    /// Signed 16-bit fixed point.
    SignedFixedPoint16,
}

impl DataType {
    /// Decode the schema value.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::UnknownValue`] for values outside the enum.
    pub fn from_raw(raw: i16) -> Result<Self> {
        Ok(match raw {
            0 => Self::FixedPoint8,
            1 => Self::FixedPoint16,
            2 => Self::SignedFixedPoint32,
            3 => Self::Bfloat,
            4 => Self::Half,
            5 => Self::Single,
            6 => Self::SignedFixedPoint8,
            7 => Self::SignedFixedPoint16,
            _ => {
                return Err(ModelError::UnknownValue {
                    field: "Layer.data_type",
                    value: i64::from(raw),
                })
            }
        })
    }

    /// Schema value.
    #[must_use]
    pub const fn raw(self) -> i16 {
        match self {
            Self::FixedPoint8 => 0,
            Self::FixedPoint16 => 1,
            Self::SignedFixedPoint32 => 2,
            Self::Bfloat => 3,
            Self::Half => 4,
            Self::Single => 5,
            Self::SignedFixedPoint8 => 6,
            Self::SignedFixedPoint16 => 7,
        }
    }

    /// Bytes per element.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::FixedPoint8 | Self::SignedFixedPoint8 => 1,
            Self::FixedPoint16 | Self::SignedFixedPoint16 | Self::Bfloat | Self::Half => 2,
            Self::SignedFixedPoint32 | Self::Single => 4,
        }
    }

    /// Whether values cross the wire with their sign bit flipped.
    ///
    /// `SignedFixedPoint32` is reported as unsigned, matching the chip's
    /// existing behavior for that type.
    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::SignedFixedPoint8 | Self::SignedFixedPoint16)
    }
}

/// Role of an executable inside a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutableType {
    /// Parameters and inference in one executable.
    StandAlone,
    /// Loads parameters into on-chip memory once.
    ParameterCaching,
    /// Inference relying on cached parameters.
    ExecutionOnly,
}

impl ExecutableType {
    fn from_raw(raw: i16) -> Result<Self> {
        match raw {
            0 => Ok(Self::StandAlone),
            1 => Ok(Self::ParameterCaching),
            2 => Ok(Self::ExecutionOnly),
            _ => Err(ModelError::UnknownValue {
                field: "Executable.type",
                value: i64::from(raw),
            }),
        }
    }

    const fn raw(self) -> i16 {
        match self {
            Self::StandAlone => 0,
            Self::ParameterCaching => 1,
            Self::ExecutionOnly => 2,
        }
    }

    /// True for executables that produce outputs.
    #[must_use]
    pub const fn is_inference(self) -> bool {
        matches!(self, Self::StandAlone | Self::ExecutionOnly)
    }
}

/// Buffer a descriptor hint refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Description {
    /// Output activations.
    OutputActivation,
    /// Input activations.
    InputActivation,
    /// Parameters.
    Parameter,
    /// On-chip scratch; nothing to stream.
    Scratchpad,
}

impl Description {
    fn from_raw(raw: i16) -> Result<Self> {
        match raw {
            0 => Ok(Self::OutputActivation),
            1 => Ok(Self::InputActivation),
            2 => Ok(Self::Parameter),
            3 => Ok(Self::Scratchpad),
            _ => Err(ModelError::UnknownValue {
                field: "Meta.desc",
                value: i64::from(raw),
            }),
        }
    }

    const fn raw(self) -> i16 {
        match self {
            Self::OutputActivation => 0,
            Self::InputActivation => 1,
            Self::Parameter => 2,
            Self::Scratchpad => 3,
        }
    }
}

// ── Hints ────────────────────────────────────────────────────────────────────

/// One step of the execution-order contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmaHint {
    /// Move a byte range of a named buffer.
    Descriptor {
        /// Which buffer.
        desc: Description,
        /// Layer name (empty for parameters).
        name: String,
        /// Byte offset into the buffer.
        offset: usize,
        /// Byte count.
        size: usize,
    },
    /// Send one instruction bitstream chunk.
    Instruction {
        /// Index into [`Executable::instruction_bitstreams`].
        chunk_index: usize,
    },
    /// A hint kind the host has nothing to do for (interrupts, fences).
    Other {
        /// Raw union tag.
        hint_type: u8,
    },
}

fn non_negative(value: i32, field: &'static str) -> Result<usize> {
    usize::try_from(value).map_err(|_| ModelError::UnknownValue {
        field,
        value: i64::from(value),
    })
}

impl DmaHint {
    fn decode(table: &Table<'_>) -> Result<Self> {
        let hint_type = table.u8(slot::hint::ANY_HINT_TYPE, 0)?;
        match hint_type {
            HINT_DESCRIPTOR => {
                let hint = table
                    .table(slot::hint::ANY_HINT)?
                    .ok_or(ModelError::missing("DmaHint", "any_hint"))?;
                let meta = hint
                    .table(slot::descriptor::META)?
                    .ok_or(ModelError::missing("DmaDescriptorHint", "meta"))?;
                Ok(Self::Descriptor {
                    desc: Description::from_raw(meta.i16(slot::meta::DESC, 0)?)?,
                    name: meta.str(slot::meta::NAME)?.unwrap_or_default().to_string(),
                    offset: non_negative(
                        hint.i32(slot::descriptor::OFFSET_IN_BYTES, 0)?,
                        "DmaDescriptorHint.offset_in_bytes",
                    )?,
                    size: non_negative(
                        hint.i32(slot::descriptor::SIZE_IN_BYTES, 0)?,
                        "DmaDescriptorHint.size_in_bytes",
                    )?,
                })
            }
            HINT_INSTRUCTION => {
                let hint = table
                    .table(slot::hint::ANY_HINT)?
                    .ok_or(ModelError::missing("DmaHint", "any_hint"))?;
                Ok(Self::Instruction {
                    chunk_index: non_negative(
                        hint.i32(slot::instruction::CHUNK_INDEX, 0)?,
                        "InstructionHint.instruction_chunk_index",
                    )?,
                })
            }
            other => Ok(Self::Other { hint_type: other }),
        }
    }

    fn encode(&self) -> TableBuilder {
        match self {
            Self::Descriptor {
                desc,
                name,
                offset,
                size,
            } => {
                let mut meta = TableBuilder::new().field(slot::meta::DESC, Value::I16(desc.raw()));
                if !name.is_empty() {
                    meta = meta.field(slot::meta::NAME, Value::Str(name.clone()));
                }
                let hint = TableBuilder::new()
                    .field(slot::descriptor::META, Value::Table(meta))
                    .field(slot::descriptor::OFFSET_IN_BYTES, Value::I32(to_i32(*offset)))
                    .field(slot::descriptor::SIZE_IN_BYTES, Value::I32(to_i32(*size)));
                TableBuilder::new()
                    .field(slot::hint::ANY_HINT_TYPE, Value::U8(HINT_DESCRIPTOR))
                    .field(slot::hint::ANY_HINT, Value::Table(hint))
            }
            Self::Instruction { chunk_index } => {
                let hint = TableBuilder::new()
                    .field(slot::instruction::CHUNK_INDEX, Value::I32(to_i32(*chunk_index)));
                TableBuilder::new()
                    .field(slot::hint::ANY_HINT_TYPE, Value::U8(HINT_INSTRUCTION))
                    .field(slot::hint::ANY_HINT, Value::Table(hint))
            }
            Self::Other { hint_type } => {
                TableBuilder::new().field(slot::hint::ANY_HINT_TYPE, Value::U8(*hint_type))
            }
        }
    }
}

fn to_i32(v: usize) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

// ── Layers ───────────────────────────────────────────────────────────────────

/// How an output layer is scattered across tiles in the on-chip buffer.
///
/// All maps are indexed by logical coordinate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputLayout {
    /// y → linear tile id contribution.
    pub y_coordinate_to_linear_tile_id_map: Vec<i32>,
    /// x → linear tile id contribution.
    pub x_coordinate_to_linear_tile_id_map: Vec<i32>,
    /// Linear tile id → byte offset of that tile's chunk.
    pub linearized_tile_byte_offset: Vec<i32>,
    /// x → byte offset inside a tile row.
    pub x_coordinate_to_local_byte_offset: Vec<i32>,
    /// y → row inside a tile.
    pub y_coordinate_to_local_y_offset: Vec<i32>,
    /// x → row size of the tile that x lives in.
    pub x_coordinate_to_local_y_row_size: Vec<i32>,
}

impl OutputLayout {
    fn decode(table: &Table<'_>) -> Result<Self> {
        use slot::layout as s;
        Ok(Self {
            y_coordinate_to_linear_tile_id_map: table.i32s(s::Y_TO_LINEAR_TILE_ID)?,
            x_coordinate_to_linear_tile_id_map: table.i32s(s::X_TO_LINEAR_TILE_ID)?,
            linearized_tile_byte_offset: table.i32s(s::LINEARIZED_TILE_BYTE_OFFSET)?,
            x_coordinate_to_local_byte_offset: table.i32s(s::X_TO_LOCAL_BYTE_OFFSET)?,
            y_coordinate_to_local_y_offset: table.i32s(s::Y_TO_LOCAL_Y_OFFSET)?,
            x_coordinate_to_local_y_row_size: table.i32s(s::X_TO_LOCAL_Y_ROW_SIZE)?,
        })
    }

    fn encode(&self) -> TableBuilder {
        use slot::layout as s;
        TableBuilder::new()
            .field(s::Y_TO_LINEAR_TILE_ID, Value::I32s(self.y_coordinate_to_linear_tile_id_map.clone()))
            .field(s::X_TO_LINEAR_TILE_ID, Value::I32s(self.x_coordinate_to_linear_tile_id_map.clone()))
            .field(s::LINEARIZED_TILE_BYTE_OFFSET, Value::I32s(self.linearized_tile_byte_offset.clone()))
            .field(s::X_TO_LOCAL_BYTE_OFFSET, Value::I32s(self.x_coordinate_to_local_byte_offset.clone()))
            .field(s::Y_TO_LOCAL_Y_OFFSET, Value::I32s(self.y_coordinate_to_local_y_offset.clone()))
            .field(s::X_TO_LOCAL_Y_ROW_SIZE, Value::I32s(self.x_coordinate_to_local_y_row_size.clone()))
    }
}

/// Input or output layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Name referenced by descriptor hints.
    pub name: String,
    /// On-chip (padded) size of one execution's data.
    pub size_bytes: usize,
    /// Rows.
    pub y_dim: usize,
    /// Columns.
    pub x_dim: usize,
    /// Channels.
    pub z_dim: usize,
    /// Element type.
    pub data_type: DataType,
    /// How many times the layer is produced per inference.
    pub execution_count_per_inference: usize,
    /// Tile layout (output layers only).
    pub layout: Option<OutputLayout>,
}

impl Layer {
    /// Layer without a tile layout.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType, dims: (usize, usize, usize)) -> Self {
        let (y_dim, x_dim, z_dim) = dims;
        Self {
            name: name.into(),
            size_bytes: y_dim * x_dim * z_dim * data_type.size_bytes(),
            y_dim,
            x_dim,
            z_dim,
            data_type,
            execution_count_per_inference: 1,
            layout: None,
        }
    }

    /// Number of logical elements.
    #[must_use]
    pub const fn element_count(&self) -> usize {
        self.y_dim * self.x_dim * self.z_dim
    }

    /// Logical (unpadded) bytes over every execution.
    #[must_use]
    pub const fn actual_size_bytes(&self) -> usize {
        self.element_count() * self.data_type.size_bytes() * self.execution_count_per_inference
    }

    /// On-chip bytes over every execution.
    #[must_use]
    pub const fn padded_size_bytes(&self) -> usize {
        self.size_bytes * self.execution_count_per_inference
    }

    /// True when only the z dimension is populated.
    #[must_use]
    pub const fn is_one_dimensional(&self) -> bool {
        self.x_dim == 1 && self.y_dim == 1
    }

    fn decode(table: &Table<'_>) -> Result<Self> {
        use slot::layer as s;
        let name = table
            .str(s::NAME)?
            .ok_or(ModelError::missing("Layer", "name"))?
            .to_string();
        let layout = if table.u8(s::ANY_LAYER_TYPE, 0)? == LAYER_OUTPUT {
            let output = table
                .table(s::ANY_LAYER)?
                .ok_or(ModelError::missing("Layer", "any_layer"))?;
            output
                .table(slot::output_layer::LAYOUT)?
                .map(|layout| OutputLayout::decode(&layout))
                .transpose()?
        } else {
            None
        };
        Ok(Self {
            size_bytes: non_negative(table.i32(s::SIZE_BYTES, 0)?, "Layer.size_bytes")?,
            y_dim: non_negative(table.i32(s::Y_DIM, 0)?, "Layer.y_dim")?,
            x_dim: non_negative(table.i32(s::X_DIM, 0)?, "Layer.x_dim")?,
            z_dim: non_negative(table.i32(s::Z_DIM, 0)?, "Layer.z_dim")?,
            data_type: DataType::from_raw(table.i16(s::DATA_TYPE, 0)?)?,
            execution_count_per_inference: non_negative(
                table.i32(s::EXECUTION_COUNT_PER_INFERENCE, 1)?,
                "Layer.execution_count_per_inference",
            )?
            .max(1),
            layout,
            name,
        })
    }

    fn encode(&self) -> TableBuilder {
        use slot::layer as s;
        let mut table = TableBuilder::new()
            .field(s::NAME, Value::Str(self.name.clone()))
            .field(s::SIZE_BYTES, Value::I32(to_i32(self.size_bytes)))
            .field(s::Y_DIM, Value::I32(to_i32(self.y_dim)))
            .field(s::X_DIM, Value::I32(to_i32(self.x_dim)))
            .field(s::Z_DIM, Value::I32(to_i32(self.z_dim)))
            .field(s::DATA_TYPE, Value::I16(self.data_type.raw()))
            .field(
                s::EXECUTION_COUNT_PER_INFERENCE,
                Value::I32(to_i32(self.execution_count_per_inference)),
            );
        if let Some(layout) = &self.layout {
            let output = TableBuilder::new().field(slot::output_layer::LAYOUT, Value::Table(layout.encode()));
            table = table
                .field(s::ANY_LAYER_TYPE, Value::U8(LAYER_OUTPUT))
                .field(s::ANY_LAYER, Value::Table(output));
        }
        table
    }
}

// ── Executable ───────────────────────────────────────────────────────────────

/// A decoded executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    /// Instruction chunks, addressed by instruction hints.
    pub instruction_bitstreams: Vec<Bytes>,
    /// Parameter blob, addressed by parameter hints.
    pub parameters: Bytes,
    /// Hints in execution order.
    pub dma_hints: Vec<DmaHint>,
    /// Input layers.
    pub input_layers: Vec<Layer>,
    /// Output layers, in output-tensor order.
    pub output_layers: Vec<Layer>,
    /// Role in the package.
    pub executable_type: ExecutableType,
    /// Identifies the parameter set a caching executable loads.
    pub parameter_caching_token: u64,
}

impl Executable {
    /// Decode a standalone serialized `Executable`.
    ///
    /// # Errors
    ///
    /// Returns a [`ModelError`] if the table tree is malformed or an enum
    /// field is out of range.
    pub fn from_bytes(buf: Bytes) -> Result<Self> {
        Self::decode(&buf, &buf)
    }

    /// Decode a serialized `Executable` stored at `data`, a sub-slice of
    /// `buf`. Payloads are returned as slices of `buf`.
    pub(crate) fn decode(buf: &Bytes, data: &[u8]) -> Result<Self> {
        use slot::executable as s;
        let root = Table::root(data)?;

        let instruction_bitstreams = root
            .tables(s::INSTRUCTION_BITSTREAMS)?
            .iter()
            .map(|chunk| {
                Ok(chunk
                    .bytes(slot::bitstream::BITSTREAM)?
                    .map_or_else(Bytes::new, |raw| buf.slice_ref(raw)))
            })
            .collect::<Result<Vec<_>>>()?;
        let parameters = root
            .bytes(s::PARAMETERS)?
            .map_or_else(Bytes::new, |raw| buf.slice_ref(raw));
        let dma_hints = match root.table(s::DMA_HINTS)? {
            Some(hints) => hints
                .tables(slot::dma_hints::HINTS)?
                .iter()
                .map(DmaHint::decode)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        let input_layers = root
            .tables(s::INPUT_LAYERS)?
            .iter()
            .map(Layer::decode)
            .collect::<Result<Vec<_>>>()?;
        let output_layers = root
            .tables(s::OUTPUT_LAYERS)?
            .iter()
            .map(Layer::decode)
            .collect::<Result<Vec<_>>>()?;

        let executable = Self {
            instruction_bitstreams,
            parameters,
            dma_hints,
            input_layers,
            output_layers,
            executable_type: ExecutableType::from_raw(root.i16(s::TYPE, 0)?)?,
            parameter_caching_token: root.u64(s::PARAMETER_CACHING_TOKEN, 0)?,
        };
        tracing::debug!(
            "Decoded {:?} executable: {} hints, {} bitstreams, {} parameter bytes",
            executable.executable_type,
            executable.dma_hints.len(),
            executable.instruction_bitstreams.len(),
            executable.parameters.len()
        );
        Ok(executable)
    }

    /// Serialize to a standalone `Executable` buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        use slot::executable as s;
        let bitstreams = self
            .instruction_bitstreams
            .iter()
            .map(|b| TableBuilder::new().field(slot::bitstream::BITSTREAM, Value::Bytes(b.to_vec())))
            .collect();
        let hints = TableBuilder::new().field(
            slot::dma_hints::HINTS,
            Value::Tables(self.dma_hints.iter().map(DmaHint::encode).collect()),
        );
        TableBuilder::new()
            .field(s::INSTRUCTION_BITSTREAMS, Value::Tables(bitstreams))
            .field(s::PARAMETERS, Value::Bytes(self.parameters.to_vec()))
            .field(s::DMA_HINTS, Value::Table(hints))
            .field(s::INPUT_LAYERS, Value::Tables(self.input_layers.iter().map(Layer::encode).collect()))
            .field(s::OUTPUT_LAYERS, Value::Tables(self.output_layers.iter().map(Layer::encode).collect()))
            .field(s::TYPE, Value::I16(self.executable_type.raw()))
            .field(s::PARAMETER_CACHING_TOKEN, Value::U64(self.parameter_caching_token))
            .finish(None)
    }

    /// Input layer by name.
    #[must_use]
    pub fn input_layer(&self, name: &str) -> Option<&Layer> {
        self.input_layers.iter().find(|layer| layer.name == name)
    }

    /// Output layer by name.
    #[must_use]
    pub fn output_layer(&self, name: &str) -> Option<&Layer> {
        self.output_layers.iter().find(|layer| layer.name == name)
    }
}
