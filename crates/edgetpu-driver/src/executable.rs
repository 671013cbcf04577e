//! Executable interpreter
//!
//! Walks an executable's DMA hints in file order and turns each into one
//! streaming call:
//!
//! | Hint | Action |
//! |------|--------|
//! | parameters | send `parameters[offset..offset + size]` |
//! | input activation | send `input[offset..offset + size]` (sign-biased if signed) |
//! | output activation | receive `size` bytes into the start of the layer's scratch |
//! | instruction | send `instruction_bitstreams[index]` |
//!
//! One completion event is read after the last hint, then every output
//! layer is relayouted into the caller's buffer and its sign bias removed.
//! Output buffers are checked before the first transfer and written only
//! after every layer has been relayouted, so a call either fills every
//! output or fails without touching any of them.

use std::collections::HashSet;

use bytes::Bytes;
use edgetpu_chip::{DescriptorTag, EventRecord};
use edgetpu_models::{transform_signed, Description, DmaHint, Executable, OutputLayer};
use tracing::{debug, trace, warn};

use crate::error::{EdgeTpuError, Result};
use crate::stream::DataStream;

/// An executable with its output scratch buffers allocated.
#[derive(Debug)]
pub struct LoadedExecutable {
    executable: Executable,
    outputs: Vec<OutputLayer>,
}

impl LoadedExecutable {
    /// Allocate scratch for every output layer of `executable`.
    ///
    /// # Errors
    ///
    /// Returns a model error if an output layer's tile layout is unusable.
    pub fn new(executable: Executable) -> Result<Self> {
        let outputs = executable
            .output_layers
            .iter()
            .map(OutputLayer::new)
            .collect::<edgetpu_models::Result<Vec<_>>>()?;
        debug!(
            "Loaded executable: {} hints, {} inputs, {} outputs",
            executable.dma_hints.len(),
            executable.input_layers.len(),
            outputs.len()
        );
        Ok(Self {
            executable,
            outputs,
        })
    }

    /// The decoded executable.
    pub const fn executable(&self) -> &Executable {
        &self.executable
    }

    /// Output layers with their scratch buffers.
    pub fn outputs(&self) -> &[OutputLayer] {
        &self.outputs
    }

    /// Dense size in bytes of each output tensor, in declaration order.
    pub fn output_sizes(&self) -> Vec<usize> {
        self.outputs.iter().map(OutputLayer::dense_size_bytes).collect()
    }

    /// Zeroed output tensors of the right sizes.
    pub fn allocate_outputs(&self) -> Vec<Vec<u8>> {
        self.output_sizes().into_iter().map(|n| vec![0; n]).collect()
    }

    /// Smallest input buffer covering every input hint.
    pub fn input_size(&self) -> usize {
        self.input_hints()
            .map(|(_, offset, size)| offset + size)
            .max()
            .unwrap_or(0)
    }

    /// Run the executable once.
    ///
    /// `input` is never modified; signed inputs are biased on a private
    /// copy. `outputs[i]` receives output layer `i` as a dense tensor.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::InvalidArgument`] before any transfer if the
    /// input or an output buffer is too small; otherwise the first
    /// streaming or relayout failure.
    pub fn invoke<S, O>(&mut self, stream: &S, input: &[u8], outputs: &mut [O]) -> Result<EventRecord>
    where
        S: DataStream + ?Sized,
        O: AsMut<[u8]>,
    {
        self.check_outputs(outputs)?;
        let input = self.stage_input(input)?;

        for hint in &self.executable.dma_hints {
            match hint {
                DmaHint::Descriptor {
                    desc: Description::Parameter,
                    offset,
                    size,
                    ..
                } => {
                    let data = region(&self.executable.parameters, *offset, *size, "parameters")?;
                    stream.send(DescriptorTag::Parameters, &data)?;
                }
                DmaHint::Descriptor {
                    desc: Description::InputActivation,
                    offset,
                    size,
                    ..
                } => {
                    let data = region(&input, *offset, *size, "input")?;
                    stream.send(DescriptorTag::InputActivations, &data)?;
                }
                DmaHint::Descriptor {
                    desc: Description::OutputActivation,
                    name,
                    offset,
                    size,
                } => {
                    let Some(output) = self.outputs.iter_mut().find(|o| o.name() == name) else {
                        warn!("Output hint for unknown layer '{}' skipped", name);
                        continue;
                    };
                    // The device writes each output hint from the start of the layer buffer.
                    trace!("Output hint '{}' at {} ({} bytes)", name, offset, size);
                    let scratch_len = output.scratch().len();
                    let target = output.scratch_mut().get_mut(..*size).ok_or_else(|| {
                        EdgeTpuError::protocol(format!(
                            "output hint of {size} bytes exceeds '{name}' scratch of {scratch_len} bytes"
                        ))
                    })?;
                    stream.receive(target)?;
                }
                DmaHint::Descriptor {
                    desc: Description::Scratchpad,
                    ..
                } => trace!("Scratchpad hint: nothing to stream"),
                DmaHint::Instruction { chunk_index } => {
                    let chunk = self
                        .executable
                        .instruction_bitstreams
                        .get(*chunk_index)
                        .ok_or_else(|| {
                            EdgeTpuError::protocol(format!(
                                "instruction hint {chunk_index} of {} chunks",
                                self.executable.instruction_bitstreams.len()
                            ))
                        })?;
                    stream.send(DescriptorTag::Instructions, chunk)?;
                }
                DmaHint::Other { hint_type } => trace!("Hint type {} skipped", hint_type),
            }
        }

        let event = stream.read_event()?;

        let mut dense = Vec::with_capacity(self.outputs.len());
        for layer in &self.outputs {
            let mut tensor = vec![0; layer.dense_size_bytes()];
            layer.relayout(&mut tensor)?;
            layer.transform_signed(&mut tensor)?;
            dense.push(tensor);
        }
        // Caller buffers are only written once every output is ready.
        for (tensor, dest) in dense.iter().zip(outputs.iter_mut()) {
            dest.as_mut()[..tensor.len()].copy_from_slice(tensor);
        }
        debug!("Invoke complete ({} outputs)", self.outputs.len());
        Ok(event)
    }

    fn input_hints(&self) -> impl Iterator<Item = (&str, usize, usize)> + '_ {
        self.executable.dma_hints.iter().filter_map(|hint| match hint {
            DmaHint::Descriptor {
                desc: Description::InputActivation,
                name,
                offset,
                size,
            } => Some((name.as_str(), *offset, *size)),
            _ => None,
        })
    }

    fn check_outputs<O: AsMut<[u8]>>(&self, outputs: &mut [O]) -> Result<()> {
        if outputs.len() < self.outputs.len() {
            return Err(EdgeTpuError::invalid_argument(format!(
                "{} output buffers for {} output layers",
                outputs.len(),
                self.outputs.len()
            )));
        }
        for (layer, dest) in self.outputs.iter().zip(outputs.iter_mut()) {
            let have = dest.as_mut().len();
            if have < layer.dense_size_bytes() {
                return Err(EdgeTpuError::invalid_argument(format!(
                    "output '{}' needs {} bytes, buffer holds {have}",
                    layer.name(),
                    layer.dense_size_bytes()
                )));
            }
        }
        Ok(())
    }

    /// Copy `input` into a buffer the hints can slice, biasing every element
    /// of a signed input layer exactly once.
    fn stage_input(&self, input: &[u8]) -> Result<Bytes> {
        let needed = self.input_size();
        if input.len() < needed {
            return Err(EdgeTpuError::invalid_argument(format!(
                "input holds {} bytes, hints address {needed}",
                input.len()
            )));
        }

        let mut staged: Option<Vec<u8>> = None;
        let mut biased = HashSet::new();
        for (name, offset, size) in self.input_hints() {
            let Some(layer) = self.executable.input_layer(name) else {
                continue;
            };
            if !layer.data_type.is_signed() {
                continue;
            }
            let element = layer.data_type.size_bytes();
            let buf = staged.get_or_insert_with(|| input.to_vec());
            let end = offset + size;
            for start in (offset..end).step_by(element.max(1)) {
                if start + element <= end && biased.insert(start) {
                    transform_signed(&mut buf[start..start + element], element, 1)?;
                }
            }
        }
        if !biased.is_empty() {
            trace!("Biased {} signed input elements", biased.len());
        }
        Ok(staged.map_or_else(|| Bytes::copy_from_slice(input), Bytes::from))
    }
}

fn region(data: &Bytes, offset: usize, size: usize, what: &str) -> Result<Bytes> {
    match offset.checked_add(size) {
        Some(end) if end <= data.len() => Ok(data.slice(offset..end)),
        _ => Err(EdgeTpuError::protocol(format!(
            "{what} hint {offset}+{size} outside {} bytes",
            data.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetpu_models::{DataType, ExecutableType, Layer, OutputLayout};
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Records sends and replays queued output bytes.
    #[derive(Debug, Default)]
    struct Recorder {
        sent: RefCell<Vec<(DescriptorTag, Vec<u8>)>>,
        replies: RefCell<VecDeque<u8>>,
        received: RefCell<Vec<usize>>,
    }

    impl DataStream for Recorder {
        fn send(&self, tag: DescriptorTag, data: &Bytes) -> Result<()> {
            self.sent.borrow_mut().push((tag, data.to_vec()));
            Ok(())
        }

        fn receive(&self, buf: &mut [u8]) -> Result<()> {
            let mut replies = self.replies.borrow_mut();
            for byte in buf.iter_mut() {
                *byte = replies.pop_front().unwrap_or(0);
            }
            self.received.borrow_mut().push(buf.len());
            Ok(())
        }

        fn read_event(&self) -> Result<EventRecord> {
            Ok(EventRecord::default())
        }
    }

    fn descriptor(desc: Description, name: &str, offset: usize, size: usize) -> DmaHint {
        DmaHint::Descriptor {
            desc,
            name: name.to_string(),
            offset,
            size,
        }
    }

    fn executable(input_type: DataType, hints: Vec<DmaHint>) -> Executable {
        Executable {
            instruction_bitstreams: vec![Bytes::from_static(&[0xC0, 0xDE])],
            parameters: Bytes::from_static(&[1, 2, 3, 4, 5, 6]),
            dma_hints: hints,
            input_layers: vec![Layer::new("in", input_type, (1, 1, 4))],
            output_layers: vec![Layer::new("out", DataType::SignedFixedPoint8, (1, 1, 4))],
            executable_type: ExecutableType::StandAlone,
            parameter_caching_token: 0,
        }
    }

    #[test]
    fn test_hints_run_in_order() {
        let exe = executable(
            DataType::FixedPoint8,
            vec![
                descriptor(Description::Parameter, "", 2, 3),
                DmaHint::Instruction { chunk_index: 0 },
                descriptor(Description::InputActivation, "in", 0, 4),
                descriptor(Description::OutputActivation, "out", 0, 4),
            ],
        );
        let mut loaded = LoadedExecutable::new(exe).unwrap();
        let stream = Recorder::default();
        let mut outputs = loaded.allocate_outputs();
        loaded.invoke(&stream, &[9, 8, 7, 6], &mut outputs).unwrap();

        let sent = stream.sent.borrow();
        assert_eq!(sent[0], (DescriptorTag::Parameters, vec![3, 4, 5]));
        assert_eq!(sent[1], (DescriptorTag::Instructions, vec![0xC0, 0xDE]));
        assert_eq!(sent[2], (DescriptorTag::InputActivations, vec![9, 8, 7, 6]));
        assert_eq!(*stream.received.borrow(), vec![4]);
    }

    #[test]
    fn test_signed_input_biased_once_on_a_copy() {
        let exe = executable(
            DataType::SignedFixedPoint8,
            vec![
                descriptor(Description::InputActivation, "in", 0, 3),
                descriptor(Description::InputActivation, "in", 2, 2),
            ],
        );
        let mut loaded = LoadedExecutable::new(exe).unwrap();
        let stream = Recorder::default();
        let input = [0x00, 0x7F, 0x80, 0xFF];
        let mut outputs = loaded.allocate_outputs();
        loaded.invoke(&stream, &input, &mut outputs).unwrap();

        let sent = stream.sent.borrow();
        assert_eq!(sent[0].1, vec![0x80, 0xFF, 0x00]);
        assert_eq!(sent[1].1, vec![0x00, 0x7F]);
        assert_eq!(input, [0x00, 0x7F, 0x80, 0xFF]);
    }

    #[test]
    fn test_signed_output_unbiased() {
        let exe = executable(
            DataType::FixedPoint8,
            vec![descriptor(Description::OutputActivation, "out", 0, 4)],
        );
        let mut loaded = LoadedExecutable::new(exe).unwrap();
        let stream = Recorder::default();
        stream.replies.borrow_mut().extend([0x80, 0x81, 0x7F, 0x00]);
        let mut outputs = loaded.allocate_outputs();
        loaded.invoke(&stream, &[0; 4], &mut outputs).unwrap();
        assert_eq!(outputs[0], vec![0x00, 0x01, 0xFF, 0x80]);
    }

    #[test]
    fn test_unknown_output_name_skipped() {
        let exe = executable(
            DataType::FixedPoint8,
            vec![descriptor(Description::OutputActivation, "missing", 0, 4)],
        );
        let mut loaded = LoadedExecutable::new(exe).unwrap();
        let stream = Recorder::default();
        let mut outputs = loaded.allocate_outputs();
        loaded.invoke(&stream, &[0; 4], &mut outputs).unwrap();
        assert!(stream.received.borrow().is_empty());
    }

    #[test]
    fn test_output_hint_offset_receives_at_buffer_start() {
        let exe = executable(
            DataType::FixedPoint8,
            vec![descriptor(Description::OutputActivation, "out", 2, 4)],
        );
        let mut loaded = LoadedExecutable::new(exe).unwrap();
        let stream = Recorder::default();
        stream.replies.borrow_mut().extend([0x01, 0x02, 0x03, 0x04]);
        let mut outputs = loaded.allocate_outputs();
        loaded.invoke(&stream, &[0; 4], &mut outputs).unwrap();
        assert_eq!(*stream.received.borrow(), vec![4]);
        assert_eq!(outputs[0], vec![0x81, 0x82, 0x83, 0x84]);
    }

    #[test]
    fn test_failed_relayout_leaves_every_output_untouched() {
        let mut exe = executable(
            DataType::FixedPoint8,
            vec![descriptor(Description::OutputActivation, "out", 0, 4)],
        );
        let mut grid = Layer::new("grid", DataType::FixedPoint8, (2, 1, 1));
        // Tile offsets missing, so relayout of this layer fails.
        grid.layout = Some(OutputLayout {
            y_coordinate_to_linear_tile_id_map: vec![0, 0],
            x_coordinate_to_linear_tile_id_map: vec![0],
            linearized_tile_byte_offset: Vec::new(),
            x_coordinate_to_local_byte_offset: vec![0],
            y_coordinate_to_local_y_offset: vec![0, 1],
            x_coordinate_to_local_y_row_size: vec![4],
        });
        exe.output_layers.push(grid);
        let mut loaded = LoadedExecutable::new(exe).unwrap();
        let stream = Recorder::default();
        stream.replies.borrow_mut().extend([0x01, 0x02, 0x03, 0x04]);

        let mut outputs = vec![vec![0xEEu8; 4], vec![0xEEu8; 2]];
        let err = loaded.invoke(&stream, &[0; 4], &mut outputs).unwrap_err();
        assert!(matches!(err, EdgeTpuError::Model { .. }));
        assert_eq!(outputs, [vec![0xEE; 4], vec![0xEE; 2]]);
    }

    #[test]
    fn test_small_output_rejected_before_streaming() {
        let exe = executable(
            DataType::FixedPoint8,
            vec![descriptor(Description::Parameter, "", 0, 6)],
        );
        let mut loaded = LoadedExecutable::new(exe).unwrap();
        let stream = Recorder::default();
        let mut outputs = vec![vec![0u8; 2]];
        let err = loaded.invoke(&stream, &[0; 4], &mut outputs).unwrap_err();
        assert!(matches!(err, EdgeTpuError::InvalidArgument { .. }));
        assert!(stream.sent.borrow().is_empty());
    }

    #[test]
    fn test_parameter_hint_out_of_range() {
        let exe = executable(
            DataType::FixedPoint8,
            vec![descriptor(Description::Parameter, "", 4, 4)],
        );
        let mut loaded = LoadedExecutable::new(exe).unwrap();
        let mut outputs = loaded.allocate_outputs();
        let err = loaded
            .invoke(&Recorder::default(), &[0; 4], &mut outputs)
            .unwrap_err();
        assert!(matches!(err, EdgeTpuError::Protocol { .. }));
    }
}
