//! Output relayout: on-chip tiled buffer → linear tensor.
//!
//! The chip writes each output layer the way its tiles hold it: every tile
//! returns a contiguous chunk, rows inside a chunk may be padded, and the
//! channel (z) run of each element may be padded too. [`OutputLayer`] owns a
//! scratch buffer shaped like that on-chip image and copies it out into a
//! dense `y, x, z` tensor.
//!
//! Physical position of logical `(y, x, z)`:
//!
//! ```text
//! tile   = y_tile_map[y] + x_tile_map[x]
//! offset = tile_byte_offset[tile]
//!        + local_y_offset[y] * row_size[x]
//!        + local_x_byte_offset[x]
//!        + z
//! ```
//!
//! Signed types cross the wire biased: the most significant byte of every
//! element has its top bit flipped. [`transform_signed`] applies (and, being
//! an involution, removes) that bias.

use crate::error::{ModelError, Result};
use crate::executable::{Layer, OutputLayout};

/// Flip the sign bit of every element's most significant byte.
///
/// Elements are little endian, `element_size` bytes each; only the first
/// `elements` elements are touched.
///
/// # Errors
///
/// Returns [`ModelError::InvalidLayer`] if `buf` is shorter than
/// `elements * element_size`.
pub fn transform_signed(buf: &mut [u8], element_size: usize, elements: usize) -> Result<()> {
    let needed = element_size * elements;
    let Some(region) = buf.get_mut(..needed) else {
        return Err(ModelError::invalid_layer(
            "<buffer>",
            format!("sign transform needs {needed} bytes, buffer has {}", buf.len()),
        ));
    };
    if element_size == 0 {
        return Ok(());
    }
    for element in region.chunks_exact_mut(element_size) {
        element[element_size - 1] ^= 0x80;
    }
    Ok(())
}

/// Row/tile coordinates of a logical y.
#[derive(Debug, Clone, Copy)]
struct YIndex {
    tile: i64,
    local_y: i64,
}

/// An output layer plus the scratch buffer the chip's output lands in.
#[derive(Debug)]
pub struct OutputLayer {
    layer: Layer,
    scratch: Vec<u8>,
}

impl OutputLayer {
    /// Allocate scratch for `layer`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidLayer`] if a multi-dimensional layer has
    /// no tile layout or its maps are shorter than its dimensions.
    pub fn new(layer: &Layer) -> Result<Self> {
        if !layer.is_one_dimensional() {
            let layout = layer.layout.as_ref().ok_or_else(|| {
                ModelError::invalid_layer(&layer.name, "multi-dimensional output has no tile layout")
            })?;
            let short = layout.y_coordinate_to_linear_tile_id_map.len() < layer.y_dim
                || layout.y_coordinate_to_local_y_offset.len() < layer.y_dim
                || layout.x_coordinate_to_linear_tile_id_map.len() < layer.x_dim
                || layout.x_coordinate_to_local_byte_offset.len() < layer.x_dim
                || layout.x_coordinate_to_local_y_row_size.len() < layer.x_dim;
            if short {
                return Err(ModelError::invalid_layer(
                    &layer.name,
                    "tile layout maps are shorter than the layer dimensions",
                ));
            }
        }
        Ok(Self {
            layer: layer.clone(),
            scratch: vec![0; layer.padded_size_bytes()],
        })
    }

    /// Layer description.
    #[must_use]
    pub const fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Layer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.layer.name
    }

    /// On-chip-shaped buffer.
    #[must_use]
    pub fn scratch(&self) -> &[u8] {
        &self.scratch
    }

    /// On-chip-shaped buffer, for the receive path to fill.
    pub fn scratch_mut(&mut self) -> &mut [u8] {
        &mut self.scratch
    }

    /// Bytes a dense output tensor for this layer needs.
    #[must_use]
    pub const fn dense_size_bytes(&self) -> usize {
        self.layer.actual_size_bytes()
    }

    /// Copy the scratch buffer into `dest` as a dense `y, x, z` tensor.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidLayer`] if `dest` is too small or the
    /// tile layout addresses bytes outside the scratch buffer.
    pub fn relayout(&self, dest: &mut [u8]) -> Result<()> {
        if self.layer.is_one_dimensional() {
            self.relayout_one_dimensional(dest)
        } else {
            self.relayout_tiled(dest)
        }
    }

    /// Remove the sign bias from a dense output tensor, if the layer's type
    /// is signed.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidLayer`] if `buf` is smaller than the
    /// layer's logical size.
    pub fn transform_signed(&self, buf: &mut [u8]) -> Result<()> {
        if !self.layer.data_type.is_signed() {
            return Ok(());
        }
        if buf.len() < self.layer.actual_size_bytes() {
            return Err(self.invalid(format!(
                "output buffer holds {} bytes, layer needs {}",
                buf.len(),
                self.layer.actual_size_bytes()
            )));
        }
        transform_signed(buf, self.layer.data_type.size_bytes(), self.layer.element_count())
    }

    /// Byte offset of logical `(y, x, z)` inside the scratch buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidLayer`] if a coordinate is outside the
    /// tile layout.
    pub fn buffer_offset(&self, y: usize, x: usize, z: usize) -> Result<usize> {
        let index = self.buffer_index(self.y_index(y)?, x, z)?;
        self.to_byte_offset(index)
    }

    fn invalid(&self, reason: impl Into<String>) -> ModelError {
        ModelError::invalid_layer(&self.layer.name, reason)
    }

    fn layout(&self) -> Result<&OutputLayout> {
        self.layer
            .layout
            .as_ref()
            .ok_or_else(|| self.invalid("no tile layout"))
    }

    fn map(&self, values: &[i32], at: usize, what: &str) -> Result<i64> {
        values
            .get(at)
            .map(|&v| i64::from(v))
            .ok_or_else(|| self.invalid(format!("{what} has no entry {at}")))
    }

    fn y_index(&self, y: usize) -> Result<YIndex> {
        let layout = self.layout()?;
        Ok(YIndex {
            tile: self.map(&layout.y_coordinate_to_linear_tile_id_map, y, "y tile map")?,
            local_y: self.map(&layout.y_coordinate_to_local_y_offset, y, "y local offset map")?,
        })
    }

    /// Element index (scaled by element size to get bytes).
    fn buffer_index(&self, y: YIndex, x: usize, z: usize) -> Result<i64> {
        let layout = self.layout()?;
        let tile = y.tile + self.map(&layout.x_coordinate_to_linear_tile_id_map, x, "x tile map")?;
        let tile = usize::try_from(tile).map_err(|_| self.invalid(format!("negative tile id {tile}")))?;
        let tile_offset = self.map(&layout.linearized_tile_byte_offset, tile, "tile offset map")?;
        let row_size = self.map(&layout.x_coordinate_to_local_y_row_size, x, "row size map")?;
        let local_x = self.map(&layout.x_coordinate_to_local_byte_offset, x, "x local offset map")?;
        let z = i64::try_from(z).map_err(|_| self.invalid("z out of range"))?;
        Ok(tile_offset + y.local_y * row_size + local_x + z)
    }

    fn to_byte_offset(&self, index: i64) -> Result<usize> {
        usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(self.layer.data_type.size_bytes()))
            .ok_or_else(|| self.invalid(format!("buffer index {index} out of range")))
    }

    fn copy(&self, dest: &mut [u8], at: usize, source: usize, len: usize) -> Result<()> {
        let src = source
            .checked_add(len)
            .and_then(|end| self.scratch.get(source..end))
            .ok_or_else(|| {
                self.invalid(format!(
                    "tile layout reads {len} bytes at {source}, scratch holds {}",
                    self.scratch.len()
                ))
            })?;
        let dst = dest
            .get_mut(at..at + len)
            .ok_or_else(|| self.invalid(format!("output buffer too small for {len} bytes at {at}")))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn relayout_one_dimensional(&self, dest: &mut [u8]) -> Result<()> {
        let z_bytes = self.layer.z_dim * self.layer.data_type.size_bytes();
        let executions = self.layer.execution_count_per_inference;
        let padded = self.layer.padded_size_bytes();
        let actual = self.layer.actual_size_bytes();

        if executions == 1 || padded == actual {
            return self.copy(dest, 0, 0, z_bytes * executions);
        }

        // Strip the padding trailing each execution.
        let padding = padded.saturating_sub(actual) / executions;
        let mut source = 0;
        for execution in 0..executions {
            self.copy(dest, execution * z_bytes, source, z_bytes)?;
            source += z_bytes + padding;
        }
        Ok(())
    }

    fn relayout_tiled(&self, dest: &mut [u8]) -> Result<()> {
        let layer = &self.layer;
        let layout = self.layout()?;
        let element_size = layer.data_type.size_bytes();
        let z_bytes = layer.z_dim * element_size;

        let origin = self.buffer_index(self.y_index(0)?, 0, 0)?;
        let next = if layer.x_dim > 1 {
            self.buffer_index(self.y_index(0)?, 1, 0)?
        } else {
            self.buffer_index(self.y_index(1)?, 0, 0)?
        };
        let z_bytes_padded = self.to_byte_offset(next - origin)?;
        // Single- and three-byte elements sit in 4-byte slots.
        let stride = if z_bytes == 1 || z_bytes == 3 { 4 } else { z_bytes_padded };

        // Consecutive x values held by the same tile.
        let x_tiles = &layout.x_coordinate_to_linear_tile_id_map[..layer.x_dim];
        let mut runs = Vec::with_capacity(layer.x_dim);
        let mut run_start = 0;
        for x in 1..layer.x_dim {
            if x_tiles[x] != x_tiles[x - 1] {
                runs.push(x - run_start);
                run_start = x;
            }
        }
        runs.push(layer.x_dim - run_start);

        let needed = layer.element_count() * element_size;
        if dest.len() < needed {
            return Err(self.invalid(format!(
                "output buffer holds {} bytes, layer needs {needed}",
                dest.len()
            )));
        }

        let mut at = 0;
        for y in 0..layer.y_dim {
            let y_index = self.y_index(y)?;
            let mut tile_x = 0;
            for &run in &runs {
                let mut source = self.to_byte_offset(self.buffer_index(y_index, tile_x, 0)?)?;
                for _ in 0..run {
                    self.copy(dest, at, source, z_bytes)?;
                    at += z_bytes;
                    source += stride;
                }
                tile_x += run;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable::DataType;

    /// 2×2 output, one x column per tile, two rows per tile, z padded to 8.
    fn two_tile_layer(z_dim: usize) -> Layer {
        let mut layer = Layer::new("out", DataType::FixedPoint8, (2, 2, z_dim));
        layer.size_bytes = 32;
        layer.layout = Some(OutputLayout {
            y_coordinate_to_linear_tile_id_map: vec![0, 0],
            x_coordinate_to_linear_tile_id_map: vec![0, 1],
            linearized_tile_byte_offset: vec![0, 16],
            x_coordinate_to_local_byte_offset: vec![0, 0],
            y_coordinate_to_local_y_offset: vec![0, 1],
            x_coordinate_to_local_y_row_size: vec![8, 8],
        });
        layer
    }

    #[test]
    fn test_two_tile_offsets_are_distinct_and_in_bounds() {
        let output = OutputLayer::new(&two_tile_layer(4)).unwrap();
        let mut offsets = Vec::new();
        for y in 0..2 {
            for x in 0..2 {
                let offset = output.buffer_offset(y, x, 0).unwrap();
                assert!(offset + 4 <= output.scratch().len());
                offsets.push(offset);
            }
        }
        assert_eq!(offsets, vec![0, 16, 8, 24]);
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
    }

    #[test]
    fn test_two_tile_relayout() {
        let mut output = OutputLayer::new(&two_tile_layer(4)).unwrap();
        for (i, byte) in output.scratch_mut().iter_mut().enumerate() {
            *byte = u8::try_from(i).unwrap();
        }
        let mut dense = vec![0u8; 16];
        output.relayout(&mut dense).unwrap();
        assert_eq!(
            dense,
            [0, 1, 2, 3, 16, 17, 18, 19, 8, 9, 10, 11, 24, 25, 26, 27]
        );
    }

    #[test]
    fn test_relayout_is_idempotent() {
        let mut output = OutputLayer::new(&two_tile_layer(4)).unwrap();
        output.scratch_mut().fill(0x5A);
        output.scratch_mut()[17] = 1;
        let before = output.scratch().to_vec();
        let mut first = vec![0u8; 16];
        let mut second = vec![0xFFu8; 16];
        output.relayout(&mut first).unwrap();
        output.relayout(&mut second).unwrap();
        assert_eq!(first, second);
        assert_eq!(output.scratch(), &before[..]);
    }

    #[test]
    fn test_single_tile_row_uses_padded_stride() {
        let mut layer = Layer::new("row", DataType::FixedPoint16, (1, 3, 1));
        layer.size_bytes = 12;
        layer.layout = Some(OutputLayout {
            y_coordinate_to_linear_tile_id_map: vec![0],
            x_coordinate_to_linear_tile_id_map: vec![0, 0, 0],
            linearized_tile_byte_offset: vec![0],
            x_coordinate_to_local_byte_offset: vec![0, 2, 4],
            y_coordinate_to_local_y_offset: vec![0],
            x_coordinate_to_local_y_row_size: vec![6, 6, 6],
        });
        let mut output = OutputLayer::new(&layer).unwrap();
        output.scratch_mut().copy_from_slice(&[1, 2, 0, 0, 3, 4, 0, 0, 5, 6, 0, 0]);
        let mut dense = vec![0u8; 6];
        output.relayout(&mut dense).unwrap();
        assert_eq!(dense, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_three_byte_z_advances_by_four() {
        let mut layer = Layer::new("rgb", DataType::FixedPoint8, (1, 2, 3));
        layer.size_bytes = 8;
        layer.layout = Some(OutputLayout {
            y_coordinate_to_linear_tile_id_map: vec![0],
            x_coordinate_to_linear_tile_id_map: vec![0, 0],
            linearized_tile_byte_offset: vec![0],
            x_coordinate_to_local_byte_offset: vec![0, 4],
            y_coordinate_to_local_y_offset: vec![0],
            x_coordinate_to_local_y_row_size: vec![8, 8],
        });
        let mut output = OutputLayer::new(&layer).unwrap();
        output.scratch_mut().copy_from_slice(&[1, 2, 3, 0, 4, 5, 6, 0]);
        let mut dense = vec![0u8; 6];
        output.relayout(&mut dense).unwrap();
        assert_eq!(dense, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_one_dimensional_strips_execution_padding() {
        let mut layer = Layer::new("vec", DataType::FixedPoint8, (1, 1, 3));
        layer.size_bytes = 4;
        layer.execution_count_per_inference = 2;
        let mut output = OutputLayer::new(&layer).unwrap();
        output.scratch_mut().copy_from_slice(&[1, 2, 3, 0, 4, 5, 6, 0]);
        let mut dense = vec![0u8; 6];
        output.relayout(&mut dense).unwrap();
        assert_eq!(dense, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_one_dimensional_single_execution_copies() {
        let layer = Layer::new("vec", DataType::FixedPoint8, (1, 1, 4));
        let mut output = OutputLayer::new(&layer).unwrap();
        output.scratch_mut().copy_from_slice(&[9, 8, 7, 6]);
        let mut dense = vec![0u8; 4];
        output.relayout(&mut dense).unwrap();
        assert_eq!(dense, [9, 8, 7, 6]);
        assert!(output.relayout(&mut [0u8; 3]).is_err());
    }

    #[test]
    fn test_missing_layout_rejected() {
        let layer = Layer::new("img", DataType::FixedPoint8, (2, 2, 1));
        assert!(OutputLayer::new(&layer).is_err());
    }

    #[test]
    fn test_sign_transform_is_an_involution() {
        let original: Vec<u8> = (0..=255).collect();
        let mut buf = original.clone();
        transform_signed(&mut buf, 2, 128).unwrap();
        assert_ne!(buf, original);
        assert_eq!(buf[1], 0x81);
        assert_eq!(buf[0], 0);
        transform_signed(&mut buf, 2, 128).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn test_sign_transform_only_for_signed_layers() {
        let signed = OutputLayer::new(&Layer::new("s", DataType::SignedFixedPoint8, (1, 1, 2))).unwrap();
        let unsigned =
            OutputLayer::new(&Layer::new("u", DataType::SignedFixedPoint32, (1, 1, 1))).unwrap();
        let mut buf = [0x00, 0x7F];
        signed.transform_signed(&mut buf).unwrap();
        assert_eq!(buf, [0x80, 0xFF]);
        let mut wide = [0u8; 4];
        unsigned.transform_signed(&mut wide).unwrap();
        assert_eq!(wide, [0; 4]);
        assert!(signed.transform_signed(&mut [0u8; 1]).is_err());
    }
}
