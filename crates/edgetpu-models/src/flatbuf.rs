//! Minimal `FlatBuffers` table access.
//!
//! Only what the package decoder needs: tables with scalar fields,
//! sub-tables, strings, byte vectors, `int` vectors and vectors of tables.
//! Every offset is bounds-checked against the buffer; a malformed buffer
//! produces [`ModelError::Malformed`], never a panic.
//!
//! [`TableBuilder`] writes the same subset. The encoder lays children out
//! after their parent so every `uoffset` points forward, as the format
//! requires.

use crate::error::{ModelError, Result};

const UOFFSET: usize = 4;
const VOFFSET: usize = 2;

fn read_array<const N: usize>(buf: &[u8], pos: usize, what: &str) -> Result<[u8; N]> {
    pos.checked_add(N)
        .and_then(|end| buf.get(pos..end))
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            ModelError::malformed(format!(
                "{what} at {pos} runs past end of buffer ({} bytes)",
                buf.len()
            ))
        })
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    read_array(buf, pos, "u16").map(u16::from_le_bytes)
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    read_array(buf, pos, "u32").map(u32::from_le_bytes)
}

fn read_i32(buf: &[u8], pos: usize) -> Result<i32> {
    read_array(buf, pos, "i32").map(i32::from_le_bytes)
}

/// Follow a `uoffset` stored at `pos`.
fn follow(buf: &[u8], pos: usize) -> Result<usize> {
    let offset = read_u32(buf, pos)? as usize;
    pos.checked_add(offset)
        .filter(|&target| target < buf.len())
        .ok_or_else(|| ModelError::malformed(format!("offset at {pos} points outside buffer")))
}

/// Bounds of a vector whose length prefix sits at `pos`.
fn vector(buf: &[u8], pos: usize, elem_size: usize) -> Result<(usize, usize)> {
    let len = read_u32(buf, pos)? as usize;
    let start = pos + UOFFSET;
    let end = len
        .checked_mul(elem_size)
        .and_then(|bytes| start.checked_add(bytes))
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| ModelError::malformed(format!("vector at {pos} ({len} elements) truncated")))?;
    Ok((start, end))
}

/// A table inside a buffer.
#[derive(Debug, Clone, Copy)]
pub struct Table<'a> {
    buf: &'a [u8],
    pos: usize,
    vtable: usize,
    vtable_len: usize,
}

impl<'a> Table<'a> {
    /// Root table of a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Malformed`] if the root offset or the vtable
    /// lies outside the buffer.
    pub fn root(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < 2 * UOFFSET {
            return Err(ModelError::malformed(format!(
                "buffer of {} bytes is too small for a root table",
                buf.len()
            )));
        }
        let pos = follow(buf, 0)?;
        Self::at(buf, pos)
    }

    fn at(buf: &'a [u8], pos: usize) -> Result<Self> {
        let soffset = i64::from(read_i32(buf, pos)?);
        let vtable = i64::try_from(pos)
            .ok()
            .map(|p| p - soffset)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| ModelError::malformed(format!("vtable of table at {pos} out of range")))?;
        let vtable_len = read_u16(buf, vtable)? as usize;
        if vtable_len < 2 * VOFFSET || vtable + vtable_len > buf.len() {
            return Err(ModelError::malformed(format!(
                "vtable at {vtable} has invalid length {vtable_len}"
            )));
        }
        Ok(Self {
            buf,
            pos,
            vtable,
            vtable_len,
        })
    }

    /// Absolute position of a present field.
    fn field(&self, slot: u16) -> Result<Option<usize>> {
        let entry = 2 * VOFFSET + VOFFSET * usize::from(slot);
        if entry + VOFFSET > self.vtable_len {
            return Ok(None);
        }
        match read_u16(self.buf, self.vtable + entry)? {
            0 => Ok(None),
            offset => Ok(Some(self.pos + usize::from(offset))),
        }
    }

    fn scalar<const N: usize>(&self, slot: u16) -> Result<Option<[u8; N]>> {
        self.field(slot)?
            .map(|pos| read_array(self.buf, pos, "scalar field"))
            .transpose()
    }

    /// `ubyte` field.
    pub fn u8(&self, slot: u16, default: u8) -> Result<u8> {
        Ok(self.scalar::<1>(slot)?.map_or(default, |b| b[0]))
    }

    /// `short` field.
    pub fn i16(&self, slot: u16, default: i16) -> Result<i16> {
        Ok(self.scalar(slot)?.map_or(default, i16::from_le_bytes))
    }

    /// `int` field.
    pub fn i32(&self, slot: u16, default: i32) -> Result<i32> {
        Ok(self.scalar(slot)?.map_or(default, i32::from_le_bytes))
    }

    /// `ulong` field.
    pub fn u64(&self, slot: u16, default: u64) -> Result<u64> {
        Ok(self.scalar(slot)?.map_or(default, u64::from_le_bytes))
    }

    /// Sub-table field.
    pub fn table(&self, slot: u16) -> Result<Option<Table<'a>>> {
        self.field(slot)?
            .map(|pos| Self::at(self.buf, follow(self.buf, pos)?))
            .transpose()
    }

    /// `[ubyte]` field, borrowed from the buffer.
    pub fn bytes(&self, slot: u16) -> Result<Option<&'a [u8]>> {
        let Some(pos) = self.field(slot)? else {
            return Ok(None);
        };
        let (start, end) = vector(self.buf, follow(self.buf, pos)?, 1)?;
        Ok(Some(&self.buf[start..end]))
    }

    /// `string` field.
    pub fn str(&self, slot: u16) -> Result<Option<&'a str>> {
        self.bytes(slot)?
            .map(|raw| {
                std::str::from_utf8(raw)
                    .map_err(|e| ModelError::malformed(format!("string field {slot}: {e}")))
            })
            .transpose()
    }

    /// `[int]` field. Missing vectors read as empty.
    pub fn i32s(&self, slot: u16) -> Result<Vec<i32>> {
        let Some(pos) = self.field(slot)? else {
            return Ok(Vec::new());
        };
        let (start, end) = vector(self.buf, follow(self.buf, pos)?, 4)?;
        Ok(self.buf[start..end]
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Vector-of-tables field. Missing vectors read as empty.
    pub fn tables(&self, slot: u16) -> Result<Vec<Table<'a>>> {
        self.offsets(slot)?
            .into_iter()
            .map(|target| Self::at(self.buf, target))
            .collect()
    }

    /// Vector-of-strings field, each string as raw bytes.
    pub fn byte_strings(&self, slot: u16) -> Result<Vec<&'a [u8]>> {
        self.offsets(slot)?
            .into_iter()
            .map(|target| {
                let (start, end) = vector(self.buf, target, 1)?;
                Ok(&self.buf[start..end])
            })
            .collect()
    }

    fn offsets(&self, slot: u16) -> Result<Vec<usize>> {
        let Some(pos) = self.field(slot)? else {
            return Ok(Vec::new());
        };
        let (start, end) = vector(self.buf, follow(self.buf, pos)?, UOFFSET)?;
        (start..end)
            .step_by(UOFFSET)
            .map(|elem| follow(self.buf, elem))
            .collect()
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Field value for [`TableBuilder`].
#[derive(Debug, Clone)]
pub enum Value {
    /// `ubyte`.
    U8(u8),
    /// `short`.
    I16(i16),
    /// `int`.
    I32(i32),
    /// `ulong`.
    U64(u64),
    /// `[ubyte]`.
    Bytes(Vec<u8>),
    /// `string`.
    Str(String),
    /// `[int]`.
    I32s(Vec<i32>),
    /// `[string]` of arbitrary bytes.
    ByteStrings(Vec<Vec<u8>>),
    /// Sub-table.
    Table(TableBuilder),
    /// `[table]`.
    Tables(Vec<TableBuilder>),
}

impl Value {
    /// Inline size (and alignment) of the field.
    fn inline_size(&self) -> usize {
        match self {
            Self::U8(_) => 1,
            Self::I16(_) => 2,
            Self::U64(_) => 8,
            _ => 4,
        }
    }
}

/// Table under construction.
#[derive(Debug, Clone, Default)]
pub struct TableBuilder {
    fields: Vec<(u16, Value)>,
}

impl TableBuilder {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field in vtable slot `slot`.
    #[must_use]
    pub fn field(mut self, slot: u16, value: Value) -> Self {
        self.fields.push((slot, value));
        self
    }

    /// Serialize with this table as root, optionally tagged with a file
    /// identifier at bytes 4..8.
    #[must_use]
    pub fn finish(&self, identifier: Option<&[u8; 4]>) -> Vec<u8> {
        let mut buf = vec![0u8; 2 * UOFFSET];
        if let Some(id) = identifier {
            buf[UOFFSET..].copy_from_slice(id);
        }
        let root = self.write(&mut buf);
        patch_uoffset(&mut buf, 0, root);
        buf
    }

    fn write(&self, buf: &mut Vec<u8>) -> usize {
        // Inline layout: soffset, then fields sorted by descending size.
        let mut order: Vec<usize> = (0..self.fields.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.fields[i].1.inline_size()));
        let mut inline_offsets = vec![0usize; self.fields.len()];
        let mut cursor = UOFFSET;
        for &i in &order {
            let size = self.fields[i].1.inline_size();
            cursor = cursor.next_multiple_of(size);
            inline_offsets[i] = cursor;
            cursor += size;
        }
        let object_len = cursor.next_multiple_of(UOFFSET);

        let slots = self.fields.iter().map(|(slot, _)| *slot + 1).max().unwrap_or(0);
        let vtable_len = 2 * VOFFSET + VOFFSET * usize::from(slots);

        // vtable, then the table aligned to 8.
        align(buf, 2);
        let vtable = buf.len();
        buf.extend_from_slice(&to_u16(vtable_len).to_le_bytes());
        buf.extend_from_slice(&to_u16(object_len).to_le_bytes());
        let mut entries = vec![0u16; usize::from(slots)];
        for ((slot, _), &offset) in self.fields.iter().zip(&inline_offsets) {
            entries[usize::from(*slot)] = to_u16(offset);
        }
        for entry in entries {
            buf.extend_from_slice(&entry.to_le_bytes());
        }
        align(buf, 8);
        let table = buf.len();
        buf.resize(table + object_len, 0);
        let soffset = i32::try_from(table - vtable).unwrap_or(i32::MAX);
        buf[table..table + 4].copy_from_slice(&soffset.to_le_bytes());

        for ((_, value), &offset) in self.fields.iter().zip(&inline_offsets) {
            let at = table + offset;
            match value {
                Value::U8(v) => buf[at] = *v,
                Value::I16(v) => buf[at..at + 2].copy_from_slice(&v.to_le_bytes()),
                Value::I32(v) => buf[at..at + 4].copy_from_slice(&v.to_le_bytes()),
                Value::U64(v) => buf[at..at + 8].copy_from_slice(&v.to_le_bytes()),
                Value::Bytes(bytes) => {
                    let target = write_bytes(buf, bytes, false);
                    patch_uoffset(buf, at, target);
                }
                Value::Str(s) => {
                    let target = write_bytes(buf, s.as_bytes(), true);
                    patch_uoffset(buf, at, target);
                }
                Value::I32s(values) => {
                    align(buf, 4);
                    let target = buf.len();
                    buf.extend_from_slice(&to_u32(values.len()).to_le_bytes());
                    for v in values {
                        buf.extend_from_slice(&v.to_le_bytes());
                    }
                    patch_uoffset(buf, at, target);
                }
                Value::ByteStrings(strings) => {
                    let slots = write_offset_vector(buf, strings.len());
                    patch_uoffset(buf, at, slots.0);
                    for (i, s) in strings.iter().enumerate() {
                        let target = write_bytes(buf, s, true);
                        patch_uoffset(buf, slots.1 + i * UOFFSET, target);
                    }
                }
                Value::Table(child) => {
                    let target = child.write(buf);
                    patch_uoffset(buf, at, target);
                }
                Value::Tables(children) => {
                    let slots = write_offset_vector(buf, children.len());
                    patch_uoffset(buf, at, slots.0);
                    for (i, child) in children.iter().enumerate() {
                        let target = child.write(buf);
                        patch_uoffset(buf, slots.1 + i * UOFFSET, target);
                    }
                }
            }
        }
        table
    }
}

fn align(buf: &mut Vec<u8>, to: usize) {
    let len = buf.len().next_multiple_of(to);
    buf.resize(len, 0);
}

fn to_u16(v: usize) -> u16 {
    u16::try_from(v).unwrap_or(u16::MAX)
}

fn to_u32(v: usize) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

fn patch_uoffset(buf: &mut [u8], at: usize, target: usize) {
    let offset = to_u32(target - at);
    buf[at..at + UOFFSET].copy_from_slice(&offset.to_le_bytes());
}

/// Length-prefixed byte vector; strings get a trailing NUL.
fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8], nul: bool) -> usize {
    align(buf, 4);
    let start = buf.len();
    buf.extend_from_slice(&to_u32(bytes.len()).to_le_bytes());
    buf.extend_from_slice(bytes);
    if nul {
        buf.push(0);
    }
    start
}

/// Offset vector with `len` zeroed slots. Returns (vector, first slot).
fn write_offset_vector(buf: &mut Vec<u8>, len: usize) -> (usize, usize) {
    align(buf, 4);
    let start = buf.len();
    buf.extend_from_slice(&to_u32(len).to_le_bytes());
    buf.resize(buf.len() + len * UOFFSET, 0);
    (start, start + UOFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        TableBuilder::new()
            .field(0, Value::Str("conv".into()))
            .field(1, Value::I32(-7))
            .field(3, Value::U64(0xDEAD_BEEF_0000_0001))
            .field(4, Value::U8(2))
            .field(5, Value::I32s(vec![1, 2, 3]))
            .field(
                6,
                Value::Tables(vec![
                    TableBuilder::new().field(0, Value::I16(11)),
                    TableBuilder::new().field(0, Value::I16(22)),
                ]),
            )
            .field(7, Value::Table(TableBuilder::new().field(1, Value::Bytes(vec![9, 8]))))
            .field(8, Value::ByteStrings(vec![vec![0xAA], vec![0xBB, 0xCC]]))
            .finish(Some(b"TEST"))
    }

    #[test]
    fn test_read_back_every_kind() {
        let buf = sample();
        assert_eq!(&buf[4..8], b"TEST");
        let root = Table::root(&buf).unwrap();
        assert_eq!(root.str(0).unwrap(), Some("conv"));
        assert_eq!(root.i32(1, 0).unwrap(), -7);
        assert_eq!(root.i32(2, 42).unwrap(), 42);
        assert_eq!(root.u64(3, 0).unwrap(), 0xDEAD_BEEF_0000_0001);
        assert_eq!(root.u8(4, 0).unwrap(), 2);
        assert_eq!(root.i32s(5).unwrap(), vec![1, 2, 3]);
        let children = root.tables(6).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].i16(0, 0).unwrap(), 22);
        let sub = root.table(7).unwrap().unwrap();
        assert_eq!(sub.bytes(1).unwrap(), Some(&[9u8, 8][..]));
        assert_eq!(sub.bytes(0).unwrap(), None);
        let strings = root.byte_strings(8).unwrap();
        assert_eq!(strings, vec![&[0xAA][..], &[0xBB, 0xCC][..]]);
    }

    #[test]
    fn test_slot_beyond_vtable_is_default() {
        let buf = TableBuilder::new().field(0, Value::I32(5)).finish(None);
        let root = Table::root(&buf).unwrap();
        assert_eq!(root.i32(9, 1).unwrap(), 1);
        assert!(root.tables(9).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_buffer_is_rejected() {
        let buf = sample();
        for cut in [0, 3, 8, buf.len() / 2] {
            let truncated = &buf[..cut];
            let result = Table::root(truncated).and_then(|root| {
                root.str(0)?;
                root.i32s(5)?;
                root.tables(6)?;
                root.byte_strings(8)?;
                Ok(())
            });
            assert!(result.is_err(), "cut at {cut} decoded");
        }
    }

    #[test]
    fn test_root_offset_out_of_range() {
        let mut buf = sample();
        buf[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(Table::root(&buf).is_err());
    }
}
