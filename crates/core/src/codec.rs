//! Primitives shared by the block and patch-file encodings.
//!
//! All integers are big-endian; every octet string (field values and field
//! names alike) is prefixed by a 32-bit length. Encoding is canonical:
//! re-encoding a decoded payload yields byte-identical output.

use thiserror::Error;

use crate::diff::{Op, OpKind, TableDiff};
use crate::fingerprint::{Fingerprint, FINGERPRINT_LEN};
use crate::table::{Primary, Schema, TableId, Value};

/// Why a block or patch payload could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    Truncated,
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown tag byte {0:#04x}")]
    BadTag(u8),
    #[error("invalid table id")]
    BadTableId,
    #[error("field name is not valid utf-8")]
    BadFieldName,
    #[error("invalid schema: {0}")]
    BadSchema(String),
    #[error("diff operations out of order")]
    UnsortedOps,
    #[error("patch entries out of order")]
    UnsortedEntries,
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_value(buf: &mut Vec<u8>, value: &[u8]) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value);
}

/// A cursor over an in-memory payload.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        self.get_array::<1>().map(|[b]| b)
    }

    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        self.get_array().map(u32::from_be_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64, DecodeError> {
        self.get_array().map(u64::from_be_bytes)
    }

    pub fn get_value(&mut self) -> Result<Value, DecodeError> {
        let len = self.get_u32()? as usize;
        self.take(len).map(<[u8]>::to_vec)
    }

    pub fn get_string(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.get_value()?).map_err(|_| DecodeError::BadFieldName)
    }

    pub fn get_fingerprint(&mut self) -> Result<Fingerprint, DecodeError> {
        self.get_array::<FINGERPRINT_LEN>().map(Fingerprint::from_bytes)
    }

    pub fn get_table_id(&mut self) -> Result<TableId, DecodeError> {
        let raw = self.get_array::<3>()?;
        TableId::from_raw(raw).map_err(|_| DecodeError::BadTableId)
    }

    pub fn expect_magic(&mut self, magic: &[u8; 4]) -> Result<(), DecodeError> {
        if &self.get_array::<4>()? == magic {
            Ok(())
        } else {
            Err(DecodeError::BadMagic)
        }
    }

    /// Assert the payload has been fully consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.buf.len()))
        }
    }
}

/// Schema echo: length-prefixed primary field names, then subsidiary.
pub(crate) fn write_schema(buf: &mut Vec<u8>, schema: &Schema) {
    put_u32(buf, schema.primary().len() as u32);
    for name in schema.primary() {
        put_value(buf, name.as_bytes());
    }
    put_u32(buf, schema.subsidiary().len() as u32);
    for name in schema.subsidiary() {
        put_value(buf, name.as_bytes());
    }
}

pub(crate) fn read_schema(r: &mut Reader<'_>) -> Result<Schema, DecodeError> {
    let n_primary = r.get_u32()? as usize;
    let mut primary = Vec::with_capacity(n_primary.min(64));
    for _ in 0..n_primary {
        primary.push(r.get_string()?);
    }
    let n_subsidiary = r.get_u32()? as usize;
    let mut subsidiary = Vec::with_capacity(n_subsidiary.min(64));
    for _ in 0..n_subsidiary {
        subsidiary.push(r.get_string()?);
    }
    Schema::new(primary, subsidiary).map_err(|e| DecodeError::BadSchema(e.to_string()))
}

/// Diff payload: a length-prefixed operation list. Each operation is a tag
/// byte, the primary tuple, and (for inserts and updates) the subsidiary
/// values, all in schema order.
pub(crate) fn write_diff(buf: &mut Vec<u8>, diff: &TableDiff) {
    put_u32(buf, diff.len() as u32);
    for op in diff.ops() {
        buf.push(op.kind.tag());
        for field in op.primary.fields() {
            put_value(buf, field);
        }
        match &op.kind {
            OpKind::Insert(subs) | OpKind::Update(subs) => {
                for field in subs {
                    put_value(buf, field);
                }
            }
            OpKind::Delete => {}
        }
    }
}

pub(crate) fn read_diff(r: &mut Reader<'_>, schema: &Schema) -> Result<TableDiff, DecodeError> {
    let n_ops = r.get_u32()? as usize;
    let mut ops = Vec::with_capacity(n_ops.min(1024));
    for _ in 0..n_ops {
        let tag = r.get_u8()?;
        let mut primary = Vec::with_capacity(schema.primary().len());
        for _ in 0..schema.primary().len() {
            primary.push(r.get_value()?);
        }
        let primary = Primary::new(primary);
        let kind = match tag {
            b'I' | b'U' => {
                let mut subs = Vec::with_capacity(schema.subsidiary().len());
                for _ in 0..schema.subsidiary().len() {
                    subs.push(r.get_value()?);
                }
                if tag == b'I' {
                    OpKind::Insert(subs)
                } else {
                    OpKind::Update(subs)
                }
            }
            b'D' => OpKind::Delete,
            other => return Err(DecodeError::BadTag(other)),
        };
        ops.push(Op { primary, kind });
    }
    if !ops.windows(2).all(|w: &[Op]| w[0].primary < w[1].primary) {
        return Err(DecodeError::UnsortedOps);
    }
    Ok(TableDiff::from_sorted_ops(ops))
}
