use crate::codec::{self, DecodeError, Reader};
use crate::diff::TableDiff;
use crate::fingerprint::Fingerprint;
use crate::table::{Schema, Table, TableId};

/// Magic bytes opening every block file.
pub const MAGIC: [u8; 4] = *b"LCHB";

/// The block format version this crate writes, and the maximum it reads.
pub const BLOCK_FORMAT_VERSION: u8 = 1;

/// The atomic commit unit: a typed row-level diff against a parent state.
///
/// A block is identified by the fingerprint of its canonical serialization
/// ([`Block::id`]); it never stores its own identifier. Blocks are immutable
/// once written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// The block this diff applies to; [`Fingerprint::ZERO`] for genesis.
    pub parent: Fingerprint,
    pub table_id: TableId,
    /// Seconds since the Unix epoch, UTC.
    pub timestamp: u64,
    /// Schema echo, so the diff payload is interpretable in isolation.
    pub schema: Schema,
    pub diff: TableDiff,
    /// Fingerprint of the fully materialized table after applying `diff` to
    /// the state of `parent`.
    pub state_fp: Fingerprint,
}

impl Block {
    /// The canonical serialization of this block.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.push(BLOCK_FORMAT_VERSION);
        buf.extend_from_slice(self.table_id.as_bytes());
        buf.extend_from_slice(self.parent.as_bytes());
        buf.extend_from_slice(self.state_fp.as_bytes());
        codec::put_u64(&mut buf, self.timestamp);
        codec::write_schema(&mut buf, &self.schema);
        codec::write_diff(&mut buf, &self.diff);
        buf
    }

    /// Decode a block file payload.
    ///
    /// Rejects unknown versions, truncated payloads, mismatched tag bytes and
    /// trailing garbage.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        r.expect_magic(&MAGIC)?;
        let version = r.get_u8()?;
        if version != BLOCK_FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let table_id = r.get_table_id()?;
        let parent = r.get_fingerprint()?;
        let state_fp = r.get_fingerprint()?;
        let timestamp = r.get_u64()?;
        let schema = codec::read_schema(&mut r)?;
        let diff = codec::read_diff(&mut r, &schema)?;
        r.finish()?;
        Ok(Self {
            parent,
            table_id,
            timestamp,
            schema,
            diff,
            state_fp,
        })
    }

    /// The block's identifier: the fingerprint of its canonical
    /// serialization.
    pub fn id(&self) -> Fingerprint {
        Fingerprint::digest(&self.encode())
    }

    /// Whether this block starts a chain.
    pub fn is_genesis(&self) -> bool {
        self.parent.is_zero()
    }

    /// Build the genesis-or-successor block for a commit: the diff taking
    /// `previous` into the state fingerprinted by `state`.
    pub fn new(
        parent: Fingerprint,
        table_id: TableId,
        timestamp: u64,
        schema: Schema,
        diff: TableDiff,
        state: &Table,
    ) -> Self {
        Self {
            parent,
            table_id,
            timestamp,
            schema,
            diff,
            state_fp: state.fingerprint(),
        }
    }
}
