//! The patch file: a transport-level container bundling composite diffs for a
//! set of tables between a `from` and a `to` fingerprint.
//!
//! Patches are plain files; nothing here does networking. The operation
//! encoding is shared with the block format.

use crate::codec::{self, DecodeError, Reader};
use crate::diff::TableDiff;
use crate::fingerprint::Fingerprint;
use crate::table::{Schema, TableId};

/// Magic bytes opening every patch file.
pub const MAGIC: [u8; 4] = *b"LCHP";

/// The patch format version this crate writes, and the maximum it reads.
pub const PATCH_FORMAT_VERSION: u8 = 1;

/// How a patch entry is applied at the destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchMode {
    /// Apply the diff operations as-is.
    Delta,
    /// First drop the host's entire slice of the destination, then apply the
    /// (insert-only) diff.
    Rebase,
}

impl PatchMode {
    fn tag(self) -> u8 {
        match self {
            PatchMode::Delta => b'D',
            PatchMode::Rebase => b'R',
        }
    }

    fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            b'D' => Ok(PatchMode::Delta),
            b'R' => Ok(PatchMode::Rebase),
            other => Err(DecodeError::BadTag(other)),
        }
    }
}

/// One table's share of a patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchEntry {
    pub table_id: TableId,
    pub mode: PatchMode,
    /// The ancestor state this diff starts from; [`Fingerprint::ZERO`] for a
    /// full rebuild.
    pub from: Fingerprint,
    /// The head state this diff ends at. Recorded as the peer pointer after
    /// successful application.
    pub to: Fingerprint,
    /// Schema echo needed to interpret `diff`.
    pub schema: Schema,
    pub diff: TableDiff,
}

/// A decoded patch file. Entries are sorted by table id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    entries: Vec<PatchEntry>,
}

impl Patch {
    /// Bundle `entries` into a patch, sorting them by table id.
    pub fn new(mut entries: Vec<PatchEntry>) -> Self {
        entries.sort_by_key(|e| e.table_id);
        Self { entries }
    }

    pub fn entries(&self) -> &[PatchEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The canonical serialization of this patch.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.push(PATCH_FORMAT_VERSION);
        codec::put_u32(&mut buf, self.entries.len() as u32);
        for entry in &self.entries {
            buf.extend_from_slice(entry.table_id.as_bytes());
            buf.push(entry.mode.tag());
            buf.extend_from_slice(entry.from.as_bytes());
            buf.extend_from_slice(entry.to.as_bytes());
            codec::write_schema(&mut buf, &entry.schema);
            codec::write_diff(&mut buf, &entry.diff);
        }
        buf
    }

    /// Decode a patch file payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        r.expect_magic(&MAGIC)?;
        let version = r.get_u8()?;
        if version != PATCH_FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let n_entries = r.get_u32()? as usize;
        let mut entries = Vec::with_capacity(n_entries.min(256));
        for _ in 0..n_entries {
            let table_id = r.get_table_id()?;
            let mode = PatchMode::from_tag(r.get_u8()?)?;
            let from = r.get_fingerprint()?;
            let to = r.get_fingerprint()?;
            let schema = codec::read_schema(&mut r)?;
            let diff = codec::read_diff(&mut r, &schema)?;
            entries.push(PatchEntry {
                table_id,
                mode,
                from,
                to,
                schema,
                diff,
            });
        }
        r.finish()?;
        if !entries.windows(2).all(|w| w[0].table_id < w[1].table_id) {
            return Err(DecodeError::UnsortedEntries);
        }
        Ok(Self { entries })
    }
}
