use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::Path;

use log::debug;
use tempfile::NamedTempFile;

use leech_paths::{BlocksDir, HeadsDir, PeersDir, Workdir};

use crate::block::Block;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::lockfile::Lockfile;
use crate::table::TableId;

/// The content-addressed on-disk store of blocks, per-table head pointers
/// and per-peer last-seen pointers.
///
/// All writes go through a temp file in the target directory followed by an
/// atomic rename, so readers never observe partial files.
#[derive(Debug)]
pub struct BlockStore {
    workdir: Workdir,
    blocks: BlocksDir,
    heads: HeadsDir,
    peers: PeersDir,
}

impl BlockStore {
    /// Open (and lay out) the store under `workdir`.
    pub fn open(workdir: Workdir) -> Result<Self> {
        let blocks = workdir.blocks();
        let heads = workdir.heads();
        let peers = workdir.peers();
        blocks.create()?;
        heads.create()?;
        peers.create()?;
        Ok(Self {
            workdir,
            blocks,
            heads,
            peers,
        })
    }

    pub fn workdir(&self) -> &Workdir {
        &self.workdir
    }

    /// Acquire the single-writer lock for this store's workdir.
    pub fn lock(&self) -> Result<Lockfile> {
        Lockfile::acquire(self.workdir.lock_file())
    }

    /// Serialize `block` and write it under its fingerprint.
    ///
    /// Writing a block that already exists is a no-op, provided the stored
    /// content is byte-identical; a mismatch is [`Error::CorruptStore`].
    pub fn put_block(&self, block: &Block) -> Result<Fingerprint> {
        let bytes = block.encode();
        let fp = Fingerprint::digest(&bytes);
        let path = self.blocks.block(fp);

        if path.as_path().exists() {
            return self.check_duplicate(fp, &bytes).map(|()| fp);
        }

        let mut tmp = NamedTempFile::new_in(&self.blocks)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!("stored block {fp} ({} bytes)", bytes.len());
                Ok(fp)
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                // Lost a race against another writer; contents must agree.
                self.check_duplicate(fp, &bytes).map(|()| fp)
            }
            Err(e) => Err(Error::Io(e.error)),
        }
    }

    fn check_duplicate(&self, fp: Fingerprint, bytes: &[u8]) -> Result<()> {
        let existing = fs::read(self.blocks.block(fp))?;
        if existing == bytes {
            debug!("block {fp} already stored");
            Ok(())
        } else {
            Err(Error::CorruptStore(format!(
                "block {fp} already exists with different content"
            )))
        }
    }

    /// Load and decode the block identified by `fp`.
    ///
    /// Verifies that the file content actually hashes to `fp`.
    pub fn get_block(&self, fp: Fingerprint) -> Result<Block> {
        let bytes = match fs::read(self.blocks.block(fp)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::UnknownBlock(fp)),
            Err(e) => return Err(Error::Io(e)),
        };
        if Fingerprint::digest(&bytes) != fp {
            return Err(Error::CorruptStore(format!(
                "block file {fp} does not hash to its name"
            )));
        }
        Block::decode(&bytes).map_err(|source| Error::CorruptBlock { fp, source })
    }

    pub fn has_block(&self, fp: Fingerprint) -> bool {
        self.blocks.block(fp).as_path().exists()
    }

    pub(crate) fn delete_block(&self, fp: Fingerprint) -> Result<()> {
        match fs::remove_file(self.blocks.block(fp)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::UnknownBlock(fp)),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// The current head of `table_id`'s chain, if the table has ever been
    /// committed.
    pub fn head(&self, table_id: TableId) -> Result<Option<Fingerprint>> {
        let path = self.heads.head(table_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        text.trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::CorruptStore(format!("malformed head file for table {table_id}")))
    }

    /// Advance the head of `table_id` to `fp`.
    ///
    /// `fp` must name a block present in the store.
    pub fn set_head(&self, table_id: TableId, fp: Fingerprint) -> Result<()> {
        if !self.has_block(fp) {
            return Err(Error::UnknownBlock(fp));
        }
        self.write_atomic(self.heads.as_ref(), self.heads.head(table_id).as_ref(), format!("{fp}\n").as_bytes())
    }

    /// The last head fingerprints received from `host_id`, per table.
    ///
    /// An absent peer file is an empty map: nothing has been received yet.
    pub fn peer(&self, host_id: &str) -> Result<BTreeMap<TableId, Fingerprint>> {
        let path = self.peers.peer(host_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let mut map = BTreeMap::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let parsed = line
                .split_once(' ')
                .and_then(|(id, fp)| Some((id.parse::<TableId>().ok()?, fp.trim().parse::<Fingerprint>().ok()?)));
            match parsed {
                Some((table_id, fp)) => {
                    map.insert(table_id, fp);
                }
                None => {
                    return Err(Error::CorruptStore(format!(
                        "malformed peer file for host '{host_id}'"
                    )))
                }
            }
        }
        Ok(map)
    }

    /// Record the last head fingerprints received from `host_id`.
    ///
    /// One `<table-id> <fingerprint>` line per table, in table order.
    pub fn set_peer(&self, host_id: &str, pointers: &BTreeMap<TableId, Fingerprint>) -> Result<()> {
        let mut text = String::new();
        for (table_id, fp) in pointers {
            text.push_str(&format!("{table_id} {fp}\n"));
        }
        self.write_atomic(self.peers.as_ref(), self.peers.peer(host_id).as_ref(), text.as_bytes())
    }

    /// All host ids with a peer pointer file.
    pub fn peer_hosts(&self) -> Result<Vec<String>> {
        let mut hosts = Vec::new();
        for entry in fs::read_dir(&self.peers)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    hosts.push(name);
                }
            }
        }
        hosts.sort_unstable();
        Ok(hosts)
    }

    /// Write `bytes` to `path` via a temp file in `dir` plus rename,
    /// replacing any previous content.
    pub(crate) fn write_atomic(&self, dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::diff::TableDiff;
    use crate::table::testutil::{schema, table};

    fn store() -> (tempfile::TempDir, BlockStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlockStore::open(Workdir::from_path_unchecked(tmp.path())).unwrap();
        (tmp, store)
    }

    fn sample_block() -> Block {
        let state = table(1, &[&["a", "1"], &["b", "2"]]);
        Block::new(
            Fingerprint::ZERO,
            TableId::new("BTL").unwrap(),
            1_700_000_000,
            schema(&["name"], &["val"]),
            TableDiff::full_insert(&state),
            &state,
        )
    }

    #[test]
    fn put_get_roundtrip() {
        let (_tmp, store) = store();
        let block = sample_block();
        let fp = store.put_block(&block).unwrap();
        assert_eq!(fp, block.id());
        assert_eq!(store.get_block(fp).unwrap(), block);
    }

    #[test]
    fn duplicate_put_is_a_noop() {
        let (_tmp, store) = store();
        let block = sample_block();
        let fp = store.put_block(&block).unwrap();
        assert_eq!(store.put_block(&block).unwrap(), fp);
    }

    #[test]
    fn mismatched_duplicate_is_corrupt() {
        let (_tmp, store) = store();
        let block = sample_block();
        let fp = block.id();
        fs::write(store.blocks.block(fp), b"not the block").unwrap();
        assert!(matches!(store.put_block(&block), Err(Error::CorruptStore(_))));
    }

    #[test]
    fn tampered_block_file_is_detected() {
        let (_tmp, store) = store();
        let block = sample_block();
        let fp = store.put_block(&block).unwrap();
        let mut bytes = fs::read(store.blocks.block(fp)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(store.blocks.block(fp), &bytes).unwrap();
        assert!(matches!(store.get_block(fp), Err(Error::CorruptStore(_))));
    }

    #[test]
    fn get_unknown_block() {
        let (_tmp, store) = store();
        let fp = Fingerprint::digest(b"nowhere");
        assert!(matches!(store.get_block(fp), Err(Error::UnknownBlock(_))));
    }

    #[test]
    fn head_roundtrip() {
        let (_tmp, store) = store();
        let table_id = TableId::new("BTL").unwrap();
        assert_eq!(store.head(table_id).unwrap(), None);

        let fp = store.put_block(&sample_block()).unwrap();
        store.set_head(table_id, fp).unwrap();
        assert_eq!(store.head(table_id).unwrap(), Some(fp));
    }

    #[test]
    fn set_head_refuses_unknown_blocks() {
        let (_tmp, store) = store();
        let table_id = TableId::new("BTL").unwrap();
        let fp = Fingerprint::digest(b"nowhere");
        assert!(matches!(store.set_head(table_id, fp), Err(Error::UnknownBlock(_))));
    }

    #[test]
    fn peer_roundtrip() {
        let (_tmp, store) = store();
        assert!(store.peer("SHA=123").unwrap().is_empty());

        let mut pointers = BTreeMap::new();
        pointers.insert(TableId::new("BTL").unwrap(), Fingerprint::digest(b"one"));
        pointers.insert(TableId::new("PFL").unwrap(), Fingerprint::digest(b"two"));
        store.set_peer("SHA=123", &pointers).unwrap();

        assert_eq!(store.peer("SHA=123").unwrap(), pointers);
        assert_eq!(store.peer_hosts().unwrap(), ["SHA=123"]);
    }

    #[test]
    fn malformed_peer_file_is_corrupt() {
        let (_tmp, store) = store();
        fs::write(store.peers.peer("SHA=123"), "gibberish\n").unwrap();
        assert!(matches!(store.peer("SHA=123"), Err(Error::CorruptStore(_))));
    }
}
