//! Chain traversal and reconstruction: walking parent links, materializing
//! table states, composing row-level diffs between any two reachable blocks,
//! and truncating chains for purge.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use log::debug;

use crate::block::Block;
use crate::diff::{compose_into, OpKind, TableDiff};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::store::BlockStore;
use crate::table::{Primary, Schema, Table, TableId, Value};

/// One `history` result: what a block did to the queried primary tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: u64,
    /// The operation tag, `I`, `D` or `U`.
    pub operation: char,
    /// New subsidiary values, keyed by field name. Empty for deletes.
    pub subsidiary: Vec<(String, Value)>,
}

/// Outcome of truncating one table's chain.
#[derive(Clone, Debug)]
pub struct Truncation {
    /// The synthetic root now carrying the materialized state.
    pub merge_root: Fingerprint,
    pub new_head: Fingerprint,
    /// Blocks removed from the store.
    pub removed: Vec<Fingerprint>,
}

impl BlockStore {
    /// The blocks along `table_id`'s chain from `from` (exclusive) to `to`
    /// (inclusive), oldest first.
    ///
    /// `from` may be the null fingerprint, meaning the whole chain down to
    /// genesis. [`Error::UnreachableAncestor`] if `from` is not an ancestor
    /// of `to`.
    pub fn walk(&self, table_id: TableId, from: Fingerprint, to: Fingerprint) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cursor = to;
        while cursor != from {
            if cursor.is_zero() {
                return Err(Error::UnreachableAncestor { from, to });
            }
            if !seen.insert(cursor) {
                return Err(Error::CorruptStore(format!(
                    "cycle in chain of table {table_id} at block {cursor}"
                )));
            }
            let block = self.get_block(cursor)?;
            if block.table_id != table_id {
                return Err(Error::CorruptStore(format!(
                    "block {cursor} belongs to table {} but was reached from table {table_id}",
                    block.table_id
                )));
            }
            cursor = block.parent;
            blocks.push(block);
        }
        blocks.reverse();
        Ok(blocks)
    }

    /// Replay diffs from genesis to produce the table state at `fp`.
    ///
    /// The null fingerprint materializes to the empty table.
    pub fn materialize(&self, table_id: TableId, fp: Fingerprint) -> Result<Table> {
        let mut state = Table::new();
        for block in self.walk(table_id, Fingerprint::ZERO, fp)? {
            let id = block.id();
            block.diff.apply(&mut state).map_err(|e| {
                Error::CorruptStore(format!("diff of block {id} does not apply to its parent state: {e}"))
            })?;
        }
        Ok(state)
    }

    /// The minimal row-level diff between the states at `from` and `to`.
    ///
    /// Returns the schema echo of the `to` block alongside the diff. A null
    /// `from` yields the full insert set of the materialized `to` state.
    pub fn composite_diff(&self, table_id: TableId, from: Fingerprint, to: Fingerprint) -> Result<(Schema, TableDiff)> {
        let to_block = self.get_block(to)?;
        let schema = to_block.schema.clone();

        if from.is_zero() {
            let state = self.materialize(table_id, to)?;
            return Ok((schema, TableDiff::full_insert(&state)));
        }

        let blocks = self.walk(table_id, from, to)?;
        let mut net: BTreeMap<Primary, OpKind> = BTreeMap::new();
        for block in &blocks {
            let id = block.id();
            for op in block.diff.ops() {
                compose_into(&mut net, op.clone())
                    .map_err(|e| Error::CorruptStore(format!("chain of table {table_id} at block {id}: {e}")))?;
            }
        }

        // Delete-then-insert pairs compose to updates; drop the ones that
        // merely restored the pre-state values.
        let from_state = self.materialize(table_id, from)?;
        let diff = TableDiff::from_map(net).minimized_against(&from_state);
        debug!(
            "composite diff {from}..{to} for table {table_id}: {} ops over {} blocks",
            diff.len(),
            blocks.len()
        );
        Ok((schema, diff))
    }

    /// Every touch of `primary` along `table_id`'s chain, newest first,
    /// optionally restricted to an inclusive timestamp window.
    pub fn history(
        &self,
        table_id: TableId,
        primary: &Primary,
        from: Bound<u64>,
        to: Bound<u64>,
    ) -> Result<Vec<HistoryEntry>> {
        let Some(head) = self.head(table_id)? else {
            return Ok(Vec::new());
        };
        let range = (from, to);
        let mut entries = Vec::new();
        for block in self.walk(table_id, Fingerprint::ZERO, head)?.iter().rev() {
            if !range_contains(&range, block.timestamp) {
                continue;
            }
            if let Some(op) = block.diff.get(primary) {
                let subsidiary = match &op.kind {
                    OpKind::Insert(subs) | OpKind::Update(subs) => block
                        .schema
                        .subsidiary()
                        .iter()
                        .cloned()
                        .zip(subs.iter().cloned())
                        .collect(),
                    OpKind::Delete => Vec::new(),
                };
                entries.push(HistoryEntry {
                    timestamp: block.timestamp,
                    operation: op.kind.tag() as char,
                    subsidiary,
                });
            }
        }
        Ok(entries)
    }

    /// Truncate `table_id`'s chain to its `keep` most recent blocks.
    ///
    /// The oldest surviving block is replaced by a synthetic root (a merge
    /// block whose diff is the full insert set of the materialized state at
    /// that point); the blocks above it are rewritten to the new parentage.
    /// New blocks are written and the head advanced before any old block is
    /// removed, so concurrent readers always find an intact chain.
    ///
    /// Returns `None` when the chain is already short enough.
    pub fn truncate_chain(&self, table_id: TableId, keep: usize) -> Result<Option<Truncation>> {
        let Some(head) = self.head(table_id)? else {
            return Ok(None);
        };
        let chain = self.walk(table_id, Fingerprint::ZERO, head)?;
        if chain.len() <= keep || keep == 0 {
            return Ok(None);
        }

        let cut = chain.len() - keep;
        let old_ids: Vec<Fingerprint> = chain.iter().map(Block::id).collect();

        let base = &chain[cut];
        let base_id = old_ids[cut];
        let state = self.materialize(table_id, base_id)?;
        if state.fingerprint() != base.state_fp {
            return Err(Error::CorruptStore(format!(
                "state fingerprint of block {base_id} does not match its materialized table"
            )));
        }

        let merge = Block {
            parent: Fingerprint::ZERO,
            table_id,
            timestamp: base.timestamp,
            schema: base.schema.clone(),
            diff: TableDiff::full_insert(&state),
            state_fp: base.state_fp,
        };
        let merge_root = self.put_block(&merge)?;

        let mut new_ids = BTreeSet::new();
        new_ids.insert(merge_root);
        let mut parent = merge_root;
        for block in &chain[cut + 1..] {
            let mut rewritten = block.clone();
            rewritten.parent = parent;
            parent = self.put_block(&rewritten)?;
            new_ids.insert(parent);
        }
        self.set_head(table_id, parent)?;

        let mut removed = Vec::new();
        for old_id in old_ids {
            if !new_ids.contains(&old_id) {
                self.delete_block(old_id)?;
                removed.push(old_id);
            }
        }
        debug!(
            "truncated chain of table {table_id}: merge root {merge_root}, head {parent}, {} blocks removed",
            removed.len()
        );
        Ok(Some(Truncation {
            merge_root,
            new_head: parent,
            removed,
        }))
    }
}

fn range_contains(range: &(Bound<u64>, Bound<u64>), ts: u64) -> bool {
    use std::ops::RangeBounds as _;
    range.contains(&ts)
}
