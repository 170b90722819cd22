use std::collections::BTreeMap;

use itertools::{EitherOrBoth, Itertools as _};
use thiserror::Error;

use crate::table::{canonical_record, Primary, Row, Table, Value};

/// Upper bound on the canonical serialization of a single record.
///
/// Derived from a 4096-byte transport frame minus fixed overhead. Inserts and
/// updates whose record would exceed this are skipped with a warning rather
/// than truncated.
pub const MAX_RECORD_BYTES: usize = 4024;

/// What a diff operation does to the row at its primary tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// The row is new; carries the full subsidiary values.
    Insert(Vec<Value>),
    /// The row is gone; the primary tuple suffices.
    Delete,
    /// The row's subsidiary values changed; carries the new values.
    Update(Vec<Value>),
}

impl OpKind {
    /// The tag byte used in the canonical encoding.
    pub fn tag(&self) -> u8 {
        match self {
            OpKind::Insert(_) => b'I',
            OpKind::Delete => b'D',
            OpKind::Update(_) => b'U',
        }
    }
}

/// One row-level diff operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    pub primary: Primary,
    pub kind: OpKind,
}

/// Two operations on the same primary tuple cannot be composed.
///
/// Arises only from corrupt chains (e.g. two consecutive inserts of the same
/// row).
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot compose '{later}' after '{earlier}'")]
pub struct ComposeConflict {
    pub earlier: char,
    pub later: char,
}

/// Compose two operations on the same primary tuple: `earlier` is applied
/// first, `later` second. `None` means the operations cancel out.
///
/// `Delete` then `Insert` nets to an `Update` carrying the inserted values;
/// minimality against the actual pre-state is restored by
/// [`TableDiff::minimized_against`].
fn compose(earlier: &OpKind, later: OpKind) -> Result<Option<OpKind>, ComposeConflict> {
    use OpKind::*;
    match (earlier, later) {
        (Insert(_), Delete) => Ok(None),
        (Insert(_), Update(subs)) => Ok(Some(Insert(subs))),
        (Update(_), Update(subs)) => Ok(Some(Update(subs))),
        (Update(_), Delete) => Ok(Some(Delete)),
        (Delete, Insert(subs)) => Ok(Some(Update(subs))),
        (earlier, later) => Err(ComposeConflict {
            earlier: earlier.tag() as char,
            later: later.tag() as char,
        }),
    }
}

/// A record insert or update that was skipped for exceeding
/// [`MAX_RECORD_BYTES`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Oversized {
    pub primary: Primary,
    pub bytes: usize,
}

/// A row-level diff for one table.
///
/// Operations are sorted lexicographically by primary tuple and there is at
/// most one operation per tuple.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableDiff {
    ops: Vec<Op>,
}

impl TableDiff {
    /// The minimal diff taking `previous` into `current`.
    ///
    /// A merge-scan over the two canonical row sequences; the result is
    /// already sorted.
    pub fn between(previous: &Table, current: &Table) -> Self {
        let ops = previous
            .iter()
            .merge_join_by(current.iter(), |(prev, _), (cur, _)| prev.cmp(cur))
            .filter_map(|merged| match merged {
                EitherOrBoth::Both((_, prev_subs), (primary, cur_subs)) => (prev_subs != cur_subs).then(|| Op {
                    primary: primary.clone(),
                    kind: OpKind::Update(cur_subs.to_vec()),
                }),
                EitherOrBoth::Left((primary, _)) => Some(Op {
                    primary: primary.clone(),
                    kind: OpKind::Delete,
                }),
                EitherOrBoth::Right((primary, subs)) => Some(Op {
                    primary: primary.clone(),
                    kind: OpKind::Insert(subs.to_vec()),
                }),
            })
            .collect();
        Self { ops }
    }

    /// A diff inserting every row of `table`, i.e. the diff from the empty
    /// table.
    pub fn full_insert(table: &Table) -> Self {
        let ops = table
            .iter()
            .map(|(primary, subs)| Op {
                primary: primary.clone(),
                kind: OpKind::Insert(subs.to_vec()),
            })
            .collect();
        Self { ops }
    }

    /// Rebuild a diff from a per-primary operation map (already canonical by
    /// construction).
    pub(crate) fn from_map(map: BTreeMap<Primary, OpKind>) -> Self {
        let ops = map.into_iter().map(|(primary, kind)| Op { primary, kind }).collect();
        Self { ops }
    }

    /// Wrap operations known to be sorted and unique (decoder path).
    pub(crate) fn from_sorted_ops(ops: Vec<Op>) -> Self {
        debug_assert!(ops.windows(2).all(|w| w[0].primary < w[1].primary));
        Self { ops }
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The operation touching `primary`, if any.
    pub fn get(&self, primary: &Primary) -> Option<&Op> {
        self.ops
            .binary_search_by(|op| op.primary.cmp(primary))
            .ok()
            .map(|i| &self.ops[i])
    }

    /// Apply this diff to an in-memory table.
    ///
    /// Strict: inserting an existing row, or deleting/updating a missing one,
    /// is an error (it means the diff does not belong to this state).
    pub fn apply(&self, table: &mut Table) -> Result<(), ApplyError> {
        for op in &self.ops {
            match &op.kind {
                OpKind::Insert(subs) => {
                    if table.insert(Row::new(op.primary.clone(), subs.clone())).is_some() {
                        return Err(ApplyError::InsertExisting(op.primary.clone()));
                    }
                }
                OpKind::Delete => {
                    if table.remove(&op.primary).is_none() {
                        return Err(ApplyError::DeleteMissing(op.primary.clone()));
                    }
                }
                OpKind::Update(subs) => {
                    if !table.contains(&op.primary) {
                        return Err(ApplyError::UpdateMissing(op.primary.clone()));
                    }
                    table.insert(Row::new(op.primary.clone(), subs.clone()));
                }
            }
        }
        Ok(())
    }

    /// The diff undoing this one, given the state it applies to.
    ///
    /// Returns `None` if the diff is inconsistent with `previous`.
    pub fn invert(&self, previous: &Table) -> Option<Self> {
        let ops = self
            .ops
            .iter()
            .map(|op| {
                let kind = match &op.kind {
                    OpKind::Insert(_) => Some(OpKind::Delete),
                    OpKind::Delete => previous.get(&op.primary).map(|subs| OpKind::Insert(subs.to_vec())),
                    OpKind::Update(_) => previous.get(&op.primary).map(|subs| OpKind::Update(subs.to_vec())),
                };
                kind.map(|kind| Op {
                    primary: op.primary.clone(),
                    kind,
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self { ops })
    }

    /// Compose `self` (applied first) with `later` into a single net diff.
    ///
    /// The result may contain updates that merely restore pre-state values;
    /// chain reconstruction follows up with [`Self::minimized_against`].
    pub fn compose(&self, later: &Self) -> Result<Self, ComposeConflict> {
        let mut map: BTreeMap<Primary, OpKind> =
            self.ops.iter().map(|op| (op.primary.clone(), op.kind.clone())).collect();
        for op in &later.ops {
            compose_into(&mut map, op.clone())?;
        }
        Ok(Self::from_map(map))
    }

    /// Drop updates whose new values equal the values in `state` (the table
    /// the diff applies to), restoring minimality after composition.
    pub fn minimized_against(mut self, state: &Table) -> Self {
        self.ops.retain(|op| match &op.kind {
            OpKind::Update(subs) => state.get(&op.primary) != Some(subs.as_slice()),
            _ => true,
        });
        self
    }

    /// Remove inserts and updates whose canonical record exceeds
    /// [`MAX_RECORD_BYTES`], returning what was skipped.
    pub fn reject_oversized(&mut self) -> Vec<Oversized> {
        let mut skipped = Vec::new();
        self.ops.retain(|op| {
            let subs = match &op.kind {
                OpKind::Insert(subs) | OpKind::Update(subs) => subs,
                OpKind::Delete => return true,
            };
            let bytes = canonical_record(&op.primary, subs).len();
            if bytes > MAX_RECORD_BYTES {
                skipped.push(Oversized {
                    primary: op.primary.clone(),
                    bytes,
                });
                false
            } else {
                true
            }
        });
        skipped
    }
}

/// Fold one more (later) operation into a per-primary accumulation map.
pub(crate) fn compose_into(map: &mut BTreeMap<Primary, OpKind>, op: Op) -> Result<(), ComposeConflict> {
    use std::collections::btree_map::Entry;
    match map.entry(op.primary) {
        Entry::Vacant(entry) => {
            entry.insert(op.kind);
        }
        Entry::Occupied(mut entry) => match compose(entry.get(), op.kind)? {
            Some(net) => {
                entry.insert(net);
            }
            None => {
                entry.remove();
            }
        },
    }
    Ok(())
}

/// A diff does not fit the table state it was applied to.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("insert of existing row '{0}'")]
    InsertExisting(Primary),
    #[error("delete of missing row '{0}'")]
    DeleteMissing(Primary),
    #[error("update of missing row '{0}'")]
    UpdateMissing(Primary),
}
