//! Command orchestration.
//!
//! Each command is a strict sequence of synchronous steps over a [`Context`];
//! the single-writer lock is held for the duration of any command that
//! mutates blocks, heads or peers.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::ops::Bound;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::Serialize;

use leech_paths::Workdir;

use crate::adapter::{Adapter, OpenArgs, Qualified, Registry};
use crate::block::Block;
use crate::chain::Truncation;
use crate::config::{Config, EndpointConfig};
use crate::diff::{OpKind, TableDiff};
use crate::error::{AdapterError, Error, Result};
use crate::fingerprint::Fingerprint;
use crate::patchfile::{Patch, PatchEntry, PatchMode};
use crate::store::BlockStore;
use crate::table::{Primary, Row, Schema, Table, TableId};

/// Per-command state: the workdir's configuration, its block store and the
/// adapter registry.
pub struct Context {
    config: Config,
    store: BlockStore,
    registry: Registry,
}

impl Context {
    /// Load the configuration of `workdir` and open its block store.
    pub fn open(workdir: Workdir, registry: Registry) -> Result<Self> {
        let config = Config::load(&workdir)?;
        let store = BlockStore::open(workdir)?;
        Ok(Self {
            config,
            store,
            registry,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }
}

/// Summary of one `commit` run.
#[derive(Debug, Default)]
pub struct CommitSummary {
    /// Tables that got a new block, with its fingerprint.
    pub committed: Vec<(TableId, Fingerprint)>,
    /// Oversized records skipped with a warning.
    pub skipped_records: usize,
}

/// Snapshot every configured table into the block store.
///
/// Tables whose source is unchanged get no new block; their head stays put.
pub fn commit(ctx: &Context) -> Result<CommitSummary> {
    let _lock = ctx.store.lock()?;
    let timestamp = unix_now();
    let mut summary = CommitSummary::default();

    for (&table_id, table_cfg) in &ctx.config.tables {
        let schema = table_cfg.table_schema()?;
        let mut source = open_endpoint(&ctx.registry, &table_cfg.source, &schema, table_id)?;
        let current = read_table(source.as_mut(), table_id)?;
        source.close().map_err(|e| Error::adapter(table_id, e))?;

        let head = ctx.store.head(table_id)?;
        let previous = match head {
            Some(fp) => ctx.store.materialize(table_id, fp)?,
            None => Table::new(),
        };

        let mut diff = TableDiff::between(&previous, &current);
        for skipped in diff.reject_oversized() {
            warn!(
                "table {table_id}: skipping oversized record '{}' ({} bytes)",
                skipped.primary, skipped.bytes
            );
            summary.skipped_records += 1;
        }
        if diff.is_empty() {
            debug!("table {table_id}: source unchanged, no block written");
            continue;
        }

        let mut state = previous;
        diff.apply(&mut state)
            .map_err(|e| Error::CorruptStore(format!("table {table_id}: freshly computed diff does not apply: {e}")))?;

        let block = Block {
            parent: head.unwrap_or(Fingerprint::ZERO),
            table_id,
            timestamp,
            schema,
            diff,
            state_fp: state.fingerprint(),
        };
        let fp = ctx.store.put_block(&block)?;
        ctx.store.set_head(table_id, fp)?;
        info!("table {table_id}: committed block {fp} ({} ops)", block.diff.len());
        summary.committed.push((table_id, fp));
    }

    if ctx.config.auto_purge {
        if let Some(keep) = ctx.config.chain_length {
            purge_locked(ctx, keep)?;
        }
    }
    Ok(summary)
}

/// Emit a patch file with the composite diff from `from` to every current
/// head, across all configured tables.
///
/// `from` may be the null fingerprint, meaning a full rebuild. A non-null
/// `from` that is not on some table's chain (e.g. after a purge, or for a
/// table that joined the configuration later) degrades to a full rebuild for
/// that table, with a warning.
pub fn diff(ctx: &Context, from: Fingerprint, out: &Path) -> Result<()> {
    let mut entries = Vec::new();
    for (&table_id, _) in &ctx.config.tables {
        let Some(head) = ctx.store.head(table_id)? else {
            debug!("table {table_id}: nothing committed yet, not in patch");
            continue;
        };

        let (schema, table_diff, actual_from) = if from.is_zero() {
            let (schema, diff) = ctx.store.composite_diff(table_id, Fingerprint::ZERO, head)?;
            (schema, diff, Fingerprint::ZERO)
        } else {
            match ctx.store.composite_diff(table_id, from, head) {
                Ok((schema, diff)) => (schema, diff, from),
                Err(Error::UnreachableAncestor { .. }) => {
                    warn!("table {table_id}: block {from} is not on this chain, falling back to a full rebuild");
                    let (schema, diff) = ctx.store.composite_diff(table_id, Fingerprint::ZERO, head)?;
                    (schema, diff, Fingerprint::ZERO)
                }
                Err(e) => return Err(e),
            }
        };
        entries.push(PatchEntry {
            table_id,
            mode: PatchMode::Delta,
            from: actual_from,
            to: head,
            schema,
            diff: table_diff,
        });
    }
    write_patch(ctx, &Patch::new(entries), out)
}

/// Emit a patch that replaces the host's slice of the destination with the
/// current committed source state of every configured table.
pub fn rebase(ctx: &Context, out: &Path) -> Result<()> {
    let mut entries = Vec::new();
    for (&table_id, table_cfg) in &ctx.config.tables {
        let (schema, diff, to) = match ctx.store.head(table_id)? {
            Some(head) => {
                let state = ctx.store.materialize(table_id, head)?;
                let schema = ctx.store.get_block(head)?.schema;
                (schema, TableDiff::full_insert(&state), head)
            }
            None => (table_cfg.table_schema()?, TableDiff::default(), Fingerprint::ZERO),
        };
        entries.push(PatchEntry {
            table_id,
            mode: PatchMode::Rebase,
            from: Fingerprint::ZERO,
            to,
            schema,
            diff,
        });
    }
    write_patch(ctx, &Patch::new(entries), out)
}

/// Summary of one `patch` run.
#[derive(Debug, Default)]
pub struct PatchSummary {
    pub applied: Vec<TableId>,
    /// The whole patch was already recorded for this host.
    pub noop: bool,
}

/// Apply a patch file against the destination endpoints, qualifying every
/// row with `(field, value)`.
///
/// All destination transactions are begun before the first mutation; on any
/// failure everything is rolled back and the command fails with
/// `PatchFailed`. Commits run sequentially; a failure after the first
/// successful commit is reported as `PartialCommit`.
pub fn patch(ctx: &Context, field: &str, value: &str, file: &Path) -> Result<PatchSummary> {
    let bytes = fs::read(file)?;
    let patch = Patch::decode(&bytes).map_err(|source| Error::CorruptPatch { source })?;

    let _lock = ctx.store.lock()?;

    let mut peer = ctx.store.peer(value)?;
    let pending: Vec<&PatchEntry> = patch
        .entries()
        .iter()
        .filter(|entry| peer.get(&entry.table_id) != Some(&entry.to))
        .collect();
    if pending.is_empty() {
        info!("patch already applied for host '{value}'");
        return Ok(PatchSummary {
            applied: Vec::new(),
            noop: true,
        });
    }

    // Open all destinations first; nothing is mutated if any endpoint is
    // missing or misconfigured.
    let mut adapters: Vec<(TableId, Qualified)> = Vec::with_capacity(pending.len());
    for entry in &pending {
        let Some(table_cfg) = ctx.config.tables.get(&entry.table_id) else {
            return Err(Error::PatchFailed(format!(
                "patch contains table {} which is not configured",
                entry.table_id
            )));
        };
        let expected = table_cfg.table_schema()?;
        if expected != entry.schema {
            return Err(Error::adapter(
                entry.table_id,
                AdapterError::SchemaMismatch("patch schema echo does not match the configuration".into()),
            ));
        }
        let qualified_schema = entry
            .schema
            .qualified(field)
            .map_err(|e| Error::Config(format!("qualifier field '{field}': {e}")))?;
        let inner = open_endpoint(&ctx.registry, &table_cfg.destination, &qualified_schema, entry.table_id)?;
        adapters.push((entry.table_id, Qualified::new(inner, value.as_bytes().to_vec())));
    }

    // Anything that goes wrong between begin and the first commit rolls
    // everything back.
    let mut adapters = scopeguard::guard(adapters, |mut adapters| {
        for (table_id, adapter) in adapters.iter_mut() {
            if let Err(e) = adapter.rollback_transaction() {
                warn!("table {table_id}: rollback failed: {e}");
            }
        }
    });

    for (table_id, adapter) in adapters.iter_mut() {
        adapter
            .begin_transaction()
            .map_err(|e| Error::PatchFailed(format!("table {table_id}: {e}")))?;
    }
    for (entry, (table_id, adapter)) in pending.iter().zip(adapters.iter_mut()) {
        apply_entry(entry, adapter).map_err(|e| Error::PatchFailed(format!("table {table_id}: {e}")))?;
    }

    let mut adapters = scopeguard::ScopeGuard::into_inner(adapters);

    // Best-effort two-phase commit: sequential, with rollback of whatever
    // has not committed yet if one fails.
    let mut committed = Vec::new();
    for i in 0..adapters.len() {
        let (table_id, adapter) = &mut adapters[i];
        let table_id = *table_id;
        if let Err(source) = adapter.commit_transaction() {
            for (other_id, other) in adapters.iter_mut() {
                if !committed.contains(other_id) {
                    if let Err(e) = other.rollback_transaction() {
                        warn!("table {other_id}: rollback failed: {e}");
                    }
                }
            }
            if committed.is_empty() {
                return Err(Error::PatchFailed(format!("table {table_id}: {source}")));
            }
            return Err(Error::PartialCommit {
                committed,
                failed: table_id,
                source,
            });
        }
        committed.push(table_id);
    }

    for (table_id, adapter) in adapters.iter_mut() {
        if let Err(e) = adapter.close() {
            warn!("table {table_id}: close failed: {e}");
        }
    }

    for entry in &pending {
        peer.insert(entry.table_id, entry.to);
    }
    ctx.store.set_peer(value, &peer)?;

    info!("applied patch for host '{value}' ({} tables)", pending.len());
    Ok(PatchSummary {
        applied: pending.iter().map(|e| e.table_id).collect(),
        noop: false,
    })
}

fn apply_entry(entry: &PatchEntry, adapter: &mut Qualified) -> Result<(), AdapterError> {
    if entry.mode == PatchMode::Rebase {
        // Drop the host's entire slice before re-inserting.
        let existing: Vec<Primary> = adapter
            .read_all()?
            .map(|row| row.map(|r| r.primary))
            .collect::<Result<_, _>>()?;
        for primary in existing {
            adapter.delete(&primary)?;
        }
    }
    for op in entry.diff.ops() {
        match &op.kind {
            OpKind::Insert(subs) => adapter.insert(&Row::new(op.primary.clone(), subs.clone()))?,
            OpKind::Delete => adapter.delete(&op.primary)?,
            OpKind::Update(subs) => adapter.update(&op.primary, subs)?,
        }
    }
    Ok(())
}

/// Summary of one `purge` run.
#[derive(Debug, Default)]
pub struct PurgeSummary {
    pub truncated: Vec<(TableId, Truncation)>,
}

/// Truncate every chain to the configured `chain_length`.
///
/// A no-op unless `chain_length` is configured. Tables with `merge_blocks`
/// disabled are exempt: without a merge block the dropped history could not
/// be reconstructed.
pub fn purge(ctx: &Context) -> Result<PurgeSummary> {
    let Some(keep) = ctx.config.chain_length else {
        info!("chain_length not configured; purge is a no-op");
        return Ok(PurgeSummary::default());
    };
    let _lock = ctx.store.lock()?;
    purge_locked(ctx, keep)
}

fn purge_locked(ctx: &Context, keep: usize) -> Result<PurgeSummary> {
    let mut summary = PurgeSummary::default();
    for (&table_id, table_cfg) in &ctx.config.tables {
        if !table_cfg.merge_blocks {
            debug!("table {table_id}: merge blocks disabled, exempt from purge");
            continue;
        }
        if let Some(truncation) = ctx.store.truncate_chain(table_id, keep)? {
            info!(
                "table {table_id}: purged {} blocks, merge root {}",
                truncation.removed.len(),
                truncation.merge_root
            );
            summary.truncated.push((table_id, truncation));
        }
    }

    // Peer pointers referencing a removed block are rewritten to the merge
    // root, so the next idempotence check compares against a block that
    // still exists.
    let merge_roots: BTreeMap<TableId, Fingerprint> = summary
        .truncated
        .iter()
        .map(|(table_id, t)| (*table_id, t.merge_root))
        .collect();
    for host in ctx.store.peer_hosts()? {
        let mut pointers = ctx.store.peer(&host)?;
        let mut changed = false;
        for (table_id, fp) in pointers.iter_mut() {
            if !ctx.store.has_block(*fp) {
                if let Some(root) = merge_roots.get(table_id) {
                    warn!("host '{host}': peer pointer for table {table_id} referenced a purged block, rewriting to {root}");
                    *fp = *root;
                    changed = true;
                }
            }
        }
        if changed {
            ctx.store.set_peer(&host, &pointers)?;
        }
    }
    Ok(summary)
}

#[derive(Serialize)]
struct HistoryDoc {
    table_id: String,
    primary: Vec<String>,
    history: Vec<HistoryEntryDoc>,
}

#[derive(Serialize)]
struct HistoryEntryDoc {
    timestamp: u64,
    operation: String,
    subsidiary: BTreeMap<String, String>,
}

/// Render an octet string for the JSON report.
///
/// Values are opaque octets everywhere else in the system; JSON forces text,
/// so non-UTF-8 bytes are replaced with U+FFFD — with a warning, never
/// silently.
fn json_text(what: &str, value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) => text.to_owned(),
        Err(_) => {
            warn!("{what} contains non-utf-8 bytes; replacing them in the JSON output");
            String::from_utf8_lossy(value).into_owned()
        }
    }
}

/// Write the change history of one primary tuple, newest first, as JSON.
///
/// The optional `--from`/`--to` bounds are inclusive.
pub fn history(
    ctx: &Context,
    table_id: TableId,
    primary: &Primary,
    from: Option<u64>,
    to: Option<u64>,
    out: &Path,
) -> Result<()> {
    if !ctx.config.tables.contains_key(&table_id) {
        return Err(Error::Config(format!("table {table_id} is not configured")));
    }
    let entries = ctx.store.history(
        table_id,
        primary,
        from.map_or(Bound::Unbounded, Bound::Included),
        to.map_or(Bound::Unbounded, Bound::Included),
    )?;

    let doc = HistoryDoc {
        table_id: table_id.to_string(),
        primary: primary
            .fields()
            .iter()
            .map(|f| json_text("primary tuple", f))
            .collect(),
        history: entries
            .into_iter()
            .map(|entry| HistoryEntryDoc {
                timestamp: entry.timestamp,
                operation: entry.operation.to_string(),
                subsidiary: entry
                    .subsidiary
                    .into_iter()
                    .map(|(name, value)| {
                        let text = json_text(&format!("subsidiary field '{name}'"), &value);
                        (name, text)
                    })
                    .collect(),
            })
            .collect(),
    };

    let mut json = if ctx.config.pretty_print {
        serde_json::to_string_pretty(&doc)
    } else {
        serde_json::to_string(&doc)
    }
    .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    json.push('\n');

    write_file_atomic(ctx, out, json.as_bytes())?;
    info!("wrote history of '{primary}' in table {table_id} to {}", out.display());
    Ok(())
}

fn open_endpoint(
    registry: &Registry,
    endpoint: &EndpointConfig,
    schema: &Schema,
    table_id: TableId,
) -> Result<Box<dyn Adapter>> {
    let args = OpenArgs {
        params: &endpoint.params,
        db_schema: &endpoint.schema,
        table_name: &endpoint.table_name,
        schema,
    };
    registry
        .open(&endpoint.callbacks, &args)
        .map_err(|e| Error::adapter(table_id, e))
}

fn read_table(adapter: &mut dyn Adapter, table_id: TableId) -> Result<Table> {
    let mut table = Table::new();
    let rows = adapter.read_all().map_err(|e| Error::adapter(table_id, e))?;
    for row in rows {
        let row = row.map_err(|e| Error::adapter(table_id, e))?;
        if table.contains(&row.primary) {
            warn!(
                "table {table_id}: duplicate primary tuple '{}' in source, keeping the later row",
                row.primary
            );
        }
        table.insert(row);
    }
    Ok(table)
}

fn write_patch(ctx: &Context, patch: &Patch, out: &Path) -> Result<()> {
    write_file_atomic(ctx, out, &patch.encode())?;
    info!("wrote patch with {} table(s) to {}", patch.entries().len(), out.display());
    Ok(())
}

fn write_file_atomic(ctx: &Context, out: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match out.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ctx.store.write_atomic(dir, out, bytes)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::adapter::mem::{Hub, Rows};

    const CONFIG: &str = r#"{
        "version": "0.1.0",
        "tables": {
            "BTL": {
                "primary_fields": ["first_name", "last_name"],
                "subsidiary_fields": ["born"],
                "source": {
                    "params": "btl.src",
                    "schema": "leech",
                    "table_name": "beatles",
                    "callbacks": "mem"
                },
                "destination": {
                    "params": "btl.dst",
                    "schema": "leech",
                    "table_name": "beatles",
                    "callbacks": "mem"
                }
            }
        }
    }"#;

    fn primary(fields: &[&str]) -> Primary {
        Primary::new(fields.iter().map(|f| f.as_bytes().to_vec()).collect())
    }

    fn rows(data: &[(&[&str], &str)]) -> Rows {
        data.iter()
            .map(|(p, s)| (primary(p), vec![s.as_bytes().to_vec()]))
            .collect()
    }

    fn context(tmp: &tempfile::TempDir, config: &str, hub: &Hub) -> Context {
        fs::write(tmp.path().join("leech.json"), config).unwrap();
        let mut registry = Registry::new();
        hub.register(&mut registry, "mem");
        Context::open(Workdir::from_path_unchecked(tmp.path()), registry).unwrap()
    }

    fn beatles_v1() -> Rows {
        rows(&[
            (&["Paul", "McCartney"], "1942"),
            (&["Ringo", "Starr"], "1940"),
            (&["John", "Lennon"], "1940"),
            (&["George", "Harrison"], "1943"),
        ])
    }

    fn beatles_v2() -> Rows {
        rows(&[
            (&["Paul", "McCartney"], "1943"),
            (&["John", "Lennon"], "1940"),
            (&["George", "Harrison"], "1943"),
            (&["Janis", "Joplin"], "1943"),
        ])
    }

    #[test]
    fn commit_then_recommit_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        hub.seed("btl.src", beatles_v1());
        let ctx = context(&tmp, CONFIG, &hub);

        let first = commit(&ctx).unwrap();
        assert_eq!(first.committed.len(), 1);

        // Unchanged source: no new block, head unchanged.
        let second = commit(&ctx).unwrap();
        assert!(second.committed.is_empty());

        let table_id = TableId::new("BTL").unwrap();
        let head = ctx.store.head(table_id).unwrap().unwrap();
        assert_eq!(head, first.committed[0].1);
        assert_eq!(ctx.store.walk(table_id, Fingerprint::ZERO, head).unwrap().len(), 1);
    }

    #[test]
    fn diff_and_patch_from_null_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        hub.seed("btl.src", beatles_v1());
        hub.seed("btl.dst", Rows::new());
        let ctx = context(&tmp, CONFIG, &hub);

        commit(&ctx).unwrap();
        hub.seed("btl.src", beatles_v2());
        commit(&ctx).unwrap();

        let patch_path = tmp.path().join("patchfile");
        diff(&ctx, Fingerprint::ZERO, &patch_path).unwrap();

        let summary = patch(&ctx, "host_id", "SHA=123", &patch_path).unwrap();
        assert!(!summary.noop);

        let dst = hub.rows("btl.dst");
        assert_eq!(dst.len(), 4);
        assert_eq!(
            dst.get(&primary(&["SHA=123", "Paul", "McCartney"])),
            Some(&vec![b"1943".to_vec()])
        );
        assert!(!dst.contains_key(&primary(&["SHA=123", "Ringo", "Starr"])));

        // The peer pointer records the head; re-applying is a no-op.
        let again = patch(&ctx, "host_id", "SHA=123", &patch_path).unwrap();
        assert!(again.noop);
        assert_eq!(hub.rows("btl.dst"), dst);
    }

    #[test]
    fn diff_from_recorded_ancestor_is_a_delta() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        hub.seed("btl.src", beatles_v1());
        hub.seed("btl.dst", Rows::new());
        let ctx = context(&tmp, CONFIG, &hub);

        let first = commit(&ctx).unwrap();
        let b1 = first.committed[0].1;

        let patch_path = tmp.path().join("patch1");
        diff(&ctx, Fingerprint::ZERO, &patch_path).unwrap();
        patch(&ctx, "host_id", "SHA=123", &patch_path).unwrap();

        hub.seed("btl.src", beatles_v2());
        commit(&ctx).unwrap();

        let patch_path = tmp.path().join("patch2");
        diff(&ctx, b1, &patch_path).unwrap();
        let decoded = Patch::decode(&fs::read(&patch_path).unwrap()).unwrap();
        assert_eq!(decoded.entries().len(), 1);
        assert_eq!(decoded.entries()[0].from, b1);
        assert_eq!(decoded.entries()[0].diff.len(), 3);

        patch(&ctx, "host_id", "SHA=123", &patch_path).unwrap();
        let dst = hub.rows("btl.dst");
        assert_eq!(dst.len(), 4);
        assert!(dst.contains_key(&primary(&["SHA=123", "Janis", "Joplin"])));
        assert!(!dst.contains_key(&primary(&["SHA=123", "Ringo", "Starr"])));
    }

    #[test]
    fn rebase_replaces_only_the_hosts_slice() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        hub.seed(
            "btl.src",
            rows(&[(&["Eric", "Clapton"], "1945"), (&["John", "Lennon"], "1940")]),
        );
        // Destination pre-seeded with two hosts' slices.
        let mut dst = Rows::new();
        for (p, s) in rows(&[(&["Paul", "McCartney"], "1942"), (&["Ringo", "Starr"], "1940")]) {
            dst.insert(p.prepend(b"SHA=123".to_vec()), s);
        }
        for (p, s) in rows(&[(&["Janis", "Joplin"], "1943")]) {
            dst.insert(p.prepend(b"SHA=456".to_vec()), s);
        }
        hub.seed("btl.dst", dst);
        let ctx = context(&tmp, CONFIG, &hub);

        commit(&ctx).unwrap();
        let patch_path = tmp.path().join("rebase.patch");
        rebase(&ctx, &patch_path).unwrap();
        patch(&ctx, "host_id", "SHA=123", &patch_path).unwrap();

        let dst = hub.rows("btl.dst");
        assert_eq!(dst.len(), 3);
        assert!(dst.contains_key(&primary(&["SHA=123", "Eric", "Clapton"])));
        assert!(dst.contains_key(&primary(&["SHA=123", "John", "Lennon"])));
        // The other host's slice is untouched.
        assert!(dst.contains_key(&primary(&["SHA=456", "Janis", "Joplin"])));
        assert!(!dst.contains_key(&primary(&["SHA=123", "Paul", "McCartney"])));
    }

    #[test]
    fn purge_truncates_to_chain_length() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        let config = CONFIG.replacen('{', "{\"chain_length\": 3,", 1);
        let ctx = context(&tmp, &config, &hub);

        for born in 1942..1947 {
            hub.seed("btl.src", rows(&[(&["Paul", "McCartney"], &born.to_string())]));
            commit(&ctx).unwrap();
        }

        let table_id = TableId::new("BTL").unwrap();
        let head = ctx.store.head(table_id).unwrap().unwrap();
        assert_eq!(ctx.store.walk(table_id, Fingerprint::ZERO, head).unwrap().len(), 5);

        let summary = purge(&ctx).unwrap();
        assert_eq!(summary.truncated.len(), 1);

        let head = ctx.store.head(table_id).unwrap().unwrap();
        let chain = ctx.store.walk(table_id, Fingerprint::ZERO, head).unwrap();
        assert_eq!(chain.len(), 3);
        assert!(chain[0].is_genesis());
        assert_eq!(fs::read_dir(tmp.path().join("blocks")).unwrap().count(), 3);

        // Newest state is intact.
        let state = ctx.store.materialize(table_id, head).unwrap();
        let expected = vec![b"1946".to_vec()];
        assert_eq!(state.get(&primary(&["Paul", "McCartney"])), Some(expected.as_slice()));
    }

    #[test]
    fn auto_purge_runs_after_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        let config = CONFIG.replacen('{', "{\"auto_purge\": true, \"chain_length\": 3,", 1);
        let ctx = context(&tmp, &config, &hub);

        for born in 1942..1947 {
            hub.seed("btl.src", rows(&[(&["Paul", "McCartney"], &born.to_string())]));
            commit(&ctx).unwrap();
        }
        assert_eq!(fs::read_dir(tmp.path().join("blocks")).unwrap().count(), 3);
    }

    #[test]
    fn purge_rewrites_dangling_peer_pointers() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        hub.seed("btl.dst", Rows::new());
        let config = CONFIG.replacen('{', "{\"chain_length\": 2,", 1);
        let ctx = context(&tmp, &config, &hub);

        hub.seed("btl.src", rows(&[(&["Paul", "McCartney"], "1942")]));
        commit(&ctx).unwrap();

        // Hub records the first head as the peer pointer.
        let patch_path = tmp.path().join("patchfile");
        diff(&ctx, Fingerprint::ZERO, &patch_path).unwrap();
        patch(&ctx, "host_id", "SHA=123", &patch_path).unwrap();

        for born in 1943..1946 {
            hub.seed("btl.src", rows(&[(&["Paul", "McCartney"], &born.to_string())]));
            commit(&ctx).unwrap();
        }
        let summary = purge(&ctx).unwrap();
        let merge_root = summary.truncated[0].1.merge_root;

        let table_id = TableId::new("BTL").unwrap();
        let pointers = ctx.store.peer("SHA=123").unwrap();
        assert_eq!(pointers.get(&table_id), Some(&merge_root));
    }

    #[test]
    fn merge_blocks_disabled_exempts_table_from_purge() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        let config = CONFIG
            .replacen('{', "{\"chain_length\": 2,", 1)
            .replace("\"primary_fields\"", "\"merge_blocks\": false, \"primary_fields\"");
        let ctx = context(&tmp, &config, &hub);

        for born in 1942..1946 {
            hub.seed("btl.src", rows(&[(&["Paul", "McCartney"], &born.to_string())]));
            commit(&ctx).unwrap();
        }
        purge(&ctx).unwrap();
        assert_eq!(fs::read_dir(tmp.path().join("blocks")).unwrap().count(), 4);
    }

    #[test]
    fn history_output_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        let config = CONFIG.replacen('{', "{\"pretty_print\": true,", 1);
        let ctx = context(&tmp, &config, &hub);

        for born in 1942..1947 {
            hub.seed("btl.src", rows(&[(&["Paul", "McCartney"], &born.to_string())]));
            commit(&ctx).unwrap();
        }

        let out = tmp.path().join("history.json");
        let table_id = TableId::new("BTL").unwrap();
        history(&ctx, table_id, &primary(&["Paul", "McCartney"]), None, None, &out).unwrap();

        let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(doc["table_id"], "BTL");
        assert_eq!(doc["primary"], serde_json::json!(["Paul", "McCartney"]));
        let entries = doc["history"].as_array().unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0]["operation"], "U");
        assert_eq!(entries[0]["subsidiary"]["born"], "1946");
        assert_eq!(entries[4]["operation"], "I");
        assert_eq!(entries[4]["subsidiary"]["born"], "1942");
    }

    #[test]
    fn history_replaces_non_utf8_bytes_in_output() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        let mut src = Rows::new();
        src.insert(primary(&["Paul", "McCartney"]), vec![vec![0x31, 0xff, 0x39]]);
        hub.seed("btl.src", src);
        let ctx = context(&tmp, CONFIG, &hub);

        commit(&ctx).unwrap();

        let out = tmp.path().join("history.json");
        let table_id = TableId::new("BTL").unwrap();
        history(&ctx, table_id, &primary(&["Paul", "McCartney"]), None, None, &out).unwrap();

        let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(doc["history"][0]["subsidiary"]["born"], "1\u{fffd}9");
    }

    #[test]
    fn history_rejects_unconfigured_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        let ctx = context(&tmp, CONFIG, &hub);
        let out = tmp.path().join("history.json");
        assert!(matches!(
            history(&ctx, TableId::new("PFL").unwrap(), &primary(&["x"]), None, None, &out),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn commit_skips_oversized_records() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        let big = "x".repeat(crate::diff::MAX_RECORD_BYTES);
        hub.seed(
            "btl.src",
            rows(&[(&["Paul", "McCartney"], "1942"), (&["Big", "Row"], &big)]),
        );
        let ctx = context(&tmp, CONFIG, &hub);

        let summary = commit(&ctx).unwrap();
        assert_eq!(summary.skipped_records, 1);

        let table_id = TableId::new("BTL").unwrap();
        let head = ctx.store.head(table_id).unwrap().unwrap();
        let state = ctx.store.materialize(table_id, head).unwrap();
        assert_eq!(state.len(), 1);
        assert!(!state.contains(&primary(&["Big", "Row"])));
    }

    #[test]
    fn lock_contention_fails_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Hub::new();
        hub.seed("btl.src", beatles_v1());
        let ctx = context(&tmp, CONFIG, &hub);

        let _lock = ctx.store.lock().unwrap();
        assert!(matches!(commit(&ctx), Err(Error::LockBusy)));
    }
}
