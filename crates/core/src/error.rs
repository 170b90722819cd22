use std::io;

use thiserror::Error;

use crate::codec::DecodeError;
use crate::fingerprint::Fingerprint;
use crate::table::TableId;

/// Error yielded by an adapter endpoint.
///
/// Adapters are external collaborators; the engine only distinguishes the
/// kinds it has to react to.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The endpoint could not be reached or opened.
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
    /// The endpoint's columns cannot be mapped to the requested schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    /// The endpoint imposed its own timeout.
    #[error("endpoint operation timed out")]
    Timeout,
    /// A read or mutation failed mid-flight.
    #[error("{0}")]
    Op(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error of the engine.
///
/// Variants correspond to the error kinds surfaced to operators; the command
/// dispatcher is the only place that maps them to exit codes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("adapter for table {table_id}: {source}")]
    Adapter {
        table_id: TableId,
        #[source]
        source: AdapterError,
    },
    #[error("corrupt block {fp}: {source}")]
    CorruptBlock {
        fp: Fingerprint,
        #[source]
        source: DecodeError,
    },
    #[error("corrupt patch file: {source}")]
    CorruptPatch {
        #[source]
        source: DecodeError,
    },
    #[error("corrupt store: {0}")]
    CorruptStore(String),
    #[error("unknown block {0}")]
    UnknownBlock(Fingerprint),
    #[error("block {from} is not an ancestor of {to}")]
    UnreachableAncestor { from: Fingerprint, to: Fingerprint },
    #[error("workdir is locked by another process")]
    LockBusy,
    #[error("patch failed: {0}")]
    PatchFailed(String),
    /// Some destination transactions committed before one failed. The
    /// destination endpoints are left for operator inspection.
    #[error("partial commit: tables {committed:?} committed before {failed} failed: {source}")]
    PartialCommit {
        committed: Vec<TableId>,
        failed: TableId,
        #[source]
        source: AdapterError,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn adapter(table_id: TableId, source: AdapterError) -> Self {
        Self::Adapter { table_id, source }
    }
}
