//! The leech synchronization engine.
//!
//! Leech tracks the evolution of tabular state on a host and propagates it
//! to a central hub via small, verifiable patches. Each commit snapshots a
//! fixed set of logical tables into a content-addressed block store; every
//! block carries a typed row-level diff against its parent. Patches are
//! reconstructed between any two reachable blocks and applied transactionally
//! against destination endpoints, qualified by a host identifier so one hub
//! database consolidates many hosts.
//!
//! The crate is organized leaves-first:
//!
//! - [`Fingerprint`]: 160-bit content digests over canonical byte sequences
//! - [`Table`] and friends: the in-memory row model
//! - [`TableDiff`]: the row-level diff algebra
//! - [`Block`] and [`patchfile`]: the canonical binary encodings
//! - [`BlockStore`]: blocks, heads and peer pointers on disk
//! - [`adapter`]: the endpoint capability interface and registry
//! - [`ops`]: the `commit`/`diff`/`patch`/`rebase`/`purge`/`history`
//!   orchestration

mod block;
mod chain;
mod codec;
mod diff;
mod fingerprint;
mod lockfile;
mod store;
mod table;

pub mod adapter;
pub mod config;
pub mod error;
pub mod ops;
pub mod patchfile;

pub use block::{Block, BLOCK_FORMAT_VERSION};
pub use chain::{HistoryEntry, Truncation};
pub use codec::DecodeError;
pub use diff::{ApplyError, ComposeConflict, Op, OpKind, Oversized, TableDiff, MAX_RECORD_BYTES};
pub use error::{AdapterError, Error, Result};
pub use fingerprint::{Fingerprint, Hasher, ParseFingerprintError, FINGERPRINT_LEN};
pub use lockfile::Lockfile;
pub use store::BlockStore;
pub use table::{ParseTableIdError, Primary, Row, Schema, SchemaError, Table, TableId, Value};
