//! The `leech.json` configuration at the workdir root.

use std::collections::BTreeMap;
use std::fs;
use std::io;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::table::{Schema, TableId};

/// One endpoint of a table: where the rows live and which adapter speaks to
/// them.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Adapter-specific parameters, e.g. a file path or connection string.
    pub params: String,
    /// Endpoint-side namespace (database schema name).
    pub schema: String,
    /// Endpoint-side table name.
    pub table_name: String,
    /// Id of the adapter implementation to use.
    pub callbacks: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TableConfig {
    pub primary_fields: Vec<String>,
    #[serde(default)]
    pub subsidiary_fields: Vec<String>,
    /// Whether purge may collapse this table's oldest blocks into a merge
    /// block. When disabled, the table is exempt from purge truncation.
    #[serde(default = "default_true")]
    pub merge_blocks: bool,
    pub source: EndpointConfig,
    pub destination: EndpointConfig,
}

fn default_true() -> bool {
    true
}

impl TableConfig {
    /// The table's field layout.
    pub fn table_schema(&self) -> Result<Schema> {
        Schema::new(self.primary_fields.clone(), self.subsidiary_fields.clone())
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    version: String,
    #[serde(default)]
    pretty_print: bool,
    #[serde(default)]
    auto_purge: bool,
    #[serde(default)]
    chain_length: Option<u64>,
    tables: BTreeMap<String, TableConfig>,
}

/// Validated configuration.
#[derive(Debug)]
pub struct Config {
    pub version: String,
    /// Pretty-print JSON outputs (the `history` file).
    pub pretty_print: bool,
    /// Run `purge` at the end of every `commit`.
    pub auto_purge: bool,
    /// Keep at most this many blocks per table; absent means unbounded
    /// chains.
    pub chain_length: Option<usize>,
    /// Configured tables, in table-id order.
    pub tables: BTreeMap<TableId, TableConfig>,
}

impl Config {
    /// Load and validate the configuration file of `workdir`.
    pub fn load(workdir: &leech_paths::Workdir) -> Result<Self> {
        let path = workdir.config_file();
        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::Config(format!("missing configuration file {}", path.display())),
            _ => Error::Io(e),
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;

        if raw.chain_length == Some(0) {
            return Err(Error::Config("chain_length must be at least 1".into()));
        }

        let mut tables = BTreeMap::new();
        for (key, table) in raw.tables {
            let table_id: TableId = key
                .parse()
                .map_err(|_| Error::Config(format!("invalid table id '{key}'")))?;
            // Surface schema problems at load time, not at first use.
            table.table_schema().map_err(|e| match e {
                Error::Config(msg) => Error::Config(format!("table {table_id}: {msg}")),
                other => other,
            })?;
            tables.insert(table_id, table);
        }

        Ok(Self {
            version: raw.version,
            pretty_print: raw.pretty_print,
            auto_purge: raw.auto_purge,
            chain_length: raw.chain_length.map(|n| n as usize),
            tables,
        })
    }
}
