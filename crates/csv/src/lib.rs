//! CSV endpoint for the leech adapter interface.
//!
//! One CSV file per table; the header row echoes the schema's field names,
//! primary fields first. Values are treated as opaque octet strings end to
//! end ([`csv::ByteRecord`]), so binary content survives the round-trip.
//!
//! A missing file reads as an empty table and is created on the first
//! committed transaction; this lets a destination start from nothing.
//! Destination writes are transactional: mutations buffer in memory and are
//! flushed to the file with a temp-file-plus-rename on
//! `commit_transaction`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use tempfile::NamedTempFile;

use leech_core::adapter::{Adapter, AdapterResult, OpenArgs, Registry};
use leech_core::{AdapterError, Primary, Row, Schema, Value};

/// The id this adapter registers under (the configuration's `callbacks`).
pub const ADAPTER_ID: &str = "csv";

/// Register the CSV adapter in `registry` under [`ADAPTER_ID`].
pub fn register(registry: &mut Registry) {
    registry.register(ADAPTER_ID, |args: &OpenArgs<'_>| {
        CsvAdapter::open(args).map(|adapter| Box::new(adapter) as Box<dyn Adapter>)
    });
}

struct CsvAdapter {
    path: PathBuf,
    schema: Schema,
    rows: BTreeMap<Primary, Vec<Value>>,
    in_tx: bool,
}

impl CsvAdapter {
    fn open(args: &OpenArgs<'_>) -> AdapterResult<Self> {
        let path = PathBuf::from(args.params);
        let rows = match File::open(&path) {
            Ok(file) => load_rows(file, args.schema, &path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("csv endpoint {} does not exist yet, reading as empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(AdapterError::Unavailable(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            schema: args.schema.clone(),
            rows,
            in_tx: false,
        })
    }

    fn require_tx(&self) -> AdapterResult<()> {
        if self.in_tx {
            Ok(())
        } else {
            Err(AdapterError::Op("mutation outside a transaction".into()))
        }
    }

    fn flush(&self) -> AdapterResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file());
            let mut header = csv::ByteRecord::new();
            for name in self.schema.fields() {
                header.push_field(name.as_bytes());
            }
            writer
                .write_byte_record(&header)
                .map_err(|e| AdapterError::Op(e.to_string()))?;
            for (primary, subsidiary) in &self.rows {
                let mut record = csv::ByteRecord::new();
                for field in primary.fields().iter().chain(subsidiary.iter()) {
                    record.push_field(field);
                }
                writer
                    .write_byte_record(&record)
                    .map_err(|e| AdapterError::Op(e.to_string()))?;
            }
            writer.flush().map_err(AdapterError::Io)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| AdapterError::Io(e.error))?;
        debug!("flushed {} rows to {}", self.rows.len(), self.path.display());
        Ok(())
    }
}

fn load_rows(file: File, schema: &Schema, path: &Path) -> AdapterResult<BTreeMap<Primary, Vec<Value>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .from_reader(file);

    let mut records = reader.byte_records();
    let header = match records.next() {
        Some(header) => header.map_err(|e| AdapterError::Unavailable(format!("{}: {e}", path.display())))?,
        // An empty file has no header and no rows.
        None => return Ok(BTreeMap::new()),
    };
    let expected = schema.fields().map(str::as_bytes);
    if !header.iter().eq(expected) {
        return Err(AdapterError::SchemaMismatch(format!(
            "{}: header row does not match the configured fields",
            path.display()
        )));
    }

    let mut rows = BTreeMap::new();
    for record in records {
        let record = record.map_err(|e| AdapterError::Op(format!("{}: {e}", path.display())))?;
        let fields: Vec<Value> = record.iter().map(<[u8]>::to_vec).collect();
        let row = schema.row_from_fields(fields).ok_or_else(|| {
            AdapterError::SchemaMismatch(format!("{}: record width does not match the schema", path.display()))
        })?;
        rows.insert(row.primary, row.subsidiary);
    }
    Ok(rows)
}

impl Adapter for CsvAdapter {
    fn read_all(&mut self) -> AdapterResult<Box<dyn Iterator<Item = AdapterResult<Row>> + '_>> {
        let rows = self.rows.iter().map(|(p, s)| Ok(Row::new(p.clone(), s.clone())));
        Ok(Box::new(rows))
    }

    fn begin_transaction(&mut self) -> AdapterResult<()> {
        self.in_tx = true;
        Ok(())
    }

    fn commit_transaction(&mut self) -> AdapterResult<()> {
        self.require_tx()?;
        self.flush()?;
        self.in_tx = false;
        Ok(())
    }

    fn rollback_transaction(&mut self) -> AdapterResult<()> {
        self.in_tx = false;
        self.rows = match File::open(&self.path) {
            Ok(file) => load_rows(file, &self.schema, &self.path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(AdapterError::Io(e)),
        };
        Ok(())
    }

    fn insert(&mut self, row: &Row) -> AdapterResult<()> {
        self.require_tx()?;
        if self.rows.insert(row.primary.clone(), row.subsidiary.clone()).is_some() {
            return Err(AdapterError::Op(format!("insert of existing row '{}'", row.primary)));
        }
        Ok(())
    }

    fn delete(&mut self, primary: &Primary) -> AdapterResult<()> {
        self.require_tx()?;
        self.rows
            .remove(primary)
            .map(|_| ())
            .ok_or_else(|| AdapterError::Op(format!("delete of missing row '{primary}'")))
    }

    fn update(&mut self, primary: &Primary, subsidiary: &[Value]) -> AdapterResult<()> {
        self.require_tx()?;
        match self.rows.get_mut(primary) {
            Some(subs) => {
                *subs = subsidiary.to_vec();
                Ok(())
            }
            None => Err(AdapterError::Op(format!("update of missing row '{primary}'"))),
        }
    }

    fn close(&mut self) -> AdapterResult<()> {
        if self.in_tx {
            self.rollback_transaction()?;
        }
        Ok(())
    }
}
