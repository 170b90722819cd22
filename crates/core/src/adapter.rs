//! The capability interface the engine requires of source and destination
//! endpoints, and the registry mapping configured adapter ids to
//! implementations.

use std::collections::BTreeMap;

use crate::error::AdapterError;
use crate::table::{Primary, Row, Schema, Value};

pub type AdapterResult<T> = Result<T, AdapterError>;

/// One endpoint (a file, a database connection, …) for one logical table.
///
/// Source endpoints only need [`read_all`](Adapter::read_all); the
/// transaction and mutation methods exist for destinations and default to
/// no-ops where that is safe. Implementations release their endpoint on
/// drop; [`close`](Adapter::close) exists so release errors can surface.
pub trait Adapter {
    /// Yield every row of the endpoint's view of the table.
    ///
    /// The sequence is lazy and finite; calling `read_all` again restarts
    /// from the beginning.
    fn read_all(&mut self) -> AdapterResult<Box<dyn Iterator<Item = AdapterResult<Row>> + '_>>;

    fn begin_transaction(&mut self) -> AdapterResult<()> {
        Ok(())
    }

    fn commit_transaction(&mut self) -> AdapterResult<()> {
        Ok(())
    }

    fn rollback_transaction(&mut self) -> AdapterResult<()> {
        Ok(())
    }

    fn insert(&mut self, row: &Row) -> AdapterResult<()>;

    fn delete(&mut self, primary: &Primary) -> AdapterResult<()>;

    fn update(&mut self, primary: &Primary, subsidiary: &[Value]) -> AdapterResult<()>;

    fn close(&mut self) -> AdapterResult<()> {
        Ok(())
    }
}

/// Everything an adapter gets to open its endpoint.
#[derive(Clone, Copy, Debug)]
pub struct OpenArgs<'a> {
    /// Endpoint parameters, e.g. a file path or connection string.
    pub params: &'a str,
    /// The endpoint-side namespace (database schema name).
    pub db_schema: &'a str,
    /// The endpoint-side table name.
    pub table_name: &'a str,
    /// The field layout the engine will speak.
    pub schema: &'a Schema,
}

type OpenFn = Box<dyn Fn(&OpenArgs<'_>) -> AdapterResult<Box<dyn Adapter>>>;

/// Adapter implementations, keyed by the id used in the configuration's
/// `callbacks` entries. Registration happens at startup; there is no dynamic
/// loading.
#[derive(Default)]
pub struct Registry {
    adapters: BTreeMap<String, OpenFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: impl Into<String>,
        open: impl Fn(&OpenArgs<'_>) -> AdapterResult<Box<dyn Adapter>> + 'static,
    ) {
        self.adapters.insert(id.into(), Box::new(open));
    }

    /// Open the endpoint described by `args` with the adapter registered
    /// under `id`.
    pub fn open(&self, id: &str, args: &OpenArgs<'_>) -> AdapterResult<Box<dyn Adapter>> {
        let open = self
            .adapters
            .get(id)
            .ok_or_else(|| AdapterError::Unavailable(format!("no adapter registered under id '{id}'")))?;
        open(args)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A destination endpoint qualified by a host field.
///
/// Mutations prepend the qualifier value to the primary tuple; reads present
/// only the host's slice of the endpoint, with the qualifier stripped. This
/// is how one physical destination table holds rows from many hosts.
pub struct Qualified {
    inner: Box<dyn Adapter>,
    value: Value,
}

impl Qualified {
    pub fn new(inner: Box<dyn Adapter>, value: Value) -> Self {
        Self { inner, value }
    }
}

impl Adapter for Qualified {
    fn read_all(&mut self) -> AdapterResult<Box<dyn Iterator<Item = AdapterResult<Row>> + '_>> {
        let value = self.value.clone();
        let rows = self.inner.read_all()?.filter_map(move |row| match row {
            Ok(row) => {
                let mut fields = row.primary.into_fields();
                if fields.first() == Some(&value) {
                    fields.remove(0);
                    Some(Ok(Row::new(Primary::new(fields), row.subsidiary)))
                } else {
                    None
                }
            }
            Err(e) => Some(Err(e)),
        });
        Ok(Box::new(rows))
    }

    fn begin_transaction(&mut self) -> AdapterResult<()> {
        self.inner.begin_transaction()
    }

    fn commit_transaction(&mut self) -> AdapterResult<()> {
        self.inner.commit_transaction()
    }

    fn rollback_transaction(&mut self) -> AdapterResult<()> {
        self.inner.rollback_transaction()
    }

    fn insert(&mut self, row: &Row) -> AdapterResult<()> {
        self.inner.insert(&Row::new(
            row.primary.prepend(self.value.clone()),
            row.subsidiary.clone(),
        ))
    }

    fn delete(&mut self, primary: &Primary) -> AdapterResult<()> {
        self.inner.delete(&primary.prepend(self.value.clone()))
    }

    fn update(&mut self, primary: &Primary, subsidiary: &[Value]) -> AdapterResult<()> {
        self.inner.update(&primary.prepend(self.value.clone()), subsidiary)
    }

    fn close(&mut self) -> AdapterResult<()> {
        self.inner.close()
    }
}

#[cfg(test)]
pub(crate) mod mem {
    //! An in-memory endpoint, so engine tests need no filesystem or CSV
    //! plumbing.

    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use super::*;

    pub type Rows = BTreeMap<Primary, Vec<Value>>;

    /// Shared backing storage, keyed by the `params` string.
    #[derive(Clone, Default)]
    pub struct Hub(Rc<RefCell<HashMap<String, Rows>>>);

    impl Hub {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, params: &str, rows: Rows) {
            self.0.borrow_mut().insert(params.to_owned(), rows);
        }

        pub fn rows(&self, params: &str) -> Rows {
            self.0.borrow().get(params).cloned().unwrap_or_default()
        }

        /// Register this hub in `registry` under `id`.
        pub fn register(&self, registry: &mut Registry, id: &str) {
            let hub = self.clone();
            registry.register(id, move |args: &OpenArgs<'_>| {
                Ok(Box::new(Memory {
                    hub: hub.clone(),
                    key: args.params.to_owned(),
                    rows: hub.rows(args.params),
                    in_tx: false,
                }) as Box<dyn Adapter>)
            });
        }
    }

    pub struct Memory {
        hub: Hub,
        key: String,
        rows: Rows,
        in_tx: bool,
    }

    impl Adapter for Memory {
        fn read_all(&mut self) -> AdapterResult<Box<dyn Iterator<Item = AdapterResult<Row>> + '_>> {
            let rows = self
                .rows
                .iter()
                .map(|(p, s)| Ok(Row::new(p.clone(), s.clone())))
                .collect::<Vec<_>>();
            Ok(Box::new(rows.into_iter()))
        }

        fn begin_transaction(&mut self) -> AdapterResult<()> {
            self.in_tx = true;
            Ok(())
        }

        fn commit_transaction(&mut self) -> AdapterResult<()> {
            self.in_tx = false;
            self.hub.0.borrow_mut().insert(self.key.clone(), self.rows.clone());
            Ok(())
        }

        fn rollback_transaction(&mut self) -> AdapterResult<()> {
            self.in_tx = false;
            self.rows = self.hub.rows(&self.key);
            Ok(())
        }

        fn insert(&mut self, row: &Row) -> AdapterResult<()> {
            if self.rows.insert(row.primary.clone(), row.subsidiary.clone()).is_some() {
                return Err(AdapterError::Op(format!("insert of existing row '{}'", row.primary)));
            }
            Ok(())
        }

        fn delete(&mut self, primary: &Primary) -> AdapterResult<()> {
            self.rows
                .remove(primary)
                .map(|_| ())
                .ok_or_else(|| AdapterError::Op(format!("delete of missing row '{primary}'")))
        }

        fn update(&mut self, primary: &Primary, subsidiary: &[Value]) -> AdapterResult<()> {
            match self.rows.get_mut(primary) {
                Some(subs) => {
                    *subs = subsidiary.to_vec();
                    Ok(())
                }
                None => Err(AdapterError::Op(format!("update of missing row '{primary}'"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::mem::{Hub, Rows};
    use super::*;
    use crate::table::testutil::{row, schema};

    fn primary(fields: &[&str]) -> Primary {
        Primary::new(fields.iter().map(|f| f.as_bytes().to_vec()).collect())
    }

    #[test]
    fn registry_rejects_unknown_ids() {
        let registry = Registry::new();
        let schema = schema(&["k"], &["v"]);
        let args = OpenArgs {
            params: "x",
            db_schema: "leech",
            table_name: "t",
            schema: &schema,
        };
        assert!(matches!(
            registry.open("nope", &args),
            Err(AdapterError::Unavailable(_))
        ));
    }

    #[test]
    fn qualified_reads_only_the_hosts_slice() {
        let hub = Hub::new();
        let mut rows = Rows::new();
        rows.insert(primary(&["SHA=123", "Paul"]), vec![b"1942".to_vec()]);
        rows.insert(primary(&["SHA=456", "John"]), vec![b"1940".to_vec()]);
        hub.seed("dst", rows);

        let mut registry = Registry::new();
        hub.register(&mut registry, "mem");
        let schema = schema(&["host_id", "name"], &["born"]);
        let args = OpenArgs {
            params: "dst",
            db_schema: "leech",
            table_name: "t",
            schema: &schema,
        };
        let inner = registry.open("mem", &args).unwrap();
        let mut qualified = Qualified::new(inner, b"SHA=123".to_vec());

        let rows: Vec<Row> = qualified.read_all().unwrap().collect::<AdapterResult<_>>().unwrap();
        assert_eq!(rows, vec![row(1, &["Paul", "1942"])]);
    }

    #[test]
    fn qualified_mutations_prepend_the_qualifier() {
        let hub = Hub::new();
        hub.seed("dst", Rows::new());

        let mut registry = Registry::new();
        hub.register(&mut registry, "mem");
        let schema = schema(&["host_id", "name"], &["born"]);
        let args = OpenArgs {
            params: "dst",
            db_schema: "leech",
            table_name: "t",
            schema: &schema,
        };
        let inner = registry.open("mem", &args).unwrap();
        let mut qualified = Qualified::new(inner, b"SHA=123".to_vec());

        qualified.begin_transaction().unwrap();
        qualified.insert(&row(1, &["Paul", "1942"])).unwrap();
        qualified
            .update(&primary(&["Paul"]), &[b"1943".to_vec()])
            .unwrap();
        qualified.commit_transaction().unwrap();

        let stored = hub.rows("dst");
        assert_eq!(
            stored.get(&primary(&["SHA=123", "Paul"])).map(Vec::as_slice),
            Some([b"1943".to_vec()].as_slice())
        );
    }

    #[test]
    fn memory_rolls_back_to_last_commit() {
        let hub = Hub::new();
        let mut rows = Rows::new();
        rows.insert(primary(&["a"]), vec![b"1".to_vec()]);
        hub.seed("t", rows.clone());

        let mut registry = Registry::new();
        hub.register(&mut registry, "mem");
        let schema = schema(&["k"], &["v"]);
        let args = OpenArgs {
            params: "t",
            db_schema: "leech",
            table_name: "t",
            schema: &schema,
        };
        let mut adapter = registry.open("mem", &args).unwrap();

        adapter.begin_transaction().unwrap();
        adapter.delete(&primary(&["a"])).unwrap();
        adapter.rollback_transaction().unwrap();

        let all: Vec<Row> = adapter.read_all().unwrap().collect::<AdapterResult<_>>().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(hub.rows("t"), rows);
    }
}
