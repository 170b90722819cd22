use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::fingerprint::{Fingerprint, Hasher};

/// A field value. Values are opaque octet strings; leech assigns them no type.
pub type Value = Vec<u8>;

/// Terminator byte opening the canonical serialization of a table.
///
/// Ensures the fingerprint of an empty table differs from the null
/// fingerprint.
const TABLE_TERMINATOR: u8 = 0x00;

/// A fixed-width printable tag identifying one logical table.
///
/// Exactly three ASCII uppercase letters, e.g. `BTL`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId([u8; 3]);

/// Error parsing a [`TableId`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("table id must be exactly three ASCII uppercase letters")]
pub struct ParseTableIdError;

impl TableId {
    pub fn new(s: &str) -> Result<Self, ParseTableIdError> {
        let bytes = s.as_bytes();
        match bytes {
            [a, b, c] if bytes.iter().all(u8::is_ascii_uppercase) => Ok(Self([*a, *b, *c])),
            _ => Err(ParseTableIdError),
        }
    }

    pub(crate) fn from_raw(bytes: [u8; 3]) -> Result<Self, ParseTableIdError> {
        if bytes.iter().all(u8::is_ascii_uppercase) {
            Ok(Self(bytes))
        } else {
            Err(ParseTableIdError)
        }
    }

    pub fn as_str(&self) -> &str {
        // Constructors guarantee ASCII uppercase.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }

    pub(crate) const fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.as_str())
    }
}

impl FromStr for TableId {
    type Err = ParseTableIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// The ordered projection of a row over the primary fields.
///
/// The derived `Ord` is lexicographic over the field octet strings; it is the
/// canonical row order used for hashing, serialization and diffing. Two rows
/// collide iff their primary tuples compare equal octet-for-octet.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Primary(Vec<Value>);

impl Primary {
    pub fn new(fields: Vec<Value>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prepend a field, e.g. a host qualifier value.
    pub fn prepend(&self, field: Value) -> Self {
        let mut fields = Vec::with_capacity(self.0.len() + 1);
        fields.push(field);
        fields.extend(self.0.iter().cloned());
        Self(fields)
    }

    pub fn into_fields(self) -> Vec<Value> {
        self.0
    }
}

impl fmt::Display for Primary {
    /// Lossy, comma-joined rendering for log and error messages.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", String::from_utf8_lossy(field))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Primary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Primary({self})")
    }
}

/// A full row: the primary tuple plus the subsidiary values, in schema order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub primary: Primary,
    pub subsidiary: Vec<Value>,
}

impl Row {
    pub fn new(primary: Primary, subsidiary: Vec<Value>) -> Self {
        Self { primary, subsidiary }
    }

    /// The canonical serialization of this row: canonical primary fields
    /// followed by canonical subsidiary fields.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_record(&self.primary, &self.subsidiary)
    }
}

/// Canonical serialization of a record given as primary tuple + subsidiaries.
///
/// Each field value is its raw octets prefixed by a 32-bit big-endian
/// length, primary fields first, all in schema order. This is the same
/// value encoding the block codec uses.
pub(crate) fn canonical_record(primary: &Primary, subsidiary: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    for field in primary.fields() {
        crate::codec::put_value(&mut buf, field);
    }
    for field in subsidiary {
        crate::codec::put_value(&mut buf, field);
    }
    buf
}

/// Error constructing a [`Schema`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("at least one primary field is required")]
    NoPrimaryFields,
    #[error("duplicate field name '{0}'")]
    DuplicateField(String),
}

/// The ordered primary and subsidiary field names of one table.
///
/// Field order is significant: it defines the serialization order of row
/// values everywhere in the system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    primary: Vec<String>,
    subsidiary: Vec<String>,
}

impl Schema {
    pub fn new(primary: Vec<String>, subsidiary: Vec<String>) -> Result<Self, SchemaError> {
        if primary.is_empty() {
            return Err(SchemaError::NoPrimaryFields);
        }
        let mut seen = std::collections::BTreeSet::new();
        for name in primary.iter().chain(subsidiary.iter()) {
            if !seen.insert(name) {
                return Err(SchemaError::DuplicateField(name.clone()));
            }
        }
        Ok(Self { primary, subsidiary })
    }

    pub fn primary(&self) -> &[String] {
        &self.primary
    }

    pub fn subsidiary(&self) -> &[String] {
        &self.subsidiary
    }

    /// All field names, primary first, in schema order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.primary.iter().chain(self.subsidiary.iter()).map(String::as_str)
    }

    pub fn arity(&self) -> usize {
        self.primary.len() + self.subsidiary.len()
    }

    /// Split a flat field list (in schema order) into a [`Row`].
    ///
    /// Returns `None` if the number of fields does not match the schema.
    pub fn row_from_fields(&self, mut fields: Vec<Value>) -> Option<Row> {
        if fields.len() != self.arity() {
            return None;
        }
        let subsidiary = fields.split_off(self.primary.len());
        Some(Row::new(Primary::new(fields), subsidiary))
    }

    /// The same schema with `field` prepended to the primary fields.
    ///
    /// This is the shape of a destination table qualified by a host field.
    pub fn qualified(&self, field: &str) -> Result<Self, SchemaError> {
        let mut primary = Vec::with_capacity(self.primary.len() + 1);
        primary.push(field.to_owned());
        primary.extend(self.primary.iter().cloned());
        Self::new(primary, self.subsidiary.clone())
    }
}

/// The state of one logical table at one instant.
///
/// Rows are keyed by their primary tuple; iteration is in lexicographic
/// primary-tuple order, which is the canonical order for hashing and
/// serialization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Table {
    rows: BTreeMap<Primary, Vec<Value>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row, replacing any previous row with the same primary tuple.
    ///
    /// Returns the replaced subsidiary values, if any.
    pub fn insert(&mut self, row: Row) -> Option<Vec<Value>> {
        self.rows.insert(row.primary, row.subsidiary)
    }

    pub fn remove(&mut self, primary: &Primary) -> Option<Vec<Value>> {
        self.rows.remove(primary)
    }

    pub fn get(&self, primary: &Primary) -> Option<&[Value]> {
        self.rows.get(primary).map(Vec::as_slice)
    }

    pub fn contains(&self, primary: &Primary) -> bool {
        self.rows.contains_key(primary)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in canonical (lexicographic primary-tuple) order.
    pub fn iter(&self) -> impl Iterator<Item = (&Primary, &[Value])> {
        self.rows.iter().map(|(p, s)| (p, s.as_slice()))
    }

    /// The fingerprint of this table's canonical serialization: the
    /// terminator byte, then every row's canonical bytes in canonical order.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Hasher::new();
        hasher.update(&[TABLE_TERMINATOR]);
        for (primary, subsidiary) in self.iter() {
            hasher.update(&canonical_record(primary, subsidiary));
        }
        hasher.finish()
    }
}

impl FromIterator<Row> for Table {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        let mut table = Self::new();
        for row in iter {
            table.insert(row);
        }
        table
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Build a row from string fields, the first `n_primary` being primary.
    pub fn row(n_primary: usize, fields: &[&str]) -> Row {
        let mut values: Vec<Value> = fields.iter().map(|f| f.as_bytes().to_vec()).collect();
        let subsidiary = values.split_off(n_primary);
        Row::new(Primary::new(values), subsidiary)
    }

    pub fn table(n_primary: usize, rows: &[&[&str]]) -> Table {
        rows.iter().map(|fields| row(n_primary, fields)).collect()
    }

    pub fn schema(primary: &[&str], subsidiary: &[&str]) -> Schema {
        Schema::new(
            primary.iter().map(|s| (*s).to_owned()).collect(),
            subsidiary.iter().map(|s| (*s).to_owned()).collect(),
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::testutil::{row, schema as make_schema, table};
    use super::*;

    #[test]
    fn table_id_shape() {
        assert!(TableId::new("BTL").is_ok());
        assert!(TableId::new("btl").is_err());
        assert!(TableId::new("BT").is_err());
        assert!(TableId::new("BTLX").is_err());
        assert!(TableId::new("B1L").is_err());
        assert_eq!(TableId::new("BTL").unwrap().to_string(), "BTL");
    }

    #[test]
    fn schema_rejects_bad_shapes() {
        assert_eq!(Schema::new(vec![], vec![]), Err(SchemaError::NoPrimaryFields));
        assert_eq!(
            Schema::new(vec!["a".into(), "a".into()], vec![]),
            Err(SchemaError::DuplicateField("a".into()))
        );
        assert_eq!(
            Schema::new(vec!["a".into()], vec!["a".into()]),
            Err(SchemaError::DuplicateField("a".into()))
        );
    }

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let a = table(2, &[&["Paul", "McCartney", "1942"], &["John", "Lennon", "1940"]]);
        let b = table(2, &[&["John", "Lennon", "1940"], &["Paul", "McCartney", "1942"]]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_sees_every_octet() {
        let a = table(1, &[&["a", "b"]]);
        let b = table(1, &[&["a", "c"]]);
        let c = table(1, &[&["ab", ""]]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        // Length prefixes keep field boundaries in the digest.
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn empty_table_fingerprint_is_not_null() {
        assert!(!Table::new().fingerprint().is_zero());
    }

    #[test]
    fn insert_replaces_on_primary_collision() {
        let mut t = Table::new();
        assert_eq!(t.insert(row(2, &["Paul", "McCartney", "1942"])), None);
        let prev = t.insert(row(2, &["Paul", "McCartney", "1943"]));
        assert_eq!(prev, Some(vec![b"1942".to_vec()]));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn qualified_schema_prepends_primary() {
        let schema = make_schema(&["first_name", "last_name"], &["born"]);
        let qualified = schema.qualified("host_id").unwrap();
        assert_eq!(qualified.primary(), ["host_id", "first_name", "last_name"]);
        assert_eq!(qualified.subsidiary(), ["born"]);
    }

    #[test]
    fn row_from_fields_splits_by_arity() {
        let schema = make_schema(&["a", "b"], &["c"]);
        let row = schema
            .row_from_fields(vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()])
            .unwrap();
        assert_eq!(row.primary.fields(), &[b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(row.subsidiary, vec![b"3".to_vec()]);
        assert!(schema.row_from_fields(vec![b"1".to_vec()]).is_none());
    }
}
