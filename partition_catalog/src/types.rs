//! Data objects stored in and returned by the partition catalog.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt::{Display, Formatter};

/// Unique ID for a `Table`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct TableId(i64);

#[allow(missing_docs)]
impl TableId {
    pub const fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID for a `Partition`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct PartitionId(i64);

#[allow(missing_docs)]
impl PartitionId {
    pub const fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point in time, stored as milliseconds since the Unix epoch (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from milliseconds since the epoch.
    pub const fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// Create a timestamp from whole seconds since the epoch.
    pub fn from_secs(secs: i64) -> Option<Self> {
        secs.checked_mul(1_000).map(Self)
    }

    /// The current wall clock time.
    pub fn now() -> Self {
        Utc::now().into()
    }

    /// Milliseconds since the epoch.
    pub fn get(&self) -> i64 {
        self.0
    }

    /// Convert to a [`DateTime`]; `None` if out of chrono's representable range.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_millis())
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// The fully-qualified, case-sensitive name of a table: source, database and table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::FromRow)]
pub struct TableReference {
    /// Name of the catalog source (e.g. `prodhive`).
    pub source_name: String,
    /// Name of the database within the source.
    pub database_name: String,
    /// Name of the table within the database.
    pub table_name: String,
}

impl TableReference {
    /// Create a reference from its three components.
    pub fn new(
        source_name: impl Into<String>,
        database_name: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            database_name: database_name.into(),
            table_name: table_name.into(),
        }
    }
}

impl Display for TableReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.source_name, self.database_name, self.table_name
        )
    }
}

/// Data object for a table registered in the catalog
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Table {
    /// The id of the table
    pub id: TableId,
    /// The qualified name of the table
    #[sqlx(flatten)]
    pub reference: TableReference,
}

/// Data object for a partition
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Partition {
    /// the id of the partition
    pub id: PartitionId,
    /// the table the partition belongs to
    pub table_id: TableId,
    /// the partition specification, e.g. `dateint=20240101/hour=3`; unique within the table
    pub name: String,
    /// where the partition's data lives
    pub uri: String,
    /// when the partition was registered
    pub created_date: Timestamp,
}

/// Parameters used to register a new partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionParams {
    /// the table the partition belongs to
    pub table_id: TableId,
    /// the partition specification
    pub name: String,
    /// where the partition's data lives
    pub uri: String,
    /// when the partition was created
    pub created_date: Timestamp,
}

impl PartitionParams {
    /// Parameters for a partition created now.
    pub fn new(table_id: TableId, name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            table_id,
            name: name.into(),
            uri: uri.into(),
            created_date: Timestamp::now(),
        }
    }

    /// Override the creation timestamp.
    pub fn with_created_date(self, created_date: Timestamp) -> Self {
        Self {
            created_date,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_display_is_rfc3339() {
        let ts = Timestamp::from_secs(1_700_000_000).unwrap();
        assert_eq!(ts.get(), 1_700_000_000_000);
        assert_eq!(ts.to_string(), "2023-11-14T22:13:20+00:00");
    }

    #[test]
    fn table_reference_display() {
        let table = TableReference::new("prodhive", "sales", "orders");
        assert_eq!(table.to_string(), "prodhive/sales/orders");
    }
}
