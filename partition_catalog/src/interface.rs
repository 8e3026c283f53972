//! Traits and errors for the partition catalog API.

use crate::{
    query::{self, PartitionFilter, UriLookup},
    types::{Partition, PartitionId, PartitionParams, Table, TableId, TableReference},
};
use async_trait::async_trait;
use snafu::Snafu;
use std::fmt::{Debug, Display};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid partition filter: {source}"))]
    InvalidFilterCombination { source: query::Error },

    #[snafu(display("catalog store unavailable: {source}"))]
    StoreUnavailable { source: sqlx::Error },

    #[snafu(display("unhandled sqlx error: {source}"))]
    SqlxError { source: sqlx::Error },

    #[snafu(display("partition {name} already exists in table {table_id}"))]
    PartitionNameExists { table_id: TableId, name: String },

    #[snafu(display("table {id} not found"))]
    TableNotFound { id: TableId },

    #[snafu(display("failed to set up catalog: {source}"))]
    Setup { source: sqlx::Error },
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        if is_unavailable(&e) {
            Self::StoreUnavailable { source: e }
        } else {
            Self::SqlxError { source: e }
        }
    }
}

impl From<query::Error> for Error {
    fn from(e: query::Error) -> Self {
        Self::InvalidFilterCombination { source: e }
    }
}

/// `true` for failures to reach the store, as opposed to failures of a statement.
pub(crate) fn is_unavailable(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// A specialized `Error` for Catalog errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Trait that contains methods for working with the catalog
#[async_trait]
pub trait Catalog: Send + Sync + Debug + Display {
    /// Setup catalog for usage and apply possible migrations.
    async fn setup(&self) -> Result<(), Error>;

    /// Accesses the repositories without a transaction scope.
    ///
    /// Every operation on the returned collection acquires its own store handle and releases it
    /// before returning, so the collection can be kept around cheaply.
    async fn repositories(&self) -> Box<dyn RepoCollection>;
}

/// Methods for working with the catalog's various repositories (collections of entities).
pub trait RepoCollection: Send + Sync + Debug {
    /// Repository for [tables](Table).
    fn tables(&mut self) -> &mut dyn TableRepo;

    /// Repository for [partitions](Partition).
    fn partitions(&mut self) -> &mut dyn PartitionRepo;
}

/// Functions for working with tables in the catalog
#[async_trait]
pub trait TableRepo: Send + Sync {
    /// Register the table (and its source and database) or get the existing record.
    async fn create_or_get(&mut self, table: &TableReference) -> Result<Table>;

    /// Look up a table by its qualified name.
    async fn get_by_reference(&mut self, table: &TableReference) -> Result<Option<Table>>;
}

/// Functions for working with partitions in the catalog
#[async_trait]
pub trait PartitionRepo: Send + Sync {
    /// Register a partition. Names are unique within a table.
    async fn create(&mut self, params: PartitionParams) -> Result<Partition>;

    /// Look up a partition by id.
    async fn get_by_id(&mut self, id: PartitionId) -> Result<Option<Partition>>;

    /// List the partitions of `table_id` matching `filter`, sorted and paged as requested.
    ///
    /// An invalid date criteria expression fails with [`Error::InvalidFilterCombination`] before
    /// the store is contacted.
    async fn get_partitions(
        &mut self,
        table_id: TableId,
        filter: &PartitionFilter,
    ) -> Result<Vec<Partition>>;

    /// Delete the named partitions of `table` in one statement, returning how many were removed.
    ///
    /// An empty `names` list deletes nothing and does not touch the store.
    async fn delete_by_names(&mut self, table: &TableReference, names: &[String]) -> Result<u64>;

    /// Number of partitions belonging to `table`.
    async fn count(&mut self, table: &TableReference) -> Result<u64>;

    /// Partitions whose uri matches `lookup`.
    async fn get_by_uris(&mut self, lookup: &UriLookup) -> Result<Vec<Partition>>;
}
