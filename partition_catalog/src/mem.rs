//! This module implements an in-memory implementation of the partition catalog interface. It can
//! be used for testing or for a catalog designed to run without persistence.

use crate::{
    interface::{
        Catalog, Error, PartitionRepo, RepoCollection, Result, TableNotFoundSnafu, TableRepo,
    },
    query::{PartitionFilter, UriLookup},
    types::{Partition, PartitionId, PartitionParams, Table, TableId, TableReference},
};
use async_trait::async_trait;
use snafu::ensure;
use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::debug;

/// In-memory catalog that implements the `RepoCollection` and individual repo traits from
/// the catalog interface.
#[derive(Default)]
pub struct MemCatalog {
    collections: Arc<Mutex<MemCollections>>,
}

impl MemCatalog {
    /// return new initialized `MemCatalog`
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemCatalog").finish_non_exhaustive()
    }
}

impl Display for MemCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Memory")
    }
}

#[derive(Default, Debug, Clone)]
struct MemCollections {
    tables: Vec<Table>,
    partitions: Vec<Partition>,
    next_partition_id: i64,
}

impl MemCollections {
    fn table_by_reference(&self, table: &TableReference) -> Option<&Table> {
        self.tables.iter().find(|t| t.reference == *table)
    }
}

/// Repositories bound to an in-memory catalog. The collections are locked for the duration of a
/// single operation only.
#[derive(Debug)]
pub struct MemTxn {
    collections: Arc<Mutex<MemCollections>>,
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn setup(&self) -> Result<(), Error> {
        // nothing to do
        Ok(())
    }

    async fn repositories(&self) -> Box<dyn RepoCollection> {
        Box::new(MemTxn {
            collections: Arc::clone(&self.collections),
        })
    }
}

impl RepoCollection for MemTxn {
    fn tables(&mut self) -> &mut dyn TableRepo {
        self
    }

    fn partitions(&mut self) -> &mut dyn PartitionRepo {
        self
    }
}

#[async_trait]
impl TableRepo for MemTxn {
    async fn create_or_get(&mut self, table: &TableReference) -> Result<Table> {
        let mut stage = self.collections.lock().await;

        if let Some(existing) = stage.table_by_reference(table) {
            return Ok(existing.clone());
        }

        let created = Table {
            id: TableId::new(stage.tables.len() as i64 + 1),
            reference: table.clone(),
        };
        stage.tables.push(created.clone());
        Ok(created)
    }

    async fn get_by_reference(&mut self, table: &TableReference) -> Result<Option<Table>> {
        let stage = self.collections.lock().await;
        Ok(stage.table_by_reference(table).cloned())
    }
}

#[async_trait]
impl PartitionRepo for MemTxn {
    async fn create(&mut self, params: PartitionParams) -> Result<Partition> {
        let mut stage = self.collections.lock().await;

        ensure!(
            stage.tables.iter().any(|t| t.id == params.table_id),
            TableNotFoundSnafu {
                id: params.table_id
            }
        );
        if stage
            .partitions
            .iter()
            .any(|p| p.table_id == params.table_id && p.name == params.name)
        {
            return Err(Error::PartitionNameExists {
                table_id: params.table_id,
                name: params.name,
            });
        }

        stage.next_partition_id += 1;
        let partition = Partition {
            id: PartitionId::new(stage.next_partition_id),
            table_id: params.table_id,
            name: params.name,
            uri: params.uri,
            created_date: params.created_date,
        };
        stage.partitions.push(partition.clone());
        Ok(partition)
    }

    async fn get_by_id(&mut self, id: PartitionId) -> Result<Option<Partition>> {
        let stage = self.collections.lock().await;
        Ok(stage.partitions.iter().find(|p| p.id == id).cloned())
    }

    async fn get_partitions(
        &mut self,
        table_id: TableId,
        filter: &PartitionFilter,
    ) -> Result<Vec<Partition>> {
        let stage = self.collections.lock().await;
        let partitions = filter.apply(table_id, &stage.partitions)?;
        debug!(%table_id, n_partitions = partitions.len(), "listed partitions");
        Ok(partitions)
    }

    async fn delete_by_names(&mut self, table: &TableReference, names: &[String]) -> Result<u64> {
        if names.is_empty() {
            return Ok(0);
        }

        let mut stage = self.collections.lock().await;
        let Some(table_id) = stage.table_by_reference(table).map(|t| t.id) else {
            return Ok(0);
        };

        let names: HashSet<&str> = names.iter().map(String::as_str).collect();
        let before = stage.partitions.len();
        stage
            .partitions
            .retain(|p| !(p.table_id == table_id && names.contains(p.name.as_str())));
        let deleted = (before - stage.partitions.len()) as u64;

        debug!(%table, deleted, "deleted partitions by name");
        Ok(deleted)
    }

    async fn count(&mut self, table: &TableReference) -> Result<u64> {
        let stage = self.collections.lock().await;
        let Some(table_id) = stage.table_by_reference(table).map(|t| t.id) else {
            return Ok(0);
        };
        Ok(stage
            .partitions
            .iter()
            .filter(|p| p.table_id == table_id)
            .count() as u64)
    }

    async fn get_by_uris(&mut self, lookup: &UriLookup) -> Result<Vec<Partition>> {
        let stage = self.collections.lock().await;
        Ok(stage
            .partitions
            .iter()
            .filter(|p| lookup.matches(p))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catalog() {
        crate::interface_tests::test_catalog(|| async {
            let catalog: Arc<dyn Catalog> = Arc::new(MemCatalog::new());
            catalog
        })
        .await;
    }
}
