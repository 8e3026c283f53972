//! A SQLite backed implementation of the Catalog

use crate::{
    interface::{
        Catalog, Error, PartitionRepo, RepoCollection, Result, TableNotFoundSnafu, TableRepo,
    },
    query::{CompiledQuery, PartitionFilter, SqlDialect, SqlParam, UriLookup, PARTITION_COLUMNS},
    types::{Partition, PartitionId, PartitionParams, Table, TableId, TableReference},
};
use async_trait::async_trait;
use snafu::ensure;
use sqlx::{
    migrate::Migrator,
    query::QueryAs,
    sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions},
    types::Json,
    Pool, Sqlite,
};
use std::{fmt::Display, str::FromStr, time::Duration};
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!("sqlite/migrations");

/// Named statements whose shape never changes between calls.
mod statements {
    pub(super) const DELETE_BY_NAMES: &str = r#"
DELETE FROM partition_table
WHERE table_id IN (
    SELECT t.id
    FROM table_object t
    JOIN database_object d ON d.id = t.database_id
    JOIN source s ON s.id = d.source_id
    WHERE s.name = $1 AND d.name = $2 AND t.name = $3
)
AND name IN (SELECT value FROM json_each($4));
"#;

    pub(super) const COUNT_FOR_TABLE: &str = r#"
SELECT count(*)
FROM partition_table p
JOIN table_object t ON t.id = p.table_id
JOIN database_object d ON d.id = t.database_id
JOIN source s ON s.id = d.source_id
WHERE s.name = $1 AND d.name = $2 AND t.name = $3;
"#;

    pub(super) const GET_BY_URI_EXACT: &str = r#"
SELECT id, table_id, name, uri, created_date
FROM partition_table
WHERE uri IN (SELECT value FROM json_each($1));
"#;

    pub(super) const GET_TABLE_BY_REFERENCE: &str = r#"
SELECT t.id, s.name AS source_name, d.name AS database_name, t.name AS table_name
FROM table_object t
JOIN database_object d ON d.id = t.database_id
JOIN source s ON s.id = d.source_id
WHERE s.name = $1 AND d.name = $2 AND t.name = $3;
"#;
}

/// SQLite connection options.
#[derive(Debug, Clone)]
pub struct SqliteConnectionOptions {
    /// local file path to .sqlite file, or `sqlite::memory:`
    pub file_path: String,

    /// Maximum number of pooled connections.
    pub max_conns: u32,

    /// How long to wait for a pooled connection before failing with
    /// [`StoreUnavailable`](Error::StoreUnavailable).
    pub connect_timeout: Duration,

    /// Set a maximum idle duration for individual connections.
    pub idle_timeout: Duration,
}

impl SqliteConnectionOptions {
    /// Default value for [`max_conns`](Self::max_conns).
    pub const DEFAULT_MAX_CONNS: u32 = 10;

    /// Default value for [`connect_timeout`](Self::connect_timeout).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default value for [`idle_timeout`](Self::idle_timeout).
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Options for the database at `file_path` with default pool settings.
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            max_conns: Self::DEFAULT_MAX_CONNS,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// SQLite catalog.
#[derive(Debug)]
pub struct SqliteCatalog {
    pool: Pool<Sqlite>,
    options: SqliteConnectionOptions,
}

/// Repositories for [`SqliteCatalog`]; each operation checks a connection out of the pool.
#[derive(Debug)]
pub struct SqliteTxn {
    pool: Pool<Sqlite>,
}

impl SqliteCatalog {
    /// Connect to the catalog store.
    pub async fn connect(options: SqliteConnectionOptions) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&options.file_path)
            .map_err(|e| Error::SqlxError { source: e })?
            .create_if_missing(true)
            .foreign_keys(true);

        // an in-memory database lives only as long as one of its connections
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(options.max_conns)
            .acquire_timeout(options.connect_timeout)
            .idle_timeout(options.idle_timeout)
            .connect_with(opts)
            .await
            .map_err(Error::from)?;
        info!(
            file_path = %options.file_path,
            max_conns = options.max_conns,
            "connected to sqlite catalog"
        );

        Ok(Self { pool, options })
    }
}

impl Display for SqliteCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sqlite(dsn='{}')", self.options.file_path)
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn setup(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Setup { source: e.into() })?;
        Ok(())
    }

    async fn repositories(&self) -> Box<dyn RepoCollection> {
        Box::new(SqliteTxn {
            pool: self.pool.clone(),
        })
    }
}

impl RepoCollection for SqliteTxn {
    fn tables(&mut self) -> &mut dyn TableRepo {
        self
    }

    fn partitions(&mut self) -> &mut dyn PartitionRepo {
        self
    }
}

/// Bind compiled parameters in placeholder order.
fn bind_params<'q>(
    query: QueryAs<'q, Sqlite, Partition, SqliteArguments<'q>>,
    params: &'q [SqlParam],
) -> QueryAs<'q, Sqlite, Partition, SqliteArguments<'q>> {
    params.iter().fold(query, |query, param| match param {
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.as_str()),
        SqlParam::TextList(v) => query.bind(Json(v)),
    })
}

impl SqliteTxn {
    async fn fetch_compiled(&self, compiled: &CompiledQuery) -> Result<Vec<Partition>> {
        let mut conn = self.pool.acquire().await?;
        let query = bind_params(sqlx::query_as(&compiled.sql), &compiled.params);
        Ok(query.fetch_all(&mut *conn).await?)
    }
}

#[async_trait]
impl TableRepo for SqliteTxn {
    async fn create_or_get(&mut self, table: &TableReference) -> Result<Table> {
        let mut tx = self.pool.begin().await?;

        // `DO UPDATE` rather than `DO NOTHING` so that `RETURNING` yields the existing row
        let source_id: i64 = sqlx::query_scalar(
            r#"
INSERT INTO source ( name )
VALUES ( $1 )
ON CONFLICT (name) DO UPDATE SET name = excluded.name
RETURNING id;
            "#,
        )
        .bind(&table.source_name) // $1
        .fetch_one(&mut *tx)
        .await?;

        let database_id: i64 = sqlx::query_scalar(
            r#"
INSERT INTO database_object ( source_id, name )
VALUES ( $1, $2 )
ON CONFLICT (source_id, name) DO UPDATE SET name = excluded.name
RETURNING id;
            "#,
        )
        .bind(source_id) // $1
        .bind(&table.database_name) // $2
        .fetch_one(&mut *tx)
        .await?;

        let table_id: TableId = sqlx::query_scalar(
            r#"
INSERT INTO table_object ( database_id, name )
VALUES ( $1, $2 )
ON CONFLICT (database_id, name) DO UPDATE SET name = excluded.name
RETURNING id;
            "#,
        )
        .bind(database_id) // $1
        .bind(&table.table_name) // $2
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Table {
            id: table_id,
            reference: table.clone(),
        })
    }

    async fn get_by_reference(&mut self, table: &TableReference) -> Result<Option<Table>> {
        let mut conn = self.pool.acquire().await?;
        let rec = sqlx::query_as::<_, Table>(statements::GET_TABLE_BY_REFERENCE)
            .bind(&table.source_name) // $1
            .bind(&table.database_name) // $2
            .bind(&table.table_name) // $3
            .fetch_optional(&mut *conn)
            .await?;
        Ok(rec)
    }
}

#[async_trait]
impl PartitionRepo for SqliteTxn {
    async fn create(&mut self, params: PartitionParams) -> Result<Partition> {
        let mut conn = self.pool.acquire().await?;
        let rec = sqlx::query_as::<_, Partition>(&format!(
            r#"
INSERT INTO partition_table ( table_id, name, uri, created_date )
VALUES ( $1, $2, $3, $4 )
RETURNING {PARTITION_COLUMNS};
            "#
        ))
        .bind(params.table_id) // $1
        .bind(&params.name) // $2
        .bind(&params.uri) // $3
        .bind(params.created_date) // $4
        .fetch_one(&mut *conn)
        .await;

        match rec {
            Ok(partition) => Ok(partition),
            Err(e) if is_unique_violation(&e) => Err(Error::PartitionNameExists {
                table_id: params.table_id,
                name: params.name,
            }),
            Err(e) => {
                ensure!(
                    !is_fk_violation(&e),
                    TableNotFoundSnafu {
                        id: params.table_id
                    }
                );
                Err(e.into())
            }
        }
    }

    async fn get_by_id(&mut self, id: PartitionId) -> Result<Option<Partition>> {
        let mut conn = self.pool.acquire().await?;
        let rec = sqlx::query_as::<_, Partition>(&format!(
            "SELECT {PARTITION_COLUMNS} FROM partition_table WHERE id = $1;"
        ))
        .bind(id) // $1
        .fetch_optional(&mut *conn)
        .await?;
        Ok(rec)
    }

    async fn get_partitions(
        &mut self,
        table_id: TableId,
        filter: &PartitionFilter,
    ) -> Result<Vec<Partition>> {
        let compiled = filter.compile(table_id, SqlDialect::Sqlite)?;
        let partitions = self.fetch_compiled(&compiled).await?;
        debug!(%table_id, n_partitions = partitions.len(), "listed partitions");
        Ok(partitions)
    }

    async fn delete_by_names(&mut self, table: &TableReference, names: &[String]) -> Result<u64> {
        if names.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.acquire().await?;
        let deleted = sqlx::query(statements::DELETE_BY_NAMES)
            .bind(&table.source_name) // $1
            .bind(&table.database_name) // $2
            .bind(&table.table_name) // $3
            .bind(Json(names)) // $4
            .execute(&mut *conn)
            .await?
            .rows_affected();

        debug!(%table, deleted, "deleted partitions by name");
        Ok(deleted)
    }

    async fn count(&mut self, table: &TableReference) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let count: i64 = sqlx::query_scalar(statements::COUNT_FOR_TABLE)
            .bind(&table.source_name) // $1
            .bind(&table.database_name) // $2
            .bind(&table.table_name) // $3
            .fetch_one(&mut *conn)
            .await?;
        Ok(count as u64)
    }

    async fn get_by_uris(&mut self, lookup: &UriLookup) -> Result<Vec<Partition>> {
        match lookup {
            UriLookup::Exact(uris) => {
                let mut conn = self.pool.acquire().await?;
                Ok(sqlx::query_as::<_, Partition>(statements::GET_BY_URI_EXACT)
                    .bind(Json(uris)) // $1
                    .fetch_all(&mut *conn)
                    .await?)
            }
            UriLookup::Prefix(prefixes) => {
                let compiled = UriLookup::compile_prefix(prefixes, SqlDialect::Sqlite);
                self.fetch_compiled(&compiled).await
            }
        }
    }
}

/// The error code returned by SQLite for a unique constraint violation.
///
/// See <https://sqlite.org/rescode.html#constraint_unique>
const SQLITE_UNIQUE_VIOLATION: &str = "2067";

/// The error code returned by SQLite for a foreign key constraint violation.
///
/// See <https://sqlite.org/rescode.html#constraint_foreignkey>
const SQLITE_FK_VIOLATION: &str = "787";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(inner) = e {
        if let Some(code) = inner.code() {
            if code == SQLITE_UNIQUE_VIOLATION {
                return true;
            }
        }
    }

    false
}

fn is_fk_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(inner) = e {
        if let Some(code) = inner.code() {
            if code == SQLITE_FK_VIOLATION {
                return true;
            }
        }
    }

    false
}
