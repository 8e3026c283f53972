//! A Postgres backed implementation of the Catalog

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
    postgres::{PgArguments, PgConnectOptions, PgPoolOptions},
    query::QueryAs,
    ConnectOptions, Executor, Pool, Postgres,
};
use std::{fmt::Display, str::FromStr, time::Duration};
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Named statements whose shape never changes between calls.
mod statements {
    pub(super) const DELETE_BY_NAMES: &str = r#"
DELETE FROM partition_table p
USING table_object t, database_object d, source s
WHERE p.table_id = t.id
  AND t.database_id = d.id
  AND d.source_id = s.id
  AND s.name = $1 AND d.name = $2 AND t.name = $3
  AND p.name = ANY($4);
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
WHERE uri = ANY($1);
"#;

    pub(super) const GET_TABLE_BY_REFERENCE: &str = r#"
SELECT t.id, s.name AS source_name, d.name AS database_name, t.name AS table_name
FROM table_object t
JOIN database_object d ON d.id = t.database_id
JOIN source s ON s.id = d.source_id
WHERE s.name = $1 AND d.name = $2 AND t.name = $3;
"#;
}

/// Postgres connection options.
#[derive(Debug, Clone)]
pub struct PostgresConnectionOptions {
    /// Application name.
    ///
    /// This will be reported to postgres.
    pub app_name: String,

    /// Schema name.
    pub schema_name: String,

    /// DSN.
    pub dsn: String,

    /// Maximum number of concurrent connections.
    pub max_conns: u32,

    /// Set the amount of time to attempt connecting to the database.
    pub connect_timeout: Duration,

    /// Set a maximum idle duration for individual connections.
    pub idle_timeout: Duration,
}

impl PostgresConnectionOptions {
    /// Default value for [`schema_name`](Self::schema_name).
    pub const DEFAULT_SCHEMA_NAME: &'static str = "partition_catalog";

    /// Default value for [`max_conns`](Self::max_conns).
    pub const DEFAULT_MAX_CONNS: u32 = 10;

    /// Default value for [`connect_timeout`](Self::connect_timeout).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default value for [`idle_timeout`](Self::idle_timeout).
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for PostgresConnectionOptions {
    fn default() -> Self {
        Self {
            app_name: String::from("partition_catalog"),
            schema_name: String::from(Self::DEFAULT_SCHEMA_NAME),
            dsn: String::new(),
            max_conns: Self::DEFAULT_MAX_CONNS,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// PostgreSQL catalog.
#[derive(Debug)]
pub struct PostgresCatalog {
    pool: Pool<Postgres>,
    // Connection options for display
    options: PostgresConnectionOptions,
}

impl PostgresCatalog {
    /// Connect to the catalog store.
    pub async fn connect(options: PostgresConnectionOptions) -> Result<Self> {
        let pool = new_pool(&options).await?;
        Ok(Self { pool, options })
    }

    fn schema_name(&self) -> &str {
        &self.options.schema_name
    }
}

impl Display for PostgresCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            // Do not include dsn in log as it may have credentials
            // that should not end up in the log
            "Postgres(dsn=OMITTED, schema_name='{}')",
            self.schema_name()
        )
    }
}

/// Repositories for [`PostgresCatalog`]; each operation checks a connection out of the pool.
#[derive(Debug)]
pub struct PostgresTxn {
    pool: Pool<Postgres>,
}

/// Creates a new [`sqlx::Pool`] from a database config.
async fn new_pool(options: &PostgresConnectionOptions) -> Result<Pool<Postgres>, sqlx::Error> {
    let parsed_dsn = parse_dsn(&options.dsn)?;

    // sqlx exposes some options as pool options, while other options are available as
    // connection options.
    let connect_options = PgConnectOptions::from_str(&parsed_dsn)?
        // the default is INFO, which is frankly surprising.
        .log_statements(log::LevelFilter::Trace);

    let app_name = options.app_name.clone();
    let schema_name = options.schema_name.clone();
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(options.max_conns)
        .acquire_timeout(options.connect_timeout)
        .idle_timeout(options.idle_timeout)
        .test_before_acquire(true)
        .after_connect(move |c, _meta| {
            let app_name = app_name.to_owned();
            let schema_name = schema_name.to_owned();
            Box::pin(async move {
                // Tag the connection with the provided application name, unless the DSN already
                // set one.
                let current_application_name: String =
                    sqlx::query_scalar("SELECT current_setting('application_name');")
                        .fetch_one(&mut *c)
                        .await?;
                if current_application_name.is_empty() {
                    sqlx::query("SELECT set_config('application_name', $1, false);")
                        .bind(&*app_name)
                        .execute(&mut *c)
                        .await?;
                }
                let search_path_query = format!("SET search_path TO {schema_name},public;");
                c.execute(sqlx::query(&search_path_query)).await?;

                Ok(())
            })
        })
        .connect_with(connect_options)
        .await?;

    info!(application_name = %options.app_name, "connected to postgres catalog");
    Ok(pool)
}

/// Parse a postgres catalog dsn, handling the special `dsn-file://` syntax: the DSN is read from
/// the named file so credentials need not appear on the command line.
///
/// Returns an error if the dsn-file could not be read correctly.
pub fn parse_dsn(dsn: &str) -> Result<String, sqlx::Error> {
    let dsn = match get_dsn_file_path(dsn) {
        Some(filename) => std::fs::read_to_string(filename)?.trim().to_string(),
        None => dsn.to_string(),
    };
    Ok(dsn)
}

fn get_dsn_file_path(dsn: &str) -> Option<String> {
    const DSN_SCHEME: &str = "dsn-file://";
    dsn.strip_prefix(DSN_SCHEME).map(ToOwned::to_owned)
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn setup(&self) -> Result<(), Error> {
        // The schema must exist before the migrator runs, otherwise `_sqlx_migrations` is created
        // in `public` on the first run and in the schema on later runs.
        let create_schema_query = format!("CREATE SCHEMA IF NOT EXISTS {};", self.schema_name());
        self.pool
            .execute(sqlx::query(&create_schema_query))
            .await
            .map_err(|e| Error::Setup { source: e })?;

        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Setup { source: e.into() })?;

        info!(schema_name = %self.schema_name(), "postgres catalog set up");
        Ok(())
    }

    async fn repositories(&self) -> Box<dyn RepoCollection> {
        Box::new(PostgresTxn {
            pool: self.pool.clone(),
        })
    }
}

impl RepoCollection for PostgresTxn {
    fn tables(&mut self) -> &mut dyn TableRepo {
        self
    }

    fn partitions(&mut self) -> &mut dyn PartitionRepo {
        self
    }
}

/// Bind compiled parameters in placeholder order.
fn bind_params<'q>(
    query: QueryAs<'q, Postgres, Partition, PgArguments>,
    params: &'q [SqlParam],
) -> QueryAs<'q, Postgres, Partition, PgArguments> {
    params.iter().fold(query, |query, param| match param {
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.as_str()),
        SqlParam::TextList(v) => query.bind(v.as_slice()),
    })
}

impl PostgresTxn {
    async fn fetch_compiled(&self, compiled: &CompiledQuery) -> Result<Vec<Partition>> {
        let mut conn = self.pool.acquire().await?;
        let query = bind_params(sqlx::query_as(&compiled.sql), &compiled.params);
        Ok(query.fetch_all(&mut *conn).await?)
    }
}

#[async_trait]
impl TableRepo for PostgresTxn {
    async fn create_or_get(&mut self, table: &TableReference) -> Result<Table> {
        let mut tx = self.pool.begin().await?;

        let source_id: i64 = sqlx::query_scalar(
            r#"
INSERT INTO source ( name )
VALUES ( $1 )
ON CONFLICT ON CONSTRAINT source_name_unique
DO UPDATE SET name = source.name
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
ON CONFLICT ON CONSTRAINT database_object_name_unique
DO UPDATE SET name = database_object.name
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
ON CONFLICT ON CONSTRAINT table_object_name_unique
DO UPDATE SET name = table_object.name
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
impl PartitionRepo for PostgresTxn {
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
        let compiled = filter.compile(table_id, SqlDialect::Postgres)?;
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
            .bind(names) // $4
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
                    .bind(uris) // $1
                    .fetch_all(&mut *conn)
                    .await?)
            }
            UriLookup::Prefix(prefixes) => {
                let compiled = UriLookup::compile_prefix(prefixes, SqlDialect::Postgres);
                self.fetch_compiled(&compiled).await
            }
        }
    }
}

/// The error code returned by Postgres for a unique constraint violation.
///
/// See <https://www.postgresql.org/docs/9.2/errcodes-appendix.html>
const PG_UNIQUE_VIOLATION: &str = "23505";

/// The error code returned by Postgres for a foreign key constraint violation.
///
/// See <https://www.postgresql.org/docs/9.2/errcodes-appendix.html>
const PG_FK_VIOLATION: &str = "23503";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(inner) = e {
        if let Some(code) = inner.code() {
            if code == PG_UNIQUE_VIOLATION {
                return true;
            }
        }
    }

    false
}

fn is_fk_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(inner) = e {
        if let Some(code) = inner.code() {
            if code == PG_FK_VIOLATION {
                return true;
            }
        }
    }

    false
}
