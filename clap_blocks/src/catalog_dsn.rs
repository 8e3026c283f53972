//! Catalog-DSN-related configs.
use partition_catalog::{
    interface::Catalog,
    mem::MemCatalog,
    postgres::{PostgresCatalog, PostgresConnectionOptions},
    sqlite::{SqliteCatalog, SqliteConnectionOptions},
};
use snafu::{ResultExt, Snafu};
use std::{fmt::Display, str::FromStr, sync::Arc, time::Duration};
use tracing::{info, warn};

const SQLITE_MEMORY_DSN: &str = "sqlite::memory:";

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display(
        "Unknown Catalog DSN {dsn}. Expected a string like \
         'postgresql://postgres@localhost:5432/postgres' or 'sqlite:///tmp/catalog.sqlite'"
    ))]
    UnknownCatalogDsn { dsn: String },

    #[snafu(display(
        "Catalog DSN not specified. Expected a string like \
         'postgresql://postgres@localhost:5432/postgres' or 'sqlite:///tmp/catalog.sqlite'"
    ))]
    DsnNotSpecified {},

    #[snafu(display("A catalog error occurred: {}", source))]
    Catalog {
        source: partition_catalog::interface::Error,
    },
}

/// Which catalog backend a DSN selects.
#[derive(Clone, PartialEq, Eq)]
pub enum CatalogDsn {
    /// A `postgres…` or `dsn-file://…` connection string, passed on to the driver as is.
    Postgres(String),
    /// Path of a SQLite database file, or `sqlite::memory:`.
    Sqlite(String),
    /// The ephemeral in-memory catalog.
    Memory,
}

impl FromStr for CatalogDsn {
    type Err = Error;

    fn from_str(dsn: &str) -> Result<Self, Self::Err> {
        if dsn == "memory" {
            return Ok(Self::Memory);
        }
        if dsn.starts_with("postgres") || dsn.starts_with("dsn-file://") {
            return Ok(Self::Postgres(dsn.to_string()));
        }
        if dsn == SQLITE_MEMORY_DSN {
            return Ok(Self::Sqlite(dsn.to_string()));
        }
        match dsn.strip_prefix("sqlite://") {
            Some(file_path) if !file_path.is_empty() => Ok(Self::Sqlite(file_path.to_string())),
            _ => UnknownCatalogDsnSnafu { dsn }.fail(),
        }
    }
}

// Postgres DSNs may carry credentials, so neither Display nor Debug print them.
impl Display for CatalogDsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres(_) => write!(f, "postgres(dsn=OMITTED)"),
            Self::Sqlite(file_path) => write!(f, "sqlite({file_path})"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl std::fmt::Debug for CatalogDsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Connection pool settings shared by the SQL backends.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct CatalogPoolConfig {
    /// Maximum number of connections allowed to the catalog at any one time.
    #[clap(
        long = "catalog-max-connections",
        env = "PARTITION_CATALOG_MAX_CONNECTIONS",
        default_value_t = PostgresConnectionOptions::DEFAULT_MAX_CONNS,
        action,
    )]
    pub max_connections: u32,

    /// Set the amount of time to attempt connecting to the database.
    #[clap(
        long = "catalog-connect-timeout",
        env = "PARTITION_CATALOG_CONNECT_TIMEOUT",
        default_value = "2s",
        value_parser = humantime::parse_duration,
    )]
    pub connect_timeout: Duration,

    /// Set a maximum idle duration for individual connections.
    #[clap(
        long = "catalog-idle-timeout",
        env = "PARTITION_CATALOG_IDLE_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    pub idle_timeout: Duration,
}

/// CLI config for catalog DSN.
#[derive(Debug, Clone, clap::Parser)]
pub struct CatalogDsnConfig {
    /// Catalog connection string.
    ///
    /// The dsn determines the type of catalog used.
    ///
    /// PostgreSQL: `postgresql://postgres@localhost:5432/postgres`
    ///
    /// PostgreSQL with the DSN read from a file: `dsn-file:///etc/catalog/dsn`
    ///
    /// Sqlite (a local filename /tmp/foo.sqlite): `sqlite:///tmp/foo.sqlite`
    ///
    /// Sqlite held in memory: `sqlite::memory:`
    ///
    /// Memory (ephemeral, only useful for testing): `memory`
    ///
    #[clap(
        long = "catalog-dsn",
        env = "PARTITION_CATALOG_DSN",
        value_parser = CatalogDsn::from_str,
    )]
    pub dsn: Option<CatalogDsn>,

    /// Schema name for PostgreSQL-based catalogs.
    #[clap(
        long = "catalog-postgres-schema-name",
        env = "PARTITION_CATALOG_POSTGRES_SCHEMA_NAME",
        default_value = PostgresConnectionOptions::DEFAULT_SCHEMA_NAME,
        action,
    )]
    pub postgres_schema_name: String,

    /// Pool settings used by the SQL backends.
    #[clap(flatten)]
    pub pool: CatalogPoolConfig,
}

impl CatalogDsnConfig {
    /// Connection options for a Postgres catalog at `dsn`.
    pub fn postgres_options(&self, app_name: &str, dsn: &str) -> PostgresConnectionOptions {
        PostgresConnectionOptions {
            app_name: app_name.to_string(),
            schema_name: self.postgres_schema_name.clone(),
            dsn: dsn.to_string(),
            max_conns: self.pool.max_connections,
            connect_timeout: self.pool.connect_timeout,
            idle_timeout: self.pool.idle_timeout,
        }
    }

    /// Connection options for a SQLite catalog at `file_path`.
    pub fn sqlite_options(&self, file_path: &str) -> SqliteConnectionOptions {
        SqliteConnectionOptions {
            file_path: file_path.to_string(),
            max_conns: self.pool.max_connections,
            connect_timeout: self.pool.connect_timeout,
            idle_timeout: self.pool.idle_timeout,
        }
    }

    /// Get config-dependent catalog.
    ///
    /// The catalog is connected but not set up; call [`Catalog::setup`] before first use.
    pub async fn get_catalog(&self, app_name: &'static str) -> Result<Arc<dyn Catalog>, Error> {
        let Some(dsn) = self.dsn.as_ref() else {
            return Err(Error::DsnNotSpecified {});
        };
        info!(%dsn, postgres_schema_name = %self.postgres_schema_name, "opening catalog");

        let catalog: Arc<dyn Catalog> = match dsn {
            CatalogDsn::Postgres(dsn) => Arc::new(
                PostgresCatalog::connect(self.postgres_options(app_name, dsn))
                    .await
                    .context(CatalogSnafu)?,
            ),
            CatalogDsn::Sqlite(file_path) => Arc::new(
                SqliteCatalog::connect(self.sqlite_options(file_path))
                    .await
                    .context(CatalogSnafu)?,
            ),
            CatalogDsn::Memory => {
                warn!("in-memory catalog selected, partitions will not survive a restart");
                Arc::new(MemCatalog::new())
            }
        };
        Ok(catalog)
    }
}
