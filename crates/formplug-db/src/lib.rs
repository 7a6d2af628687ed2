//! # formplug-db
//!
//! Storage layer for the formplug plugin job engine.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for jobs, execution logs and plugin configs
//! - An in-memory store implementing the same traits for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use formplug_db::{Database, PoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/formplug", PoolConfig::from_env()).await?;
//!     db.migrate().await?;
//!     Ok(())
//! }
//! ```
pub mod jobs;
pub mod memory;
pub mod plugin_configs;
pub mod pool;

// Re-export core types
pub use formplug_core::*;

pub use jobs::PgJobRepository;
pub use memory::MemoryStore;
pub use plugin_configs::PgPluginConfigRepository;
pub use pool::{create_pool, log_pool_metrics, PoolConfig};

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Plugin jobs and their execution logs.
    pub jobs: PgJobRepository,
    /// Per-form plugin settings.
    pub plugin_configs: PgPluginConfigRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobRepository::new(pool.clone()),
            plugin_configs: PgPluginConfigRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
