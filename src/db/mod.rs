mod error;
pub mod repos;
pub mod sqlite;

use std::sync::Arc;

pub use error::{DbError, DbResult};
pub use repos::*;

use crate::config::DatabaseConfig;

/// Cached repository trait objects, created once at startup.
struct CachedRepos {
    provider_configs: Arc<dyn ProviderConfigRepo>,
    sso_identities: Arc<dyn SsoIdentityRepo>,
    sso_sessions: Arc<dyn SsoSessionRepo>,
    users: Arc<dyn UserRepo>,
}

/// Database pool for the SSO store.
///
/// Repositories are cached at construction time to avoid allocation on each access.
pub struct DbPool {
    pool: sqlx::SqlitePool,
    repos: CachedRepos,
}

impl DbPool {
    /// Create a DbPool from an existing SQLite pool.
    /// Primarily useful for testing.
    pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
        let repos = CachedRepos {
            provider_configs: Arc::new(sqlite::SqliteProviderConfigRepo::new(pool.clone())),
            sso_identities: Arc::new(sqlite::SqliteSsoIdentityRepo::new(pool.clone())),
            sso_sessions: Arc::new(sqlite::SqliteSsoSessionRepo::new(pool.clone())),
            users: Arc::new(sqlite::SqliteUserRepo::new(pool.clone())),
        };
        DbPool { pool, repos }
    }

    /// Create a database pool from configuration
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        match config {
            DatabaseConfig::Sqlite(cfg) => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .connect_with(
                        sqlx::sqlite::SqliteConnectOptions::new()
                            .filename(&cfg.path)
                            .create_if_missing(cfg.create_if_missing)
                            .foreign_keys(true)
                            .journal_mode(if cfg.wal_mode {
                                sqlx::sqlite::SqliteJournalMode::Wal
                            } else {
                                sqlx::sqlite::SqliteJournalMode::Delete
                            })
                            .busy_timeout(std::time::Duration::from_millis(cfg.busy_timeout_ms)),
                    )
                    .await?;

                Ok(Self::from_sqlite(pool))
            }
        }
    }

    /// Run database migrations using sqlx's migration runner.
    /// This automatically creates and manages a _sqlx_migrations table.
    pub async fn run_migrations(&self) -> DbResult<()> {
        tracing::info!("Running SQLite migrations");
        sqlx::migrate!("./migrations_sqlx/sqlite")
            .run(&self.pool)
            .await?;
        tracing::info!("SQLite migrations completed successfully");
        Ok(())
    }

    /// Get SSO provider configuration repository
    pub fn provider_configs(&self) -> Arc<dyn ProviderConfigRepo> {
        Arc::clone(&self.repos.provider_configs)
    }

    /// Get external identity mapping repository
    pub fn sso_identities(&self) -> Arc<dyn SsoIdentityRepo> {
        Arc::clone(&self.repos.sso_identities)
    }

    /// Get SSO session repository
    pub fn sso_sessions(&self) -> Arc<dyn SsoSessionRepo> {
        Arc::clone(&self.repos.sso_sessions)
    }

    /// Get user repository
    pub fn users(&self) -> Arc<dyn UserRepo> {
        Arc::clone(&self.repos.users)
    }

    /// Underlying SQLite pool
    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }
}
