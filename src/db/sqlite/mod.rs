mod common;
mod provider_configs;
mod sso_identities;
mod sso_sessions;
mod users;

pub use provider_configs::SqliteProviderConfigRepo;
pub use sso_identities::SqliteSsoIdentityRepo;
pub use sso_sessions::SqliteSsoSessionRepo;
pub use users::SqliteUserRepo;

/// Create an in-memory SQLite pool with the real migrations applied.
///
/// A single connection keeps every query on the same in-memory database.
#[cfg(test)]
pub(crate) async fn test_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    sqlx::migrate!("./migrations_sqlx/sqlite")
        .run(&pool)
        .await
        .expect("Failed to run SQLite migrations");

    pool
}
