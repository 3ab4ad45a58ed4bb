use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{common::parse_uuid, users::fetch_user};
use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{ProvisionIdentity, ProvisionOutcome, SsoIdentityRepo},
    },
    models::{MembershipSource, SsoUserMapping},
};

/// Attempts before a provisioning race is reported as a conflict.
const MAX_PROVISION_ATTEMPTS: usize = 3;

/// Primary result code for SQLITE_BUSY. Extended codes keep it in the low byte.
const SQLITE_BUSY: i32 = 5;

/// The database stayed locked past the busy timeout.
fn is_busy(err: &DbError) -> bool {
    match err {
        DbError::Sqlx(sqlx::Error::Database(db_err)) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| code & 0xff == SQLITE_BUSY),
        _ => false,
    }
}

pub struct SqliteSsoIdentityRepo {
    pool: SqlitePool,
}

impl SqliteSsoIdentityRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// One provisioning attempt. Returns `Ok(None)` when a concurrent login
    /// inserted the mapping first; the caller retries.
    async fn try_provision(
        &self,
        identity: &ProvisionIdentity,
    ) -> DbResult<Option<ProvisionOutcome>> {
        let now = Utc::now();
        // Take the write lock up front. A deferred transaction that reads
        // first cannot upgrade once another connection has written in WAL mode.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT user_id FROM sso_user_mappings WHERE provider_id = ? AND external_id = ?",
        )
        .bind(identity.provider_id)
        .bind(&identity.external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (user_id, created) = match existing {
            Some(user_id) => {
                let user_id = parse_uuid(&user_id)?;

                sqlx::query(
                    r#"
                    UPDATE users
                    SET email = ?, full_name = COALESCE(?, full_name), updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&identity.email)
                .bind(&identity.full_name)
                .bind(now)
                .bind(user_id.to_string())
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE sso_user_mappings
                    SET email = ?, last_login_at = ?
                    WHERE provider_id = ? AND external_id = ?
                    "#,
                )
                .bind(&identity.email)
                .bind(now)
                .bind(identity.provider_id)
                .bind(&identity.external_id)
                .execute(&mut *tx)
                .await?;

                (user_id, false)
            }
            None => {
                let user_id = Uuid::new_v4();

                sqlx::query(
                    r#"
                    INSERT INTO users (id, username, email, full_name, is_active, is_bot, created_at, updated_at)
                    VALUES (?, ?, ?, ?, 1, 0, ?, ?)
                    "#,
                )
                .bind(user_id.to_string())
                .bind(&identity.username)
                .bind(&identity.email)
                .bind(&identity.full_name)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                let inserted = sqlx::query(
                    r#"
                    INSERT INTO sso_user_mappings (provider_id, external_id, user_id, email, created_at, last_login_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT (provider_id, external_id) DO NOTHING
                    "#,
                )
                .bind(identity.provider_id)
                .bind(&identity.external_id)
                .bind(user_id.to_string())
                .bind(&identity.email)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                if inserted.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(None);
                }

                (user_id, true)
            }
        };

        if let Some(role) = identity.role {
            sqlx::query(
                r#"
                INSERT INTO organizations (id, slug, name, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (slug) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&identity.org_slug)
            .bind(&identity.org_slug)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let org_id: String = sqlx::query_scalar("SELECT id FROM organizations WHERE slug = ?")
                .bind(&identity.org_slug)
                .fetch_one(&mut *tx)
                .await?;

            sqlx::query(
                r#"
                INSERT INTO org_memberships (org_id, user_id, role, source, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (org_id, user_id) DO UPDATE SET
                    role = excluded.role,
                    source = excluded.source,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&org_id)
            .bind(user_id.to_string())
            .bind(role.to_string())
            .bind(MembershipSource::Sso.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let user = fetch_user(&self.pool, user_id)
            .await?
            .ok_or_else(|| DbError::Internal(format!("user {user_id} missing after commit")))?;

        Ok(Some(ProvisionOutcome { user, created }))
    }
}

#[async_trait]
impl SsoIdentityRepo for SqliteSsoIdentityRepo {
    async fn provision(&self, identity: ProvisionIdentity) -> DbResult<ProvisionOutcome> {
        for attempt in 1..=MAX_PROVISION_ATTEMPTS {
            match self.try_provision(&identity).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {
                    tracing::debug!(
                        provider_id = identity.provider_id,
                        attempt,
                        "Concurrent SSO login created the identity mapping first, retrying"
                    );
                }
                Err(DbError::Sqlx(sqlx::Error::Database(db_err))) if db_err.is_unique_violation() => {
                    tracing::debug!(
                        provider_id = identity.provider_id,
                        attempt,
                        "Unique violation during SSO provisioning, retrying"
                    );
                }
                Err(e) if is_busy(&e) => {
                    tracing::debug!(
                        provider_id = identity.provider_id,
                        attempt,
                        "Database busy during SSO provisioning, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(20 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(DbError::Conflict(format!(
            "could not provision identity for provider {} after {} attempts",
            identity.provider_id, MAX_PROVISION_ATTEMPTS
        )))
    }

    async fn get_mapping(
        &self,
        provider_id: i64,
        external_id: &str,
    ) -> DbResult<Option<SsoUserMapping>> {
        let row = sqlx::query(
            r#"
            SELECT provider_id, external_id, user_id, email, created_at, last_login_at
            FROM sso_user_mappings
            WHERE provider_id = ? AND external_id = ?
            "#,
        )
        .bind(provider_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SsoUserMapping {
                provider_id: row.get("provider_id"),
                external_id: row.get("external_id"),
                user_id: parse_uuid(&row.get::<String, _>("user_id"))?,
                email: row.get("email"),
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
                last_login_at: row.get::<DateTime<Utc>, _>("last_login_at"),
            })
        })
        .transpose()
    }
}
