use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::common::parse_uuid;
use crate::{
    db::{error::DbResult, repos::SsoSessionRepo},
    models::SsoSession,
};

pub struct SqliteSsoSessionRepo {
    pool: SqlitePool,
}

impl SqliteSsoSessionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SsoSessionRepo for SqliteSsoSessionRepo {
    async fn create(&self, session: &SsoSession) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sso_sessions (id, provider_id, user_id, external_id, session_index, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(session.provider_id)
        .bind(session.user_id.to_string())
        .bind(&session.external_id)
        .bind(&session.session_index)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_active(&self, id: &str, now: DateTime<Utc>) -> DbResult<Option<SsoSession>> {
        let row = sqlx::query(
            r#"
            SELECT id, provider_id, user_id, external_id, session_index, created_at, expires_at
            FROM sso_sessions
            WHERE id = ? AND expires_at > ?
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SsoSession {
                id: row.get("id"),
                provider_id: row.get("provider_id"),
                user_id: parse_uuid(&row.get::<String, _>("user_id"))?,
                external_id: row.get("external_id"),
                session_index: row.get("session_index"),
                created_at: row.get("created_at"),
                expires_at: row.get("expires_at"),
            })
        })
        .transpose()
    }

    async fn delete(&self, id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM sso_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM sso_sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
