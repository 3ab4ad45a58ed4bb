use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::common::parse_uuid;
use crate::{
    db::{
        error::{DbError, DbResult},
        repos::UserRepo,
    },
    models::{OrgMembership, User},
};

/// Load a user by id. Shared with the provisioning repo, which re-reads the
/// user after committing.
pub(super) async fn fetch_user(pool: &SqlitePool, id: Uuid) -> DbResult<Option<User>> {
    let row = sqlx::query(
        r#"
        SELECT id, username, email, full_name, is_active, is_bot, created_at, updated_at
        FROM users
        WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        Ok(User {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            username: row.get("username"),
            email: row.get("email"),
            full_name: row.get("full_name"),
            is_active: row.get::<i32, _>("is_active") != 0,
            is_bot: row.get::<i32, _>("is_bot") != 0,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    })
    .transpose()
}

pub struct SqliteUserRepo {
    pool: SqlitePool,
}

impl SqliteUserRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepo for SqliteUserRepo {
    async fn get_by_id(&self, id: Uuid) -> DbResult<Option<User>> {
        fetch_user(&self.pool, id).await
    }

    async fn get_membership(
        &self,
        user_id: Uuid,
        org_slug: &str,
    ) -> DbResult<Option<OrgMembership>> {
        let row = sqlx::query(
            r#"
            SELECT m.org_id, o.slug, m.user_id, m.role, m.source, m.updated_at
            FROM org_memberships m
            JOIN organizations o ON o.id = m.org_id
            WHERE m.user_id = ? AND o.slug = ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(org_slug)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(OrgMembership {
                org_id: parse_uuid(&row.get::<String, _>("org_id"))?,
                org_slug: row.get("slug"),
                user_id: parse_uuid(&row.get::<String, _>("user_id"))?,
                role: row
                    .get::<String, _>("role")
                    .parse()
                    .map_err(DbError::Internal)?,
                source: row
                    .get::<String, _>("source")
                    .parse()
                    .map_err(DbError::Internal)?,
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }
}
