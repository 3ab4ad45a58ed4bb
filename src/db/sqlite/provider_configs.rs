use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::ProviderConfigRepo,
    },
    models::{CreateProviderConfig, ProviderConfig, ProviderType, ProviderVendor, Role},
};

const SELECT_COLUMNS: &str = r#"
    SELECT id, name, provider_type, vendor, enabled, auto_provision, default_role,
           group_mappings, attribute_map, saml_config, oauth2_config, oidc_config,
           created_at, updated_at
    FROM sso_providers
"#;

pub struct SqliteProviderConfigRepo {
    pool: SqlitePool,
}

impl SqliteProviderConfigRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Parse a ProviderConfig from a database row.
    fn parse_config(row: &sqlx::sqlite::SqliteRow) -> DbResult<ProviderConfig> {
        let provider_type: ProviderType = row
            .get::<String, _>("provider_type")
            .parse()
            .map_err(DbError::Internal)?;
        let vendor: ProviderVendor = row
            .get::<String, _>("vendor")
            .parse()
            .unwrap_or_default();
        let default_role = row
            .get::<Option<String>, _>("default_role")
            .map(|s| s.parse::<Role>())
            .transpose()
            .map_err(DbError::Internal)?;

        Ok(ProviderConfig {
            id: row.get("id"),
            name: row.get("name"),
            provider_type,
            vendor,
            enabled: row.get::<i32, _>("enabled") != 0,
            auto_provision: row.get::<i32, _>("auto_provision") != 0,
            default_role,
            group_mappings: serde_json::from_str(&row.get::<String, _>("group_mappings"))?,
            attribute_map: serde_json::from_str(&row.get::<String, _>("attribute_map"))?,
            saml: parse_block(row.get("saml_config"))?,
            oauth2: parse_block(row.get("oauth2_config"))?,
            oidc: parse_block(row.get("oidc_config"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

fn parse_block<T: serde::de::DeserializeOwned>(json: Option<String>) -> DbResult<Option<T>> {
    json.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(DbError::from)
}

fn encode_block<T: serde::Serialize>(block: &Option<T>) -> DbResult<Option<String>> {
    block
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(DbError::from)
}

#[async_trait]
impl ProviderConfigRepo for SqliteProviderConfigRepo {
    async fn create(&self, input: CreateProviderConfig) -> DbResult<ProviderConfig> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO sso_providers (
                name, provider_type, vendor, enabled, auto_provision, default_role,
                group_mappings, attribute_map, saml_config, oauth2_config, oidc_config,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&input.name)
        .bind(input.provider_type.to_string())
        .bind(input.vendor.to_string())
        .bind(input.enabled as i32)
        .bind(input.auto_provision as i32)
        .bind(input.default_role.map(|r| r.to_string()))
        .bind(serde_json::to_string(&input.group_mappings)?)
        .bind(serde_json::to_string(&input.attribute_map)?)
        .bind(encode_block(&input.saml)?)
        .bind(encode_block(&input.oauth2)?)
        .bind(encode_block(&input.oidc)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => DbError::Conflict(
                format!("SSO provider '{}' already exists", input.name),
            ),
            _ => DbError::from(e),
        })?;

        Ok(ProviderConfig {
            id: result.last_insert_rowid(),
            created_at: now,
            updated_at: now,
            ..input.to_unsaved()
        })
    }

    async fn get_by_id(&self, id: i64) -> DbResult<Option<ProviderConfig>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_config).transpose()
    }

    async fn get_by_name(&self, name: &str) -> DbResult<Option<ProviderConfig>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_config).transpose()
    }

    async fn list(&self, enabled_only: bool) -> DbResult<Vec<ProviderConfig>> {
        let query = if enabled_only {
            format!("{SELECT_COLUMNS} WHERE enabled = 1 ORDER BY name")
        } else {
            format!("{SELECT_COLUMNS} ORDER BY name")
        };

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_config).collect()
    }

    async fn update(&self, config: &ProviderConfig) -> DbResult<ProviderConfig> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE sso_providers SET
                provider_type = ?,
                vendor = ?,
                enabled = ?,
                auto_provision = ?,
                default_role = ?,
                group_mappings = ?,
                attribute_map = ?,
                saml_config = ?,
                oauth2_config = ?,
                oidc_config = ?,
                updated_at = ?
            WHERE name = ?
            "#,
        )
        .bind(config.provider_type.to_string())
        .bind(config.vendor.to_string())
        .bind(config.enabled as i32)
        .bind(config.auto_provision as i32)
        .bind(config.default_role.map(|r| r.to_string()))
        .bind(serde_json::to_string(&config.group_mappings)?)
        .bind(serde_json::to_string(&config.attribute_map)?)
        .bind(encode_block(&config.saml)?)
        .bind(encode_block(&config.oauth2)?)
        .bind(encode_block(&config.oidc)?)
        .bind(now)
        .bind(&config.name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        self.get_by_name(&config.name)
            .await?
            .ok_or(DbError::NotFound)
    }

    async fn delete(&self, name: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM sso_providers WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
