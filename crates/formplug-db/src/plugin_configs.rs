//! PostgreSQL plugin configuration repository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use formplug_core::{
    new_v7, CreatePluginConfigRequest, Error, PluginConfig, PluginConfigRepository, Result,
};

/// PostgreSQL implementation of PluginConfigRepository.
#[derive(Clone)]
pub struct PgPluginConfigRepository {
    pool: Pool<Postgres>,
}

impl PgPluginConfigRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> PluginConfig {
        PluginConfig {
            id: row.get("id"),
            form_id: row.get("form_id"),
            plugin_id: row.get("plugin_id"),
            enabled: row.get("enabled"),
            config: row.get("config"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl PluginConfigRepository for PgPluginConfigRepository {
    async fn get(&self, id: Uuid) -> Result<Option<PluginConfig>> {
        let row = sqlx::query(
            "SELECT id, form_id, plugin_id, enabled, config, created_at, updated_at
             FROM plugin_config WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_row))
    }

    async fn create(&self, req: CreatePluginConfigRequest) -> Result<PluginConfig> {
        let now = Utc::now();
        let config = if req.config.is_null() {
            serde_json::json!({})
        } else {
            req.config
        };

        let row = sqlx::query(
            "INSERT INTO plugin_config (id, form_id, plugin_id, enabled, config, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             RETURNING id, form_id, plugin_id, enabled, config, created_at, updated_at",
        )
        .bind(new_v7())
        .bind(req.form_id)
        .bind(&req.plugin_id)
        .bind(req.enabled)
        .bind(&config)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(Self::parse_row(row))
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE plugin_config SET enabled = $1, updated_at = now() WHERE id = $2",
        )
        .bind(enabled)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("plugin config {id}")));
        }
        Ok(())
    }
}
