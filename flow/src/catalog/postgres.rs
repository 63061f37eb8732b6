use chrono::{DateTime, Utc};
use flow_config::shared::PgConnectionConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::catalog::base::{Catalog, MirrorRow};
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::model::{FlowConnectionConfigs, FlowStatus};

/// Catalog access is low-volume metadata traffic, a small pool suffices.
const NUM_POOL_CONNECTIONS: u32 = 2;

/// Catalog backed by the Postgres `flows` and `ch_s3_stage` tables.
#[derive(Debug, Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
}

impl PostgresCatalog {
    /// Connects to the catalog database.
    pub async fn connect(config: &PgConnectionConfig) -> FlowResult<Self> {
        config.validate().map_err(|err| {
            FlowError::new(ErrorKind::InvalidFlowConfig, "invalid catalog connection config")
                .with_source(err)
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(NUM_POOL_CONNECTIONS)
            .connect_with(config.with_db())
            .await
            .map_err(|err| read_error("failed to connect to the catalog", err))?;

        Ok(Self { pool })
    }

    /// Wraps an existing pool, used when the caller manages connections.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies pending catalog schema migrations.
    pub async fn run_migrations(&self) -> FlowResult<()> {
        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| {
                FlowError::new(ErrorKind::CatalogWriteFailed, "failed to run catalog migrations")
                    .with_source(err)
            })
    }
}

impl Catalog for PostgresCatalog {
    async fn update_flow_status(&self, workflow_id: &str, status: FlowStatus) -> FlowResult<()> {
        sqlx::query("UPDATE flows SET status = $2 WHERE workflow_id = $1")
            .bind(workflow_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|err| write_error("failed to update flow status", err))?;

        debug!(workflow_id, status = %status, "flow status updated in catalog");
        Ok(())
    }

    async fn update_flow_config(&self, cfg: &FlowConnectionConfigs) -> FlowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flows (flow_name, workflow_id, status, config)
            VALUES ($1, $1, 'setup', $2)
            ON CONFLICT (flow_name)
            DO UPDATE SET config = EXCLUDED.config
            "#,
        )
        .bind(&cfg.flow_job_name)
        .bind(Json(cfg))
        .execute(&self.pool)
        .await
        .map_err(|err| write_error("failed to update flow config", err))?;

        debug!(flow_job_name = %cfg.flow_job_name, "flow config updated in catalog");
        Ok(())
    }

    async fn get_flow_config(
        &self,
        flow_job_name: &str,
    ) -> FlowResult<Option<FlowConnectionConfigs>> {
        let config: Option<Json<FlowConnectionConfigs>> =
            sqlx::query_scalar("SELECT config FROM flows WHERE flow_name = $1")
                .bind(flow_job_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| read_error("failed to read flow config", err))?;

        Ok(config.map(|json| json.0))
    }

    async fn list_mirrors(&self) -> FlowResult<Vec<MirrorRow>> {
        let rows = sqlx::query(
            "SELECT flow_name, workflow_id, status, created_at FROM flows ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| read_error("failed to list mirrors", err))?;

        rows.into_iter()
            .map(|row| {
                Ok(MirrorRow {
                    flow_name: row
                        .try_get("flow_name")
                        .map_err(|err| read_error("failed to decode mirror row", err))?,
                    workflow_id: row
                        .try_get("workflow_id")
                        .map_err(|err| read_error("failed to decode mirror row", err))?,
                    status: row
                        .try_get("status")
                        .map_err(|err| read_error("failed to decode mirror row", err))?,
                    created_at: row
                        .try_get::<DateTime<Utc>, _>("created_at")
                        .map_err(|err| read_error("failed to decode mirror row", err))?,
                })
            })
            .collect()
    }

    async fn get_flow_tags(&self, flow_job_name: &str) -> FlowResult<Option<serde_json::Value>> {
        let tags: Option<Option<serde_json::Value>> =
            sqlx::query_scalar("SELECT tags FROM flows WHERE flow_name = $1")
                .bind(flow_job_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| read_error("failed to read flow tags", err))?;

        Ok(tags.flatten())
    }

    async fn post_flow_tags(
        &self,
        flow_job_name: &str,
        tags: serde_json::Value,
    ) -> FlowResult<()> {
        sqlx::query("UPDATE flows SET tags = $2 WHERE flow_name = $1")
            .bind(flow_job_name)
            .bind(Json(tags))
            .execute(&self.pool)
            .await
            .map_err(|err| write_error("failed to write flow tags", err))?;

        Ok(())
    }

    async fn set_avro_stage(
        &self,
        flow_job_name: &str,
        sync_batch_id: i64,
        avro_file: serde_json::Value,
    ) -> FlowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ch_s3_stage (flow_job_name, sync_batch_id, avro_file)
            VALUES ($1, $2, $3)
            ON CONFLICT (flow_job_name, sync_batch_id)
            DO UPDATE SET avro_file = EXCLUDED.avro_file, created_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(flow_job_name)
        .bind(sync_batch_id)
        .bind(Json(avro_file))
        .execute(&self.pool)
        .await
        .map_err(|err| write_error("failed to set avro stage", err))?;

        Ok(())
    }

    async fn get_avro_stage(
        &self,
        flow_job_name: &str,
        sync_batch_id: i64,
    ) -> FlowResult<Option<serde_json::Value>> {
        let avro_file: Option<Json<serde_json::Value>> = sqlx::query_scalar(
            "SELECT avro_file FROM ch_s3_stage WHERE flow_job_name = $1 AND sync_batch_id = $2",
        )
        .bind(flow_job_name)
        .bind(sync_batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| read_error("failed to get avro stage", err))?;

        Ok(avro_file.map(|json| json.0))
    }
}

fn read_error(description: &'static str, err: sqlx::Error) -> FlowError {
    FlowError::new(ErrorKind::CatalogReadFailed, description).with_source(err)
}

fn write_error(description: &'static str, err: sqlx::Error) -> FlowError {
    FlowError::new(ErrorKind::CatalogWriteFailed, description).with_source(err)
}
