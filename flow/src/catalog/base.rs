use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::FlowResult;
use crate::model::{FlowConnectionConfigs, FlowStatus};

/// One mirror as listed by the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRow {
    pub flow_name: String,
    pub workflow_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent store for flow configuration and status.
///
/// Implementations must be cheap to clone and safe under concurrent access;
/// all writes are idempotent upserts keyed by the flow job name.
pub trait Catalog: Clone + Send + Sync + 'static {
    /// Records the current status of a mirror, keyed by workflow id.
    ///
    /// Keying by workflow id keeps status writes of child flows (which run
    /// under derived ids) away from the parent mirror's row.
    fn update_flow_status(
        &self,
        workflow_id: &str,
        status: FlowStatus,
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Persists the current connection configuration of a mirror.
    fn update_flow_config(
        &self,
        cfg: &FlowConnectionConfigs,
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Returns the stored configuration for a mirror, if any.
    fn get_flow_config(
        &self,
        flow_job_name: &str,
    ) -> impl Future<Output = FlowResult<Option<FlowConnectionConfigs>>> + Send;

    /// Lists all mirrors known to the catalog.
    fn list_mirrors(&self) -> impl Future<Output = FlowResult<Vec<MirrorRow>>> + Send;

    /// Returns the tags document attached to a mirror.
    fn get_flow_tags(
        &self,
        flow_job_name: &str,
    ) -> impl Future<Output = FlowResult<Option<serde_json::Value>>> + Send;

    /// Replaces the tags document attached to a mirror.
    fn post_flow_tags(
        &self,
        flow_job_name: &str,
        tags: serde_json::Value,
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Upserts the staged-file document for one sync batch.
    ///
    /// `avro_file` is opaque to the orchestrator; the destination connector
    /// owns its shape.
    fn set_avro_stage(
        &self,
        flow_job_name: &str,
        sync_batch_id: i64,
        avro_file: serde_json::Value,
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Returns the staged-file document for one sync batch.
    fn get_avro_stage(
        &self,
        flow_job_name: &str,
        sync_batch_id: i64,
    ) -> impl Future<Output = FlowResult<Option<serde_json::Value>>> + Send;
}
