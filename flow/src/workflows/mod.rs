//! Workflow surfaces: the CDC flow orchestrator and the child workflows it
//! coordinates.

mod cdc_flow;

pub use cdc_flow::CdcFlowWorkflow;

use std::future::Future;

use uuid::Uuid;

use crate::error::FlowResult;
use crate::model::{DropFlowInput, FlowConnectionConfigs, SetupFlowOutput};

/// Child workflows driven by the orchestrator.
///
/// Setup and drop are idempotent: setup establishes the source replication
/// slot and publication and creates destination tables; drop tears them
/// down. Snapshot performs the initial bulk copy honoring the parallelism
/// knobs in the configuration.
pub trait ChildFlows: Clone + Send + Sync + 'static {
    /// Establishes replication on the source and creates destination
    /// tables; returns the source table id to name mapping.
    fn setup_flow(
        &self,
        cfg: FlowConnectionConfigs,
    ) -> impl Future<Output = FlowResult<SetupFlowOutput>> + Send;

    /// Bulk-copies current table contents prior to CDC.
    fn snapshot_flow(
        &self,
        cfg: FlowConnectionConfigs,
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Tears the mirror down. When `input.resync` is set the caller
    /// re-enters the CDC flow with a fresh initial snapshot afterwards.
    fn drop_flow(&self, input: DropFlowInput) -> impl Future<Output = FlowResult<()>> + Send;
}

/// Derives a run identifier for a child workflow.
pub fn child_workflow_id(prefix: &str, flow_job_name: &str) -> String {
    format!("{prefix}-{flow_job_name}-{}", Uuid::new_v4())
}
