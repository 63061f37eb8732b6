use crate::catalog::MemoryCatalog;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::FlowResult;
use crate::model::{FlowConnectionConfigs, TableMapping};
use crate::test_utils::activities::RecordingActivities;
use crate::test_utils::children::StubChildFlows;
use crate::workers::{CdcFlowWorker, CdcFlowWorkerHandle, Worker};

/// The fixture around one orchestrator under test.
pub struct TestFlow {
    pub catalog: MemoryCatalog,
    pub activities: RecordingActivities,
    pub children: StubChildFlows,
    pub shutdown_tx: ShutdownTx,
}

impl TestFlow {
    pub fn new() -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();
        Self {
            catalog: MemoryCatalog::new(),
            activities: RecordingActivities::new(),
            children: StubChildFlows::new(),
            shutdown_tx,
        }
    }

    /// Starts an orchestrator for `cfg` against the recording fakes.
    pub async fn start(&self, cfg: FlowConnectionConfigs) -> FlowResult<CdcFlowWorkerHandle> {
        CdcFlowWorker::new(
            self.catalog.clone(),
            self.activities.clone(),
            self.children.clone(),
            cfg,
            None,
            self.shutdown_tx.subscribe(),
        )
        .start()
        .await
    }
}

impl Default for TestFlow {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal mirror config for tests, with an initial snapshot and
/// continuous sync.
pub fn test_flow_config(flow_job_name: &str, mappings: &[(&str, &str)]) -> FlowConnectionConfigs {
    FlowConnectionConfigs {
        flow_job_name: flow_job_name.to_string(),
        source_name: "source_pg".to_string(),
        destination_name: "dest_ch".to_string(),
        table_mappings: mappings
            .iter()
            .map(|(source, destination)| TableMapping::new(*source, *destination))
            .collect(),
        max_batch_size: 100_000,
        idle_timeout_seconds: 60,
        publication_name: format!("{flow_job_name}_publication"),
        replication_slot_name: format!("{flow_job_name}_slot"),
        do_initial_snapshot: true,
        initial_snapshot_only: false,
        resync: false,
        soft_delete_col_name: "_peerdb_is_deleted".to_string(),
        synced_at_col_name: "_peerdb_synced_at".to_string(),
        snapshot_num_rows_per_partition: 250_000,
        snapshot_max_parallel_workers: 1,
        snapshot_num_tables_in_parallel: 1,
        ..Default::default()
    }
}
