use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::catalog::base::{Catalog, MirrorRow};
use crate::error::FlowResult;
use crate::model::{FlowConnectionConfigs, FlowStatus};

#[derive(Debug, Default)]
struct Inner {
    configs: HashMap<String, FlowConnectionConfigs>,
    statuses: HashMap<String, FlowStatus>,
    tags: HashMap<String, serde_json::Value>,
    avro_stages: HashMap<(String, i64), serde_json::Value>,
    /// Every status write, in order, across all mirrors.
    status_history: Vec<(String, FlowStatus)>,
}

/// In-memory catalog for tests and local runs.
///
/// Records the full status history so tests can assert that every
/// transition reached the catalog, and in which order.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded status writes for one workflow id, in write
    /// order.
    pub fn status_history(&self, workflow_id: &str) -> Vec<FlowStatus> {
        self.inner
            .lock()
            .unwrap()
            .status_history
            .iter()
            .filter(|(id, _)| id == workflow_id)
            .map(|(_, status)| *status)
            .collect()
    }

    /// Returns the latest recorded status for one workflow id.
    pub fn current_status(&self, workflow_id: &str) -> Option<FlowStatus> {
        self.inner.lock().unwrap().statuses.get(workflow_id).copied()
    }
}

impl Catalog for MemoryCatalog {
    async fn update_flow_status(&self, workflow_id: &str, status: FlowStatus) -> FlowResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.statuses.insert(workflow_id.to_string(), status);
        inner.status_history.push((workflow_id.to_string(), status));
        Ok(())
    }

    async fn update_flow_config(&self, cfg: &FlowConnectionConfigs) -> FlowResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.configs.insert(cfg.flow_job_name.clone(), cfg.clone());
        Ok(())
    }

    async fn get_flow_config(
        &self,
        flow_job_name: &str,
    ) -> FlowResult<Option<FlowConnectionConfigs>> {
        Ok(self.inner.lock().unwrap().configs.get(flow_job_name).cloned())
    }

    async fn list_mirrors(&self) -> FlowResult<Vec<MirrorRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .configs
            .keys()
            .map(|flow_name| MirrorRow {
                flow_name: flow_name.clone(),
                workflow_id: flow_name.clone(),
                status: inner
                    .statuses
                    .get(flow_name)
                    .copied()
                    .unwrap_or_default()
                    .as_str()
                    .to_string(),
                created_at: Utc::now(),
            })
            .collect())
    }

    async fn get_flow_tags(&self, flow_job_name: &str) -> FlowResult<Option<serde_json::Value>> {
        Ok(self.inner.lock().unwrap().tags.get(flow_job_name).cloned())
    }

    async fn post_flow_tags(
        &self,
        flow_job_name: &str,
        tags: serde_json::Value,
    ) -> FlowResult<()> {
        self.inner
            .lock()
            .unwrap()
            .tags
            .insert(flow_job_name.to_string(), tags);
        Ok(())
    }

    async fn set_avro_stage(
        &self,
        flow_job_name: &str,
        sync_batch_id: i64,
        avro_file: serde_json::Value,
    ) -> FlowResult<()> {
        self.inner
            .lock()
            .unwrap()
            .avro_stages
            .insert((flow_job_name.to_string(), sync_batch_id), avro_file);
        Ok(())
    }

    async fn get_avro_stage(
        &self,
        flow_job_name: &str,
        sync_batch_id: i64,
    ) -> FlowResult<Option<serde_json::Value>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .avro_stages
            .get(&(flow_job_name.to_string(), sync_batch_id))
            .cloned())
    }
}
