use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::catalog::{Catalog, MemoryCatalog, MirrorRow};
use crate::error::FlowResult;
use crate::model::{FlowConnectionConfigs, FlowStatus};
use crate::test_utils::notify::TimedNotify;

/// Catalog wrapper that can hold status writes in flight.
///
/// An in-memory catalog writes instantaneously, which hides the window
/// between a status transition being persisted and it becoming
/// observable. This wrapper opens that window on demand so tests can
/// assert the catalog write happens first.
#[derive(Clone)]
pub struct GatedCatalog {
    inner: MemoryCatalog,
    hold_status_writes: Arc<AtomicBool>,
    write_started: Arc<Notify>,
    release: Arc<Notify>,
}

impl GatedCatalog {
    pub fn wrap(inner: MemoryCatalog) -> Self {
        Self {
            inner,
            hold_status_writes: Arc::new(AtomicBool::new(false)),
            write_started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    /// Makes subsequent status writes block until released.
    pub fn hold_status_writes(&self) {
        self.hold_status_writes.store(true, Ordering::SeqCst);
    }

    /// Releases exactly one held status write.
    pub fn release_status_write(&self) {
        self.release.notify_one();
    }

    /// Lets the currently held and all future status writes proceed.
    pub fn release_all_status_writes(&self) {
        self.hold_status_writes.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    /// Notifies when a held status write has started and is in flight.
    pub fn notify_on_status_write_start(&self) -> TimedNotify {
        TimedNotify::new(self.write_started.clone())
    }
}

impl Catalog for GatedCatalog {
    async fn update_flow_status(&self, workflow_id: &str, status: FlowStatus) -> FlowResult<()> {
        if self.hold_status_writes.load(Ordering::SeqCst) {
            self.write_started.notify_one();
            self.release.notified().await;
        }
        self.inner.update_flow_status(workflow_id, status).await
    }

    async fn update_flow_config(&self, cfg: &FlowConnectionConfigs) -> FlowResult<()> {
        self.inner.update_flow_config(cfg).await
    }

    async fn get_flow_config(
        &self,
        flow_job_name: &str,
    ) -> FlowResult<Option<FlowConnectionConfigs>> {
        self.inner.get_flow_config(flow_job_name).await
    }

    async fn list_mirrors(&self) -> FlowResult<Vec<MirrorRow>> {
        self.inner.list_mirrors().await
    }

    async fn get_flow_tags(&self, flow_job_name: &str) -> FlowResult<Option<serde_json::Value>> {
        self.inner.get_flow_tags(flow_job_name).await
    }

    async fn post_flow_tags(
        &self,
        flow_job_name: &str,
        tags: serde_json::Value,
    ) -> FlowResult<()> {
        self.inner.post_flow_tags(flow_job_name, tags).await
    }

    async fn set_avro_stage(
        &self,
        flow_job_name: &str,
        sync_batch_id: i64,
        avro_file: serde_json::Value,
    ) -> FlowResult<()> {
        self.inner
            .set_avro_stage(flow_job_name, sync_batch_id, avro_file)
            .await
    }

    async fn get_avro_stage(
        &self,
        flow_job_name: &str,
        sync_batch_id: i64,
    ) -> FlowResult<Option<serde_json::Value>> {
        self.inner.get_avro_stage(flow_job_name, sync_batch_id).await
    }
}
