use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::FlowResult;
use crate::model::{DropFlowInput, FlowConnectionConfigs, SetupFlowOutput};
use crate::test_utils::notify::TimedNotify;
use crate::workflows::ChildFlows;

#[derive(Debug, Default)]
struct Inner {
    setup_calls: Vec<FlowConnectionConfigs>,
    snapshot_calls: Vec<FlowConnectionConfigs>,
    drop_calls: Vec<DropFlowInput>,
    next_table_id: u32,
    hold_setup: bool,
}

/// Child-workflow surface that records every invocation.
///
/// Setup assigns globally increasing source table ids, shared across
/// clones, the way relation ids stay unique on one source database even
/// when an add-tables child runs its own setup.
#[derive(Clone, Default)]
pub struct StubChildFlows {
    inner: Arc<Mutex<Inner>>,
    setup_started: Arc<Notify>,
    setup_release: Arc<Notify>,
    setup_done: Arc<Notify>,
    drop_done: Arc<Notify>,
}

impl StubChildFlows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent setup flows block until [`StubChildFlows::release_setup`].
    pub fn hold_setup(&self) {
        self.inner.lock().unwrap().hold_setup = true;
    }

    /// Releases one held setup flow.
    pub fn release_setup(&self) {
        self.setup_release.notify_one();
    }

    /// Notifies on the next started setup flow.
    pub fn notify_on_setup_start(&self) -> TimedNotify {
        TimedNotify::new(self.setup_started.clone())
    }

    /// Notifies on the next completed setup flow.
    pub fn notify_on_setup(&self) -> TimedNotify {
        TimedNotify::new(self.setup_done.clone())
    }

    /// Notifies on the next completed drop flow.
    pub fn notify_on_drop(&self) -> TimedNotify {
        TimedNotify::new(self.drop_done.clone())
    }

    /// Returns the configs every setup flow was started with.
    pub fn setup_calls(&self) -> Vec<FlowConnectionConfigs> {
        self.inner.lock().unwrap().setup_calls.clone()
    }

    /// Returns the configs every snapshot flow was started with.
    pub fn snapshot_calls(&self) -> Vec<FlowConnectionConfigs> {
        self.inner.lock().unwrap().snapshot_calls.clone()
    }

    /// Returns the drop inputs received, in order.
    pub fn drop_calls(&self) -> Vec<DropFlowInput> {
        self.inner.lock().unwrap().drop_calls.clone()
    }
}

impl ChildFlows for StubChildFlows {
    async fn setup_flow(&self, cfg: FlowConnectionConfigs) -> FlowResult<SetupFlowOutput> {
        let hold = {
            let mut inner = self.inner.lock().unwrap();
            inner.setup_calls.push(cfg.clone());
            inner.hold_setup
        };
        self.setup_started.notify_one();
        if hold {
            self.setup_release.notified().await;
        }

        let mut inner = self.inner.lock().unwrap();
        let mut output = SetupFlowOutput::default();
        for mapping in &cfg.table_mappings {
            inner.next_table_id += 1;
            output
                .src_table_id_name_mapping
                .insert(inner.next_table_id, mapping.source_table_identifier.clone());
        }
        drop(inner);

        self.setup_done.notify_one();
        Ok(output)
    }

    async fn snapshot_flow(&self, cfg: FlowConnectionConfigs) -> FlowResult<()> {
        self.inner.lock().unwrap().snapshot_calls.push(cfg);
        Ok(())
    }

    async fn drop_flow(&self, input: DropFlowInput) -> FlowResult<()> {
        self.inner.lock().unwrap().drop_calls.push(input);
        self.drop_done.notify_one();
        Ok(())
    }
}
