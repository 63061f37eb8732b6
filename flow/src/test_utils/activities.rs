use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::activities::FlowActivities;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;
use crate::model::{FlowConnectionConfigs, RenameTablesInput, SyncFlowOptions, TableMapping};
use crate::test_utils::notify::TimedNotify;

/// Scripted behavior for one sync activity execution.
#[derive(Debug, Clone, Copy)]
pub enum SyncOutcome {
    /// Run until the orchestrator cancels, then return cleanly.
    RunUntilCancelled,
    /// Complete immediately, as when `number_of_syncs` is reached.
    Complete,
    /// Fail with the given error kind.
    Fail(ErrorKind),
    /// Panic inside the activity task.
    Panic,
}

#[derive(Debug, Default)]
struct Inner {
    sync_outcomes: VecDeque<SyncOutcome>,
    sync_calls: Vec<SyncFlowOptions>,
    publication_added: Vec<Vec<String>>,
    removals: Vec<(&'static str, Vec<String>)>,
    renames: Vec<RenameTablesInput>,
}

/// Activity surface that records every call and scripts sync outcomes.
///
/// The default sync behavior is [`SyncOutcome::RunUntilCancelled`]; queue
/// other outcomes with [`RecordingActivities::push_sync_outcome`].
#[derive(Clone, Default)]
pub struct RecordingActivities {
    inner: Arc<Mutex<Inner>>,
    sync_started: Arc<Notify>,
    rename_done: Arc<Notify>,
}

impl RecordingActivities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome for the next sync activity execution.
    pub fn push_sync_outcome(&self, outcome: SyncOutcome) {
        self.inner.lock().unwrap().sync_outcomes.push_back(outcome);
    }

    /// Notifies on the next sync activity start.
    pub fn notify_on_sync_start(&self) -> TimedNotify {
        TimedNotify::new(self.sync_started.clone())
    }

    /// Notifies on the next completed rename activity.
    pub fn notify_on_rename(&self) -> TimedNotify {
        TimedNotify::new(self.rename_done.clone())
    }

    /// Returns the options every sync execution was started with.
    pub fn sync_calls(&self) -> Vec<SyncFlowOptions> {
        self.inner.lock().unwrap().sync_calls.clone()
    }

    /// Returns the source identifiers of every publication-add call.
    pub fn publication_added(&self) -> Vec<Vec<String>> {
        self.inner.lock().unwrap().publication_added.clone()
    }

    /// Returns the removal activities in invocation order, with the source
    /// identifiers each one received.
    pub fn removals(&self) -> Vec<(&'static str, Vec<String>)> {
        self.inner.lock().unwrap().removals.clone()
    }

    /// Returns every rename input received.
    pub fn renames(&self) -> Vec<RenameTablesInput> {
        self.inner.lock().unwrap().renames.clone()
    }

    fn record_removal(&self, activity: &'static str, tables: &[TableMapping]) {
        self.inner
            .lock()
            .unwrap()
            .removals
            .push((activity, source_identifiers(tables)));
    }
}

fn source_identifiers(tables: &[TableMapping]) -> Vec<String> {
    tables
        .iter()
        .map(|mapping| mapping.source_table_identifier.clone())
        .collect()
}

impl FlowActivities for RecordingActivities {
    async fn sync_flow(
        &self,
        _cfg: FlowConnectionConfigs,
        options: SyncFlowOptions,
        cancel_rx: ShutdownRx,
    ) -> FlowResult<()> {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            inner.sync_calls.push(options);
            inner
                .sync_outcomes
                .pop_front()
                .unwrap_or(SyncOutcome::RunUntilCancelled)
        };
        self.sync_started.notify_one();

        match outcome {
            SyncOutcome::RunUntilCancelled => {
                cancel_rx.wait_for_shutdown().await;
                Ok(())
            }
            SyncOutcome::Complete => Ok(()),
            SyncOutcome::Fail(kind) => Err(flow_error!(kind, "scripted sync failure")),
            SyncOutcome::Panic => panic!("scripted sync panic"),
        }
    }

    async fn add_tables_to_publication(
        &self,
        _cfg: &FlowConnectionConfigs,
        tables: &[TableMapping],
    ) -> FlowResult<()> {
        self.inner
            .lock()
            .unwrap()
            .publication_added
            .push(source_identifiers(tables));
        Ok(())
    }

    async fn remove_tables_from_publication(
        &self,
        _cfg: &FlowConnectionConfigs,
        tables: &[TableMapping],
    ) -> FlowResult<()> {
        self.record_removal("publication", tables);
        Ok(())
    }

    async fn remove_tables_from_raw_table(
        &self,
        _cfg: &FlowConnectionConfigs,
        tables: &[TableMapping],
    ) -> FlowResult<()> {
        self.record_removal("raw_table", tables);
        Ok(())
    }

    async fn remove_tables_from_catalog(
        &self,
        _cfg: &FlowConnectionConfigs,
        tables: &[TableMapping],
    ) -> FlowResult<()> {
        self.record_removal("catalog", tables);
        Ok(())
    }

    async fn rename_tables(&self, input: RenameTablesInput) -> FlowResult<()> {
        self.inner.lock().unwrap().renames.push(input);
        self.rename_done.notify_one();
        Ok(())
    }
}
