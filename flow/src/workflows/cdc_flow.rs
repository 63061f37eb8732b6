//! The CDC flow state machine.
//!
//! One orchestrator owns one mirror. A pass of the state machine runs until
//! it either finishes, hands over to the drop flow, or asks to be
//! re-entered with the carried `(config, state)` pair; the driver loop in
//! [`CdcFlowWorkflow::run`] performs the re-entry so no pass accumulates
//! unbounded local history.
//!
//! Signals can arrive at any time. Every blocking section is a selector
//! over the signal bus, the shutdown channel, and whatever child task or
//! sleep is in flight, and pending deliveries are drained before a pass
//! acts on its exit condition, so a terminate observed together with a sync
//! completion is still honored.

use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Sleep, sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::activities::{
    CONFIG_UPLOAD_TIMEOUT, FlowActivities, PUBLICATION_ALTER_TIMEOUT, RENAME_TABLES_TIMEOUT,
    STATUS_UPDATE_TIMEOUT, SYNC_FLOW_TIMEOUT, TABLE_REMOVAL_MAX_ATTEMPTS,
    TABLE_REMOVAL_RETRY_INITIAL, run_with_retries,
};
use crate::catalog::Catalog;
use crate::concurrency::shutdown::{ShutdownRx, create_shutdown_channel};
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::model::{
    ActiveSignal, CdcFlowState, DropFlowInput, FlowConfigUpdate, FlowConnectionConfigs,
    FlowSignal, FlowStateChangeRequest, FlowStatus, RESYNC_TABLE_SUFFIX, RenameTableOption,
    RenameTablesInput, SetupFlowOutput, TableEngine, TableMapping,
    additional_tables_has_overlap, flow_signal_handler,
};
use crate::signals::{FlowSignalHub, MaintenancePhase, create_signal_hub};
use crate::workflows::{ChildFlows, child_workflow_id};
use crate::{bail, flow_error};

/// How an orchestrator pass ended.
enum Transition {
    /// Re-enter the state machine with the carried config and state.
    ContinueAsNew,
    /// Hand over to the drop flow.
    Drop(DropFlowInput),
    /// The mirror reached a terminal status.
    Finished,
}

/// Outcome of supervising a child task against the signal bus.
enum ChildOutcome<T> {
    Completed(T),
    Drop(DropFlowInput),
}

/// Event produced by one selector step while supervising a child task.
enum ChildEvent<T> {
    Finished(Result<FlowResult<T>, JoinError>),
    StateChange(FlowStateChangeRequest),
    Shutdown,
}

/// Event produced by one selector step of the main loop.
enum MainEvent {
    Shutdown,
    SyncFinished(Result<FlowResult<()>, JoinError>),
    BackoffElapsed,
    Signal(FlowSignal),
    StateChange(FlowStateChangeRequest),
    Properties(FlowConfigUpdate),
}

/// Event produced by one selector step of the pause loop.
enum PauseEvent {
    Shutdown,
    Signal(FlowSignal),
    StateChange(FlowStateChangeRequest),
    Properties(FlowConfigUpdate),
}

/// Where a state-change request was observed; resync preparation differs
/// per site.
#[derive(Clone, Copy)]
enum StateChangeContext<'a> {
    /// Pause loop or main loop: the merged config is snapshotted as-is.
    PauseOrMain,
    /// Setup/snapshot phase: a resync during a resync must upload the
    /// original table mappings, not the suffixed shadow mappings.
    Setup {
        original_table_mappings: &'a [TableMapping],
    },
    /// Add-tables subflow: the additional tables join the live mappings
    /// before the config is snapshotted, so they are resynced too.
    TableAdditions {
        additional_tables: &'a [TableMapping],
    },
}

/// The durable CDC flow orchestrator for one mirror.
///
/// Generic over its three seams: the catalog, the activity surface, and
/// the child workflows. All three are cloned into spawned tasks, so they
/// must be cheap handles.
pub struct CdcFlowWorkflow<C, A, W> {
    catalog: C,
    activities: A,
    children: W,
    shutdown_rx: ShutdownRx,
    signals: FlowSignalHub,
    maintenance_rx: Option<watch::Receiver<MaintenancePhase>>,
    /// Catalog key for status writes; defaults to the flow job name, child
    /// flows run under a derived id so their writes stay off the parent's
    /// row.
    workflow_id: String,
}

impl<C, A, W> CdcFlowWorkflow<C, A, W>
where
    C: Catalog,
    A: FlowActivities,
    W: ChildFlows,
{
    pub fn new(
        catalog: C,
        activities: A,
        children: W,
        shutdown_rx: ShutdownRx,
        signals: FlowSignalHub,
    ) -> Self {
        Self {
            catalog,
            activities,
            children,
            shutdown_rx,
            signals,
            maintenance_rx: None,
            workflow_id: String::new(),
        }
    }

    /// Attaches the global maintenance phase channel. While maintenance is
    /// enabled the main loop rotates its pass at the next selector step.
    pub fn with_maintenance_rx(mut self, rx: watch::Receiver<MaintenancePhase>) -> Self {
        self.maintenance_rx = Some(rx);
        self
    }

    /// Overrides the workflow id used for catalog status writes.
    pub fn with_workflow_id(mut self, workflow_id: String) -> Self {
        self.workflow_id = workflow_id;
        self
    }

    /// Runs the mirror to a terminal status.
    ///
    /// `state` is `None` on first entry and the carried checkpoint on
    /// re-entry after a restart.
    pub async fn run(
        mut self,
        mut cfg: FlowConnectionConfigs,
        state: Option<CdcFlowState>,
    ) -> FlowResult<CdcFlowState> {
        if cfg.flow_job_name.is_empty() {
            bail!(ErrorKind::InvalidFlowConfig, "flow job name must not be empty");
        }
        if self.workflow_id.is_empty() {
            self.workflow_id = cfg.flow_job_name.clone();
        }

        let mut state = match state {
            Some(state) => state,
            None => {
                let state = CdcFlowState::new(&cfg);
                self.mirror_status_to_catalog(state.current_flow_status).await;
                state
            }
        };

        loop {
            self.publish_state(&state);
            let _ = self.signals.status_tx.send(state.current_flow_status);

            let transition = match self.run_pass(&mut cfg, &mut state).await {
                Ok(transition) => transition,
                Err(err) => {
                    // Cancellation is a clean termination intent: the
                    // terminal status is written before the error surfaces.
                    if err.kind() == ErrorKind::FlowCancelled
                        && state.current_flow_status != FlowStatus::Terminated
                    {
                        self.update_status(&mut state, FlowStatus::Terminated)
                            .await;
                    }
                    self.publish_state(&state);
                    return Err(err);
                }
            };

            match transition {
                Transition::ContinueAsNew => continue,
                Transition::Finished => {
                    self.publish_state(&state);
                    return Ok(state);
                }
                Transition::Drop(input) => {
                    self.update_status(&mut state, FlowStatus::Terminating)
                        .await;
                    info!(resync = input.resync, "continuing as drop flow");

                    if let Err(err) = self.children.drop_flow(input.clone()).await {
                        error!(error = %err, "drop flow failed");
                        return Err(FlowError::new(
                            ErrorKind::DropFlowFailed,
                            "failed to execute drop flow",
                        )
                        .with_source(err));
                    }

                    if input.resync {
                        let Some(resync_cfg) = input.flow_connection_configs else {
                            bail!(
                                ErrorKind::InvalidState,
                                "resync drop input is missing connection configs"
                            );
                        };
                        cfg = resync_cfg;
                        state = CdcFlowState::new(&cfg);
                        self.update_status(&mut state, FlowStatus::Resync)
                            .await;
                        continue;
                    }

                    self.update_status(&mut state, FlowStatus::Terminated)
                        .await;
                    self.publish_state(&state);
                    return Ok(state);
                }
            }
        }
    }

    /// Type-erased [`CdcFlowWorkflow::run`], used when the orchestrator
    /// launches itself as a child for table additions.
    pub fn run_boxed(
        self,
        cfg: FlowConnectionConfigs,
        state: Option<CdcFlowState>,
    ) -> BoxFuture<'static, FlowResult<CdcFlowState>> {
        Box::pin(self.run(cfg, state))
    }

    /// One pass of the state machine, dispatched by status and signal.
    async fn run_pass(
        &mut self,
        cfg: &mut FlowConnectionConfigs,
        state: &mut CdcFlowState,
    ) -> FlowResult<Transition> {
        if state.current_flow_status == FlowStatus::Completed {
            return Ok(Transition::Finished);
        }
        if state.active_signal == ActiveSignal::Pause {
            return self.pause_loop(cfg, state).await;
        }
        if state.current_flow_status != FlowStatus::Running {
            return self.setup_snapshot_phase(cfg, state).await;
        }

        // A config delta stashed by the previous pass is applied before the
        // sync activity restarts.
        if state.flow_config_update.is_some() {
            if let Some(transition) = self.process_config_update(cfg, state).await? {
                return Ok(transition);
            }
            state.flow_config_update = None;
            state.active_signal = ActiveSignal::Noop;
        }

        self.main_loop(cfg, state).await
    }

    /// Blocks while the mirror is paused, processing config updates and
    /// honoring terminate/resync.
    async fn pause_loop(
        &mut self,
        cfg: &mut FlowConnectionConfigs,
        state: &mut CdcFlowState,
    ) -> FlowResult<Transition> {
        let paused_at = Instant::now();
        self.update_status(state, FlowStatus::Paused)
            .await;

        while state.active_signal == ActiveSignal::Pause {
            // The only place the pause loop blocks, so signal processing is
            // immediate.
            while state.active_signal == ActiveSignal::Pause
                && state.flow_config_update.is_none()
                && !self.shutdown_rx.is_shutdown()
            {
                info!(paused_for = ?paused_at.elapsed(), "mirror is paused");
                let event = tokio::select! {
                    _ = self.shutdown_rx.wait_for_shutdown() => PauseEvent::Shutdown,
                    Some(signal) = self.signals.flow_signal.recv() => PauseEvent::Signal(signal),
                    Some(request) = self.signals.state_change.recv() => {
                        PauseEvent::StateChange(request)
                    }
                    Some(update) = self.signals.properties.recv() => PauseEvent::Properties(update),
                };
                match event {
                    PauseEvent::Shutdown => {}
                    PauseEvent::Signal(signal) => {
                        state.active_signal = flow_signal_handler(state.active_signal, signal);
                    }
                    PauseEvent::StateChange(request) => {
                        self.prepare_drop_on_request(
                            cfg,
                            state,
                            &request,
                            StateChangeContext::PauseOrMain,
                        )
                        .await;
                    }
                    PauseEvent::Properties(update) => self.stash_config_update(state, update),
                }
            }

            if self.shutdown_rx.is_shutdown() {
                bail!(ErrorKind::FlowCancelled, "mirror canceled while paused");
            }
            if let Some(input) = self.pending_drop_input(state)? {
                return Ok(Transition::Drop(input));
            }

            if state.flow_config_update.is_some() {
                if let Some(transition) = self.process_config_update(cfg, state).await? {
                    return Ok(transition);
                }
                info!("wiping flow config update after processing");
                state.flow_config_update = None;
                state.active_signal = ActiveSignal::Noop;
            }
        }

        info!(paused_for = ?paused_at.elapsed(), "mirror has been resumed");
        self.update_status(state, FlowStatus::Running)
            .await;
        Ok(Transition::ContinueAsNew)
    }

    /// Setup and initial snapshot, including the resync shadow-rename.
    async fn setup_snapshot_phase(
        &mut self,
        cfg: &mut FlowConnectionConfigs,
        state: &mut CdcFlowState,
    ) -> FlowResult<Transition> {
        let original_table_mappings = cfg.table_mappings.clone();

        // Resync shadow-populates `<name>_resync` tables so the serving
        // table stays readable until cut-over. Null-engine destinations
        // keep no data and are left alone.
        if cfg.resync {
            for mapping in &mut state.sync_flow_options.table_mappings {
                if mapping.engine != TableEngine::Null {
                    mapping
                        .destination_table_identifier
                        .push_str(RESYNC_TABLE_SUFFIX);
                }
            }
            cfg.table_mappings = state.sync_flow_options.table_mappings.clone();
        }

        let setup_id = child_workflow_id("setup-flow", &cfg.flow_job_name);
        info!(child_id = %setup_id, "starting setup flow");
        let setup_task = {
            let children = self.children.clone();
            let setup_cfg = cfg.clone();
            tokio::spawn(async move { children.setup_flow(setup_cfg).await })
        };
        let setup_context = StateChangeContext::Setup {
            original_table_mappings: &original_table_mappings,
        };
        let setup_output: SetupFlowOutput = match self
            .supervise_child(
                cfg,
                state,
                setup_task,
                setup_context,
                ErrorKind::SetupFlowFailed,
                "failed to execute setup flow",
            )
            .await?
        {
            ChildOutcome::Completed(output) => output,
            ChildOutcome::Drop(input) => return Ok(Transition::Drop(input)),
        };

        state.sync_flow_options.src_table_id_name_mapping = setup_output.src_table_id_name_mapping;
        self.update_status(state, FlowStatus::Snapshot)
            .await;

        let snapshot_id = child_workflow_id("snapshot-flow", &cfg.flow_job_name);
        info!(child_id = %snapshot_id, "starting snapshot flow");
        let snapshot_task = {
            let children = self.children.clone();
            let snapshot_cfg = cfg.clone();
            tokio::spawn(async move { children.snapshot_flow(snapshot_cfg).await })
        };
        match self
            .supervise_child(
                cfg,
                state,
                snapshot_task,
                setup_context,
                ErrorKind::SnapshotFlowFailed,
                "failed to execute snapshot flow",
            )
            .await?
        {
            ChildOutcome::Completed(()) => {}
            ChildOutcome::Drop(input) => return Ok(Transition::Drop(input)),
        }

        if cfg.resync {
            let rename_input = build_rename_input(cfg, &mut state.sync_flow_options.table_mappings);
            cfg.table_mappings = state.sync_flow_options.table_mappings.clone();

            let rename_task = {
                let activities = self.activities.clone();
                let input = rename_input;
                tokio::spawn(async move {
                    match timeout(RENAME_TABLES_TIMEOUT, activities.rename_tables(input)).await {
                        Ok(result) => result,
                        Err(_) => Err(flow_error!(
                            ErrorKind::ActivityTimeout,
                            "timed out renaming tables"
                        )),
                    }
                })
            };
            match self
                .supervise_child(
                    cfg,
                    state,
                    rename_task,
                    setup_context,
                    ErrorKind::RenameTablesFailed,
                    "failed to execute rename tables activity",
                )
                .await?
            {
                ChildOutcome::Completed(()) => {
                    info!("rename tables activity completed successfully");
                }
                ChildOutcome::Drop(input) => return Ok(Transition::Drop(input)),
            }
        }

        if cfg.initial_snapshot_only {
            info!("initial snapshot only, ending flow");
            self.update_status(state, FlowStatus::Completed)
                .await;
        } else {
            info!("executed setup flow and snapshot flow, start running");
            self.update_status(state, FlowStatus::Running)
                .await;
        }
        Ok(Transition::ContinueAsNew)
    }

    /// Runs the long-lived sync activity, multiplexed with the signal bus.
    async fn main_loop(
        &mut self,
        cfg: &mut FlowConnectionConfigs,
        state: &mut CdcFlowState,
    ) -> FlowResult<Transition> {
        info!("starting sync flow");
        counter!("flow_syncs_total", "flow_job_name" => cfg.flow_job_name.clone()).increment(1);

        let (cancel_tx, cancel_rx) = create_shutdown_channel();
        let mut sync_task: Option<JoinHandle<FlowResult<()>>> = Some({
            let activities = self.activities.clone();
            let sync_cfg = cfg.clone();
            let options = state.sync_flow_options.clone();
            tokio::spawn(async move {
                match timeout(SYNC_FLOW_TIMEOUT, activities.sync_flow(sync_cfg, options, cancel_rx))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(flow_error!(
                        ErrorKind::ActivityTimeout,
                        "sync flow exceeded its execution bound"
                    )),
                }
            })
        });

        let mut finished = false;
        let mut finished_error = false;
        let mut backoff: Option<Pin<Box<Sleep>>> = None;

        self.update_status(state, FlowStatus::Running)
            .await;

        loop {
            let event = tokio::select! {
                _ = self.shutdown_rx.wait_for_shutdown() => MainEvent::Shutdown,
                joined = async {
                    match sync_task.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending().await,
                    }
                } => MainEvent::SyncFinished(joined),
                _ = async {
                    match backoff.as_mut() {
                        Some(sleep) => sleep.as_mut().await,
                        None => std::future::pending().await,
                    }
                } => MainEvent::BackoffElapsed,
                Some(signal) = self.signals.flow_signal.recv() => MainEvent::Signal(signal),
                Some(request) = self.signals.state_change.recv() => MainEvent::StateChange(request),
                Some(update) = self.signals.properties.recv() => MainEvent::Properties(update),
            };

            match event {
                MainEvent::Shutdown => {
                    finished = true;
                }
                MainEvent::SyncFinished(joined) => {
                    sync_task = None;
                    let result = flatten_sync_result(joined);
                    match result {
                        Ok(()) => {
                            info!("sync finished");
                            finished = true;
                            if state.sync_flow_options.number_of_syncs > 0 {
                                state.active_signal = ActiveSignal::Pause;
                            }
                        }
                        Err(err) if finished || err.kind() == ErrorKind::FlowCancelled => {
                            error!(error = %err, "error in sync flow, but cdc finished");
                        }
                        Err(err) => {
                            counter!(
                                "flow_sync_errors_total",
                                "flow_job_name" => cfg.flow_job_name.clone()
                            )
                            .increment(1);

                            let now = Utc::now();
                            let within_error_window = state
                                .last_error
                                .is_some_and(|last| last + chrono::Duration::hours(24) > now);
                            if !within_error_window {
                                state.error_count = 0;
                            }
                            state.last_error = Some(now);

                            let sleep_for = backoff_after_sync_error(&err, state.error_count);
                            error!(error = %err, sleep_for = ?sleep_for, "error in sync flow");
                            backoff = Some(Box::pin(sleep(sleep_for)));
                        }
                    }
                }
                MainEvent::BackoffElapsed => {
                    backoff = None;
                    info!("sync finished after waiting after error");
                    finished = true;
                    finished_error = true;
                    if state.sync_flow_options.number_of_syncs > 0 {
                        state.active_signal = ActiveSignal::Pause;
                    }
                }
                MainEvent::Signal(signal) => {
                    state.active_signal = flow_signal_handler(state.active_signal, signal);
                    if state.active_signal == ActiveSignal::Pause {
                        finished = true;
                    }
                }
                MainEvent::StateChange(request) => {
                    finished = true;
                    self.prepare_drop_on_request(
                        cfg,
                        state,
                        &request,
                        StateChangeContext::PauseOrMain,
                    )
                    .await;
                }
                MainEvent::Properties(update) => {
                    // Config deltas are applied on re-entry, before the sync
                    // activity restarts.
                    self.stash_config_update(state, update);
                    finished = true;
                }
            }

            self.drain_main_signals(cfg, state, &mut finished).await;

            if self.maintenance_enabled() {
                finished = true;
            }

            if finished {
                // Wait on the sync flow before draining the selector.
                cancel_tx.shutdown();
                if let Some(task) = sync_task.take() {
                    if let Err(join_err) = task.await {
                        error!(error = %join_err, "sync flow task failed while draining");
                    }
                }

                self.drain_main_signals(cfg, state, &mut finished).await;

                if self.shutdown_rx.is_shutdown() {
                    info!("mirror canceled");
                    bail!(ErrorKind::FlowCancelled, "mirror canceled");
                }

                if finished_error {
                    state.error_count += 1;
                } else {
                    state.error_count = 0;
                }

                if let Some(input) = self.pending_drop_input(state)? {
                    return Ok(Transition::Drop(input));
                }
                return Ok(Transition::ContinueAsNew);
            }
        }
    }

    /// Applies a pending config delta: scalar knobs, env merge, table
    /// additions, and table removals. Returns a transition when a
    /// terminate/resync arrived while the add-tables subflow ran.
    async fn process_config_update(
        &mut self,
        cfg: &mut FlowConnectionConfigs,
        state: &mut CdcFlowState,
    ) -> FlowResult<Option<Transition>> {
        let Some(update) = state.flow_config_update.clone() else {
            return Ok(None);
        };

        // Only the options are modified here since the sync flow reads them.
        if update.batch_size > 0 {
            state.sync_flow_options.batch_size = update.batch_size;
        }
        if update.idle_timeout > 0 {
            state.sync_flow_options.idle_timeout_seconds = update.idle_timeout;
        }
        if update.number_of_syncs > 0 {
            state.sync_flow_options.number_of_syncs = update.number_of_syncs as u32;
        } else if update.number_of_syncs < 0 {
            state.sync_flow_options.number_of_syncs = 0;
        }
        if !update.updated_env.is_empty() {
            cfg.env
                .extend(update.updated_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if update.snapshot_num_rows_per_partition > 0 {
            state.snapshot_num_rows_per_partition = update.snapshot_num_rows_per_partition;
        }
        if update.snapshot_max_parallel_workers > 0 {
            state.snapshot_max_parallel_workers = update.snapshot_max_parallel_workers;
        }
        if update.snapshot_num_tables_in_parallel > 0 {
            state.snapshot_num_tables_in_parallel = update.snapshot_num_tables_in_parallel;
        }

        let tables_added = !update.additional_tables.is_empty();
        let tables_removed = !update.removed_tables.is_empty();
        if !tables_added && !tables_removed {
            self.snapshot_config_to_catalog(cfg, state).await;
            return Ok(None);
        }

        info!(
            additional_tables = update.additional_tables.len(),
            removed_tables = update.removed_tables.len(),
            "processing flow config update"
        );

        if tables_added {
            if let Some(transition) = self.process_table_additions(cfg, state, &update).await? {
                return Ok(Some(transition));
            }
        }
        if tables_removed {
            self.process_table_removals(cfg, state, &update).await?;
        }

        self.snapshot_config_to_catalog(cfg, state).await;
        Ok(None)
    }

    /// Extends the publication and snapshots the additional tables through
    /// a child CDC flow running in snapshot-only mode.
    async fn process_table_additions(
        &mut self,
        cfg: &mut FlowConnectionConfigs,
        state: &mut CdcFlowState,
        update: &FlowConfigUpdate,
    ) -> FlowResult<Option<Transition>> {
        if additional_tables_has_overlap(
            &state.sync_flow_options.table_mappings,
            &update.additional_tables,
        ) {
            warn!("duplicate source or destination tables found in additional tables");
            self.snapshot_config_to_catalog(cfg, state).await;
            return Ok(None);
        }

        self.update_status(state, FlowStatus::Snapshot)
            .await;

        info!("altering publication for additional tables");
        match timeout(
            PUBLICATION_ALTER_TIMEOUT,
            self.activities
                .add_tables_to_publication(cfg, &update.additional_tables),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, "failed to alter publication for additional tables");
                return Err(err);
            }
            Err(_) => bail!(
                ErrorKind::ActivityTimeout,
                "timed out altering publication for additional tables"
            ),
        }
        info!("additional tables added to publication");

        let mut additional_cfg = cfg.clone();
        additional_cfg.do_initial_snapshot = true;
        additional_cfg.initial_snapshot_only = true;
        additional_cfg.table_mappings = update.additional_tables.clone();
        additional_cfg.resync = false;
        additional_cfg.snapshot_num_rows_per_partition = state.snapshot_num_rows_per_partition;
        additional_cfg.snapshot_max_parallel_workers = state.snapshot_max_parallel_workers;
        additional_cfg.snapshot_num_tables_in_parallel = state.snapshot_num_tables_in_parallel;

        let child_id = child_workflow_id("additional-cdc-flow", &cfg.flow_job_name);
        info!(child_id = %child_id, "starting child flow for additional tables");

        // The child receives no external signals; terminate/resync keep
        // arriving on the parent's bus and cancel the child from outside.
        let (_, child_hub) = create_signal_hub();
        let child = CdcFlowWorkflow::new(
            self.catalog.clone(),
            self.activities.clone(),
            self.children.clone(),
            self.shutdown_rx.clone(),
            child_hub,
        )
        .with_workflow_id(child_id);
        let child_task = tokio::spawn(child.run_boxed(additional_cfg, None));

        let child_state = match self
            .supervise_child(
                cfg,
                state,
                child_task,
                StateChangeContext::TableAdditions {
                    additional_tables: &update.additional_tables,
                },
                ErrorKind::SnapshotFlowFailed,
                "failed to execute child flow for additional tables",
            )
            .await?
        {
            ChildOutcome::Completed(child_state) => child_state,
            ChildOutcome::Drop(input) => return Ok(Some(Transition::Drop(input))),
        };

        state
            .sync_flow_options
            .src_table_id_name_mapping
            .extend(child_state.sync_flow_options.src_table_id_name_mapping);
        state
            .sync_flow_options
            .table_mappings
            .extend(update.additional_tables.iter().cloned());
        info!("additional tables added to sync flow");
        Ok(None)
    }

    /// Removes tables from the publication, the raw table, and the catalog,
    /// in that order, then drops them from the live options.
    async fn process_table_removals(
        &self,
        cfg: &FlowConnectionConfigs,
        state: &mut CdcFlowState,
        update: &FlowConfigUpdate,
    ) -> FlowResult<()> {
        let activities = self.activities.clone();
        let tables = &update.removed_tables;

        info!("altering publication for removed tables");
        run_with_retries(
            "remove_tables_from_publication",
            TABLE_REMOVAL_RETRY_INITIAL,
            TABLE_REMOVAL_MAX_ATTEMPTS,
            || {
                let activities = activities.clone();
                async move {
                    bounded(
                        PUBLICATION_ALTER_TIMEOUT,
                        activities.remove_tables_from_publication(cfg, tables),
                    )
                    .await
                }
            },
        )
        .await?;
        info!("tables removed from publication");

        run_with_retries(
            "remove_tables_from_raw_table",
            TABLE_REMOVAL_RETRY_INITIAL,
            TABLE_REMOVAL_MAX_ATTEMPTS,
            || {
                let activities = activities.clone();
                async move {
                    bounded(
                        PUBLICATION_ALTER_TIMEOUT,
                        activities.remove_tables_from_raw_table(cfg, tables),
                    )
                    .await
                }
            },
        )
        .await?;
        info!("tables removed from raw table");

        run_with_retries(
            "remove_tables_from_catalog",
            TABLE_REMOVAL_RETRY_INITIAL,
            TABLE_REMOVAL_MAX_ATTEMPTS,
            || {
                let activities = activities.clone();
                async move {
                    bounded(
                        PUBLICATION_ALTER_TIMEOUT,
                        activities.remove_tables_from_catalog(cfg, tables),
                    )
                    .await
                }
            },
        )
        .await?;
        info!("tables removed from catalog");

        let removed: Vec<&str> = update
            .removed_tables
            .iter()
            .map(|mapping| mapping.source_table_identifier.as_str())
            .collect();
        state
            .sync_flow_options
            .src_table_id_name_mapping
            .retain(|_, name| !removed.contains(&name.as_str()));
        state
            .sync_flow_options
            .table_mappings
            .retain(|mapping| !removed.contains(&mapping.source_table_identifier.as_str()));

        Ok(())
    }

    /// Waits on a child task, honoring terminate/resync and cancellation.
    async fn supervise_child<T>(
        &mut self,
        cfg: &mut FlowConnectionConfigs,
        state: &mut CdcFlowState,
        mut task: JoinHandle<FlowResult<T>>,
        context: StateChangeContext<'_>,
        failure_kind: ErrorKind,
        failure_description: &'static str,
    ) -> FlowResult<ChildOutcome<T>> {
        loop {
            let event = tokio::select! {
                joined = &mut task => ChildEvent::Finished(joined),
                Some(request) = self.signals.state_change.recv() => ChildEvent::StateChange(request),
                _ = self.shutdown_rx.wait_for_shutdown() => ChildEvent::Shutdown,
            };

            match event {
                ChildEvent::Finished(Ok(Ok(value))) => return Ok(ChildOutcome::Completed(value)),
                ChildEvent::Finished(Ok(Err(err))) => {
                    error!(error = %err, activity = failure_description, "child flow failed");
                    return Err(FlowError::new(failure_kind, failure_description).with_source(err));
                }
                ChildEvent::Finished(Err(join_err)) => {
                    return Err(if join_err.is_panic() {
                        flow_error!(
                            ErrorKind::ChildFlowPanicked,
                            "child flow panicked",
                            join_err
                        )
                    } else {
                        FlowError::new(failure_kind, failure_description).with_source(join_err)
                    });
                }
                ChildEvent::StateChange(request) => {
                    if let Some(input) = self
                        .prepare_drop_on_request(cfg, state, &request, context)
                        .await
                    {
                        task.abort();
                        let _ = (&mut task).await;
                        return Ok(ChildOutcome::Drop(input));
                    }
                }
                ChildEvent::Shutdown => {
                    task.abort();
                    let _ = (&mut task).await;
                    bail!(ErrorKind::FlowCancelled, "flow cancelled");
                }
            }
        }
    }

    /// Handles a state-change request. Terminate and resync prepare the
    /// drop input and return it; everything else is warned about or
    /// ignored.
    async fn prepare_drop_on_request(
        &self,
        cfg: &mut FlowConnectionConfigs,
        state: &mut CdcFlowState,
        request: &FlowStateChangeRequest,
        context: StateChangeContext<'_>,
    ) -> Option<DropFlowInput> {
        match request.requested_flow_state {
            FlowStatus::Terminating => {
                info!("terminate requested");
                state.active_signal = ActiveSignal::Terminate;
                let drop_cfg = self.snapshot_config_to_catalog(cfg, state).await;
                let input = DropFlowInput {
                    flow_job_name: drop_cfg.flow_job_name.clone(),
                    flow_connection_configs: Some(drop_cfg),
                    drop_flow_stats: request.drop_mirror_stats,
                    skip_destination_drop: request.skip_destination_drop,
                    resync: false,
                };
                state.drop_flow_input = Some(input.clone());
                Some(input)
            }
            FlowStatus::Resync => {
                info!("resync requested");
                state.active_signal = ActiveSignal::Resync;
                cfg.resync = true;
                cfg.do_initial_snapshot = true;

                let resync_cfg = match context {
                    StateChangeContext::Setup {
                        original_table_mappings,
                    } => {
                        // The only place a resync can arrive during a
                        // resync; the catalog must keep the original names,
                        // not the suffixed shadow mappings.
                        cfg.table_mappings = original_table_mappings.to_vec();
                        self.upload_config_to_catalog(cfg).await;
                        cfg.clone()
                    }
                    StateChangeContext::TableAdditions { additional_tables } => {
                        // The additional tables are resynced as well; how
                        // far the child snapshot got is unknown.
                        state
                            .sync_flow_options
                            .table_mappings
                            .extend(additional_tables.iter().cloned());
                        self.snapshot_config_to_catalog(cfg, state).await
                    }
                    StateChangeContext::PauseOrMain => {
                        self.snapshot_config_to_catalog(cfg, state).await
                    }
                };

                let input = DropFlowInput {
                    flow_job_name: resync_cfg.flow_job_name.clone(),
                    flow_connection_configs: Some(resync_cfg),
                    drop_flow_stats: request.drop_mirror_stats,
                    skip_destination_drop: request.skip_destination_drop,
                    resync: true,
                };
                state.drop_flow_input = Some(input.clone());
                Some(input)
            }
            FlowStatus::Paused => {
                if !matches!(context, StateChangeContext::PauseOrMain) {
                    warn!("pause requested during setup or table additions, ignoring");
                }
                None
            }
            other => {
                debug!(requested_state = %other, "ignoring requested flow state");
                None
            }
        }
    }

    /// Drains buffered signal deliveries so that events observed together
    /// are all handled before the pass acts on `finished`.
    async fn drain_main_signals(
        &mut self,
        cfg: &mut FlowConnectionConfigs,
        state: &mut CdcFlowState,
        finished: &mut bool,
    ) {
        loop {
            if let Ok(signal) = self.signals.flow_signal.try_recv() {
                state.active_signal = flow_signal_handler(state.active_signal, signal);
                if state.active_signal == ActiveSignal::Pause {
                    *finished = true;
                }
                continue;
            }
            if let Ok(request) = self.signals.state_change.try_recv() {
                *finished = true;
                self.prepare_drop_on_request(cfg, state, &request, StateChangeContext::PauseOrMain)
                    .await;
                continue;
            }
            if let Ok(update) = self.signals.properties.try_recv() {
                self.stash_config_update(state, update);
                *finished = true;
                continue;
            }
            break;
        }
    }

    fn stash_config_update(&self, state: &mut CdcFlowState, update: FlowConfigUpdate) {
        // Stashed irrespective of table changes being present, so an update
        // also auto-unpauses a paused mirror.
        info!(
            batch_size = update.batch_size,
            idle_timeout = update.idle_timeout,
            number_of_syncs = update.number_of_syncs,
            additional_tables = update.additional_tables.len(),
            removed_tables = update.removed_tables.len(),
            "flow config update received"
        );
        state.flow_config_update = Some(update);
    }

    /// Returns the prepared drop input when terminate/resync is pending.
    fn pending_drop_input(&self, state: &CdcFlowState) -> FlowResult<Option<DropFlowInput>> {
        if !matches!(
            state.active_signal,
            ActiveSignal::Terminate | ActiveSignal::Resync
        ) {
            return Ok(None);
        }
        match &state.drop_flow_input {
            Some(input) => Ok(Some(input.clone())),
            None => Err(flow_error!(
                ErrorKind::InvalidState,
                "terminate or resync signaled without prepared drop input"
            )),
        }
    }

    fn maintenance_enabled(&self) -> bool {
        self.maintenance_rx
            .as_ref()
            .is_some_and(|rx| *rx.borrow() == MaintenancePhase::Enabled)
    }

    fn publish_state(&self, state: &CdcFlowState) {
        let _ = self.signals.state_tx.send(state.clone());
    }

    /// Sets the status, mirroring it to the catalog before it becomes
    /// observable through the queries.
    async fn update_status(&self, state: &mut CdcFlowState, status: FlowStatus) {
        state.current_flow_status = status;
        // Catalog first: a query caller wakes the moment the watches are
        // written, and the catalog must already reflect the transition by
        // then. State before status so whoever wakes on the status watch
        // sees a state snapshot at least as new.
        self.mirror_status_to_catalog(status).await;
        self.publish_state(state);
        let _ = self.signals.status_tx.send(status);
    }

    async fn mirror_status_to_catalog(&self, status: FlowStatus) {
        match timeout(
            STATUS_UPDATE_TIMEOUT,
            self.catalog.update_flow_status(&self.workflow_id, status),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(error = %err, status = %status, "failed to update flow status in catalog");
            }
            Err(_) => warn!(status = %status, "timed out updating flow status in catalog"),
        }
    }

    /// Merges the live options into the config and uploads the result,
    /// best-effort.
    async fn snapshot_config_to_catalog(
        &self,
        cfg: &FlowConnectionConfigs,
        state: &CdcFlowState,
    ) -> FlowConnectionConfigs {
        let merged = merged_config(cfg, state);
        self.upload_config_to_catalog(&merged).await;
        merged
    }

    async fn upload_config_to_catalog(&self, cfg: &FlowConnectionConfigs) {
        match timeout(CONFIG_UPLOAD_TIMEOUT, self.catalog.update_flow_config(cfg)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to update flow config in catalog"),
            Err(_) => warn!("timed out updating flow config in catalog"),
        }
    }
}

/// Copies the live runtime options back into the config before it is
/// persisted or handed to the drop flow.
fn merged_config(cfg: &FlowConnectionConfigs, state: &CdcFlowState) -> FlowConnectionConfigs {
    let mut merged = cfg.clone();
    merged.max_batch_size = state.sync_flow_options.batch_size;
    merged.idle_timeout_seconds = state.sync_flow_options.idle_timeout_seconds;
    merged.table_mappings = state.sync_flow_options.table_mappings.clone();
    merged.snapshot_num_rows_per_partition = state.snapshot_num_rows_per_partition;
    merged.snapshot_max_parallel_workers = state.snapshot_max_parallel_workers;
    merged.snapshot_num_tables_in_parallel = state.snapshot_num_tables_in_parallel;
    merged
}

/// Builds the rename input that swaps shadow tables over their originals,
/// and restores the original identifiers on the live mappings.
fn build_rename_input(
    cfg: &FlowConnectionConfigs,
    table_mappings: &mut [TableMapping],
) -> RenameTablesInput {
    let mut input = RenameTablesInput {
        flow_job_name: cfg.flow_job_name.clone(),
        peer_name: cfg.destination_name.clone(),
        synced_at_col_name: cfg.synced_at_col_name.clone(),
        soft_delete_col_name: cfg.soft_delete_col_name.clone(),
        rename_table_options: Vec::with_capacity(table_mappings.len()),
    };

    for mapping in table_mappings {
        if mapping.engine != TableEngine::Null {
            let current = mapping.destination_table_identifier.clone();
            let new_name = current
                .strip_suffix(RESYNC_TABLE_SUFFIX)
                .unwrap_or(&current)
                .to_string();
            input.rename_table_options.push(RenameTableOption {
                current_name: current,
                new_name: new_name.clone(),
            });
            mapping.destination_table_identifier = new_name;
        } else {
            input.rename_table_options.push(RenameTableOption {
                current_name: mapping.destination_table_identifier.clone(),
                new_name: mapping.destination_table_identifier.clone(),
            });
        }
    }

    input
}

fn flatten_sync_result(joined: Result<FlowResult<()>, JoinError>) -> FlowResult<()> {
    match joined {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(flow_error!(
            ErrorKind::SyncFlowPanicked,
            "sync flow panicked",
            join_err
        )),
        Err(join_err) => Err(flow_error!(
            ErrorKind::SyncFlowFailed,
            "sync flow task failed",
            join_err
        )),
    }
}

/// Classifies a sync failure into its backoff tier.
///
/// Panics sleep longest; a busy source (SQLSTATE 55006) or infrastructure
/// failure retries quickly; other application errors sit in between.
fn backoff_after_sync_error(err: &FlowError, error_count: u32) -> Duration {
    let minutes = if err.kind() == ErrorKind::SyncFlowPanicked {
        10 + u64::from(error_count.min(3)) * 15
    } else if !err.is_application()
        || err.kind() == ErrorKind::SourceObjectInUse
        || err.contains_sqlstate("55006")
    {
        1 + u64::from(error_count.min(9))
    } else {
        5 + u64::from(error_count.min(5)) * 15
    };
    Duration::from_secs(minutes * 60)
}

/// Bounds an activity future by a timeout, mapping elapsed time to an
/// [`ErrorKind::ActivityTimeout`] error.
async fn bounded<T>(
    bound: Duration,
    future: impl std::future::Future<Output = FlowResult<T>>,
) -> FlowResult<T> {
    match timeout(bound, future).await {
        Ok(result) => result,
        Err(_) => Err(flow_error!(
            ErrorKind::ActivityTimeout,
            "activity exceeded its execution bound"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncFlowOptions;

    fn minutes(count: u64) -> Duration {
        Duration::from_secs(count * 60)
    }

    #[test]
    fn panic_backoff_grows_to_a_ceiling() {
        let err = FlowError::new(ErrorKind::SyncFlowPanicked, "sync flow panicked");
        assert_eq!(backoff_after_sync_error(&err, 0), minutes(10));
        assert_eq!(backoff_after_sync_error(&err, 1), minutes(25));
        assert_eq!(backoff_after_sync_error(&err, 3), minutes(55));
        assert_eq!(backoff_after_sync_error(&err, 9), minutes(55));
    }

    #[test]
    fn busy_source_backs_off_briefly() {
        let typed = FlowError::new(ErrorKind::SourceObjectInUse, "slot in use");
        assert_eq!(backoff_after_sync_error(&typed, 0), minutes(1));
        assert_eq!(backoff_after_sync_error(&typed, 9), minutes(10));
        assert_eq!(backoff_after_sync_error(&typed, 20), minutes(10));

        // Errors that crossed a serialization boundary only carry the
        // SQLSTATE in their message.
        let textual = FlowError::new(ErrorKind::SyncFlowFailed, "sync flow failed")
            .with_detail("replication slot busy (SQLSTATE 55006)");
        assert_eq!(backoff_after_sync_error(&textual, 2), minutes(3));
    }

    #[test]
    fn infrastructure_errors_back_off_briefly() {
        let err = FlowError::new(ErrorKind::ActivityTimeout, "timed out");
        assert_eq!(backoff_after_sync_error(&err, 4), minutes(5));
    }

    #[test]
    fn application_errors_back_off_longest_tier() {
        let err = FlowError::new(ErrorKind::SyncFlowFailed, "bad rows");
        assert_eq!(backoff_after_sync_error(&err, 0), minutes(5));
        assert_eq!(backoff_after_sync_error(&err, 2), minutes(35));
        assert_eq!(backoff_after_sync_error(&err, 5), minutes(80));
        assert_eq!(backoff_after_sync_error(&err, 50), minutes(80));
    }

    #[test]
    fn merged_config_carries_live_options() {
        let cfg = FlowConnectionConfigs {
            flow_job_name: "m1".to_string(),
            max_batch_size: 10,
            ..Default::default()
        };
        let state = CdcFlowState {
            sync_flow_options: SyncFlowOptions {
                batch_size: 500,
                idle_timeout_seconds: 20,
                table_mappings: vec![TableMapping::new("public.a", "a_dst")],
                ..Default::default()
            },
            snapshot_max_parallel_workers: 8,
            ..Default::default()
        };

        let merged = merged_config(&cfg, &state);
        assert_eq!(merged.max_batch_size, 500);
        assert_eq!(merged.idle_timeout_seconds, 20);
        assert_eq!(merged.table_mappings.len(), 1);
        assert_eq!(merged.snapshot_max_parallel_workers, 8);
    }

    #[test]
    fn rename_input_restores_original_identifiers() {
        let cfg = FlowConnectionConfigs {
            flow_job_name: "m1".to_string(),
            destination_name: "ch".to_string(),
            ..Default::default()
        };
        let mut mappings = vec![
            TableMapping::new("public.a", "a_dst_resync"),
            TableMapping {
                engine: TableEngine::Null,
                ..TableMapping::new("public.b", "b_dst")
            },
        ];

        let input = build_rename_input(&cfg, &mut mappings);

        assert_eq!(input.rename_table_options.len(), 2);
        assert_eq!(input.rename_table_options[0].current_name, "a_dst_resync");
        assert_eq!(input.rename_table_options[0].new_name, "a_dst");
        // Null-engine destinations pass through unchanged.
        assert_eq!(input.rename_table_options[1].current_name, "b_dst");
        assert_eq!(input.rename_table_options[1].new_name, "b_dst");
        assert_eq!(mappings[0].destination_table_identifier, "a_dst");
        assert_eq!(mappings[1].destination_table_identifier, "b_dst");
    }
}
