use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::config::{
    DropFlowInput, FlowConfigUpdate, FlowConnectionConfigs, SyncFlowOptions,
};

/// Lifecycle status of a mirror.
///
/// Transitions are monotone within a run, except Paused and Running may
/// alternate and Resync is reachable from any non-terminal status. Every
/// transition is mirrored to the catalog before it becomes externally
/// observable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Setup,
    Snapshot,
    Running,
    Paused,
    Terminating,
    Terminated,
    Completed,
    Resync,
}

impl FlowStatus {
    /// Stable string form stored in the catalog.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Setup => "setup",
            FlowStatus::Snapshot => "snapshot",
            FlowStatus::Running => "running",
            FlowStatus::Paused => "paused",
            FlowStatus::Terminating => "terminating",
            FlowStatus::Terminated => "terminated",
            FlowStatus::Completed => "completed",
            FlowStatus::Resync => "resync",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FlowStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "setup" => Ok(FlowStatus::Setup),
            "snapshot" => Ok(FlowStatus::Snapshot),
            "running" => Ok(FlowStatus::Running),
            "paused" => Ok(FlowStatus::Paused),
            "terminating" => Ok(FlowStatus::Terminating),
            "terminated" => Ok(FlowStatus::Terminated),
            "completed" => Ok(FlowStatus::Completed),
            "resync" => Ok(FlowStatus::Resync),
            other => Err(format!("`{other}` is not a flow status")),
        }
    }
}

/// External control signal carried on the flow-signal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowSignal {
    Noop,
    Pause,
}

/// The signal state the orchestrator is currently acting on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveSignal {
    #[default]
    Noop,
    Pause,
    Terminate,
    Resync,
}

/// Folds an incoming flow signal into the active signal.
///
/// Pause engages only from the idle state so repeats collapse; Noop always
/// resets, which is what wakes a paused mirror.
pub fn flow_signal_handler(active: ActiveSignal, incoming: FlowSignal) -> ActiveSignal {
    match incoming {
        FlowSignal::Pause => {
            info!("received pause signal");
            if active == ActiveSignal::Noop {
                info!("workflow was running, pausing it");
                return ActiveSignal::Pause;
            }
            active
        }
        FlowSignal::Noop => {
            info!("received noop signal");
            ActiveSignal::Noop
        }
    }
}

/// A request delivered on the state-change channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowStateChangeRequest {
    pub requested_flow_state: FlowStatus,
    pub drop_mirror_stats: bool,
    pub skip_destination_drop: bool,
    pub flow_config_update: Option<FlowConfigUpdate>,
}

impl FlowStateChangeRequest {
    pub fn new(requested_flow_state: FlowStatus) -> Self {
        Self {
            requested_flow_state,
            ..Default::default()
        }
    }
}

/// The durable checkpoint of a CDC flow.
///
/// Created on first entry, carried across every pass, and destroyed only
/// when the mirror is dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CdcFlowState {
    /// Pending config delta, cleared once processed.
    pub flow_config_update: Option<FlowConfigUpdate>,
    /// Options passed to every sync.
    pub sync_flow_options: SyncFlowOptions,
    /// Prepared drop parameters once terminate or resync is signaled.
    pub drop_flow_input: Option<DropFlowInput>,
    /// Backoff accumulator.
    pub last_error: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub active_signal: ActiveSignal,
    pub current_flow_status: FlowStatus,

    /// Initial load settings.
    pub snapshot_num_rows_per_partition: u32,
    pub snapshot_max_parallel_workers: u32,
    pub snapshot_num_tables_in_parallel: u32,
}

impl CdcFlowState {
    /// Creates the initial state for a mirror from its configuration.
    pub fn new(cfg: &FlowConnectionConfigs) -> Self {
        Self {
            flow_config_update: None,
            sync_flow_options: SyncFlowOptions {
                batch_size: cfg.max_batch_size,
                idle_timeout_seconds: cfg.idle_timeout_seconds,
                number_of_syncs: 0,
                table_mappings: cfg.table_mappings.clone(),
                src_table_id_name_mapping: Default::default(),
            },
            drop_flow_input: None,
            last_error: None,
            error_count: 0,
            active_signal: ActiveSignal::Noop,
            current_flow_status: FlowStatus::Setup,
            snapshot_num_rows_per_partition: cfg.snapshot_num_rows_per_partition,
            snapshot_max_parallel_workers: cfg.snapshot_max_parallel_workers,
            snapshot_num_tables_in_parallel: cfg.snapshot_num_tables_in_parallel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::TableMapping;

    #[test]
    fn status_string_round_trips() {
        for status in [
            FlowStatus::Setup,
            FlowStatus::Snapshot,
            FlowStatus::Running,
            FlowStatus::Paused,
            FlowStatus::Terminating,
            FlowStatus::Terminated,
            FlowStatus::Completed,
            FlowStatus::Resync,
        ] {
            assert_eq!(status.as_str().parse::<FlowStatus>().unwrap(), status);
        }
    }

    #[test]
    fn pause_engages_only_from_noop() {
        assert_eq!(
            flow_signal_handler(ActiveSignal::Noop, FlowSignal::Pause),
            ActiveSignal::Pause
        );
        assert_eq!(
            flow_signal_handler(ActiveSignal::Pause, FlowSignal::Pause),
            ActiveSignal::Pause
        );
        assert_eq!(
            flow_signal_handler(ActiveSignal::Terminate, FlowSignal::Pause),
            ActiveSignal::Terminate
        );
    }

    #[test]
    fn noop_resets_the_active_signal() {
        assert_eq!(
            flow_signal_handler(ActiveSignal::Pause, FlowSignal::Noop),
            ActiveSignal::Noop
        );
    }

    #[test]
    fn signal_sequences_fold_left() {
        // The final active signal must equal the left-fold of the handler
        // over the sequence, whatever the interleaving.
        let sequences: &[&[FlowSignal]] = &[
            &[FlowSignal::Pause, FlowSignal::Pause, FlowSignal::Noop],
            &[FlowSignal::Noop, FlowSignal::Pause],
            &[FlowSignal::Pause, FlowSignal::Noop, FlowSignal::Pause],
        ];

        for sequence in sequences {
            let mut active = ActiveSignal::Noop;
            for signal in *sequence {
                active = flow_signal_handler(active, *signal);
            }
            let folded = sequence
                .iter()
                .fold(ActiveSignal::Noop, |acc, signal| {
                    flow_signal_handler(acc, *signal)
                });
            assert_eq!(active, folded);
        }
    }

    #[test]
    fn initial_state_copies_runtime_options() {
        let cfg = FlowConnectionConfigs {
            flow_job_name: "m1".to_string(),
            table_mappings: vec![TableMapping::new("public.a", "a_dst")],
            max_batch_size: 50_000,
            idle_timeout_seconds: 30,
            snapshot_max_parallel_workers: 4,
            ..Default::default()
        };

        let state = CdcFlowState::new(&cfg);
        assert_eq!(state.current_flow_status, FlowStatus::Setup);
        assert_eq!(state.active_signal, ActiveSignal::Noop);
        assert_eq!(state.sync_flow_options.batch_size, 50_000);
        assert_eq!(state.sync_flow_options.table_mappings, cfg.table_mappings);
        assert_eq!(state.snapshot_max_parallel_workers, 4);
    }
}
