use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Suffix applied to destination identifiers while a resync shadow-populates
/// replacement tables.
pub const RESYNC_TABLE_SUFFIX: &str = "_resync";

/// Destination table engine.
///
/// [`TableEngine::Null`] destinations keep no data of their own, so a
/// resync never shadow-renames them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableEngine {
    #[default]
    ReplacingMergeTree,
    MergeTree,
    Null,
}

/// A source to destination table correspondence within a mirror.
///
/// Within one config, `source_table_identifier` is unique, and so is the
/// `(source, destination)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_table_identifier: String,
    pub destination_table_identifier: String,
    #[serde(default)]
    pub engine: TableEngine,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TableMapping {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source_table_identifier: source.into(),
            destination_table_identifier: destination.into(),
            engine: TableEngine::default(),
            partition_key: None,
            exclude: Vec::new(),
        }
    }
}

/// Connection configuration of a mirror.
///
/// Immutable per orchestrator pass; mutated across passes through catalog
/// uploads and [`FlowConfigUpdate`] deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConnectionConfigs {
    pub flow_job_name: String,
    pub source_name: String,
    pub destination_name: String,
    pub table_mappings: Vec<TableMapping>,

    pub max_batch_size: u32,
    pub idle_timeout_seconds: u64,
    #[serde(default)]
    pub publication_name: String,
    #[serde(default)]
    pub replication_slot_name: String,

    pub do_initial_snapshot: bool,
    pub initial_snapshot_only: bool,
    pub resync: bool,

    #[serde(default)]
    pub soft_delete_col_name: String,
    #[serde(default)]
    pub synced_at_col_name: String,

    #[serde(default)]
    pub env: HashMap<String, String>,

    pub snapshot_num_rows_per_partition: u32,
    pub snapshot_max_parallel_workers: u32,
    pub snapshot_num_tables_in_parallel: u32,
}

/// Runtime options passed to every sync.
///
/// `src_table_id_name_mapping` is populated by setup and maps the numeric
/// source table id to the qualified source name; its keys stay a subset of
/// the mapped source tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncFlowOptions {
    pub batch_size: u32,
    pub idle_timeout_seconds: u64,
    /// Syncs to run before pausing; 0 means unlimited.
    pub number_of_syncs: u32,
    pub table_mappings: Vec<TableMapping>,
    pub src_table_id_name_mapping: HashMap<u32, String>,
}

/// A configuration delta delivered over the dynamic-properties channel.
///
/// Zero-valued scalars leave the current setting untouched; a negative
/// `number_of_syncs` clears the cap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfigUpdate {
    pub batch_size: u32,
    pub idle_timeout: u64,
    pub number_of_syncs: i32,
    #[serde(default)]
    pub updated_env: HashMap<String, String>,
    #[serde(default)]
    pub additional_tables: Vec<TableMapping>,
    #[serde(default)]
    pub removed_tables: Vec<TableMapping>,
    pub snapshot_num_rows_per_partition: u32,
    pub snapshot_max_parallel_workers: u32,
    pub snapshot_num_tables_in_parallel: u32,
}

/// Parameters prepared when a terminate or resync decision is taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DropFlowInput {
    pub flow_job_name: String,
    pub flow_connection_configs: Option<FlowConnectionConfigs>,
    pub drop_flow_stats: bool,
    pub skip_destination_drop: bool,
    pub resync: bool,
}

/// One table rename executed during resync cut-over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameTableOption {
    pub current_name: String,
    pub new_name: String,
}

/// Input for the atomic shadow-table rename at the end of a resync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenameTablesInput {
    pub flow_job_name: String,
    pub peer_name: String,
    pub synced_at_col_name: String,
    pub soft_delete_col_name: String,
    pub rename_table_options: Vec<RenameTableOption>,
}

/// Output of the setup child workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupFlowOutput {
    pub src_table_id_name_mapping: HashMap<u32, String>,
}

/// Returns `true` when any additional table collides with an existing
/// mapping on either the source or the destination identifier.
pub fn additional_tables_has_overlap(
    existing: &[TableMapping],
    additional: &[TableMapping],
) -> bool {
    additional.iter().any(|candidate| {
        existing.iter().any(|mapping| {
            mapping.source_table_identifier == candidate.source_table_identifier
                || mapping.destination_table_identifier == candidate.destination_table_identifier
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_detected_on_source_identifier() {
        let existing = vec![TableMapping::new("public.a", "a_dst")];
        let additional = vec![TableMapping::new("public.a", "other_dst")];
        assert!(additional_tables_has_overlap(&existing, &additional));
    }

    #[test]
    fn overlap_detected_on_destination_identifier() {
        let existing = vec![TableMapping::new("public.a", "a_dst")];
        let additional = vec![TableMapping::new("public.b", "a_dst")];
        assert!(additional_tables_has_overlap(&existing, &additional));
    }

    #[test]
    fn disjoint_tables_do_not_overlap() {
        let existing = vec![TableMapping::new("public.a", "a_dst")];
        let additional = vec![TableMapping::new("public.b", "b_dst")];
        assert!(!additional_tables_has_overlap(&existing, &additional));
    }

    #[test]
    fn configs_round_trip_through_json() {
        let cfg = FlowConnectionConfigs {
            flow_job_name: "m1".to_string(),
            source_name: "pg".to_string(),
            destination_name: "ch".to_string(),
            table_mappings: vec![TableMapping::new("public.a", "a_dst")],
            max_batch_size: 100_000,
            idle_timeout_seconds: 60,
            do_initial_snapshot: true,
            ..Default::default()
        };

        let encoded = serde_json::to_string(&cfg).unwrap();
        let decoded: FlowConnectionConfigs = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, cfg);
    }
}
