//! Data model for mirrors: connection configs, table mappings, runtime
//! options, and the durable orchestrator state.

mod config;
mod state;

pub use config::{
    DropFlowInput, FlowConfigUpdate, FlowConnectionConfigs, RESYNC_TABLE_SUFFIX,
    RenameTableOption, RenameTablesInput, SetupFlowOutput, SyncFlowOptions, TableEngine,
    TableMapping, additional_tables_has_overlap,
};
pub use state::{
    ActiveSignal, CdcFlowState, FlowSignal, FlowStateChangeRequest, FlowStatus, flow_signal_handler,
};
