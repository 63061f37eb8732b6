//! Background workers hosting orchestrators.

mod base;
mod cdc;
mod pool;

pub use base::{Worker, WorkerHandle};
pub use cdc::{CdcFlowWorker, CdcFlowWorkerHandle};
pub use pool::FlowWorkerPool;
