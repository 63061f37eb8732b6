use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;
use crate::model::CdcFlowState;
use crate::signals::FlowController;
use crate::workers::cdc::CdcFlowWorkerHandle;
use crate::workers::base::WorkerHandle;

/// Internal state for [`FlowWorkerPool`].
#[derive(Debug, Default)]
struct Inner {
    /// Controllers of live orchestrators, keyed by flow job name.
    active: HashMap<String, FlowController>,
    /// Owns all spawned orchestrator wait tasks.
    join_set: JoinSet<(String, FlowResult<CdcFlowState>)>,
}

/// Pool of CDC flow orchestrators, one per mirror.
///
/// The flow job name keys the pool, which is what enforces at-most-one
/// live orchestrator per mirror in a worker process.
#[derive(Debug, Clone, Default)]
pub struct FlowWorkerPool {
    inner: Arc<Mutex<Inner>>,
}

impl FlowWorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a started worker into the pool.
    ///
    /// Refuses the insert with a warning when a live orchestrator already
    /// exists for the mirror.
    pub async fn insert(&self, flow_job_name: &str, handle: CdcFlowWorkerHandle) -> FlowResult<()> {
        let mut inner = self.inner.lock().await;

        match inner.active.entry(flow_job_name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(handle.controller());
            }
            Entry::Occupied(_) => {
                warn!(flow_job_name, "mirror already has a live orchestrator");
                bail_insert(flow_job_name)?;
            }
        }

        let name = flow_job_name.to_string();
        inner
            .join_set
            .spawn(async move { (name, handle.wait().await) });

        debug!(flow_job_name, "orchestrator inserted into pool");
        Ok(())
    }

    /// Returns the controller for a live mirror.
    pub async fn controller(&self, flow_job_name: &str) -> Option<FlowController> {
        self.inner.lock().await.active.get(flow_job_name).cloned()
    }

    /// Waits for every orchestrator to reach a terminal state.
    ///
    /// Errors are collected; cancellation errors are expected during
    /// shutdown and reported at debug level only.
    pub async fn wait_all(&self) -> FlowResult<()> {
        let mut errors = Vec::new();

        loop {
            let result = {
                let mut inner = self.inner.lock().await;
                inner.join_set.join_next().await
            };

            let Some(result) = result else {
                break;
            };

            match result {
                Ok((flow_job_name, worker_result)) => {
                    let mut inner = self.inner.lock().await;
                    inner.active.remove(&flow_job_name);
                    drop(inner);

                    match worker_result {
                        Ok(state) => {
                            debug!(
                                flow_job_name = %flow_job_name,
                                status = %state.current_flow_status,
                                "orchestrator completed"
                            );
                        }
                        Err(err) if err.kind() == ErrorKind::FlowCancelled => {
                            debug!(flow_job_name = %flow_job_name, "orchestrator cancelled");
                        }
                        Err(err) => {
                            error!(
                                flow_job_name = %flow_job_name,
                                error = %err,
                                "orchestrator completed with error"
                            );
                            errors.push(err);
                        }
                    }
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        debug!("orchestrator wait task was cancelled");
                    } else {
                        errors.push(flow_error!(
                            ErrorKind::ChildFlowPanicked,
                            "orchestrator wait task panicked",
                            join_err
                        ));
                    }
                }
            }
        }

        {
            let mut inner = self.inner.lock().await;
            inner.active.clear();
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FlowError::from_many(errors))
        }
    }
}

fn bail_insert(flow_job_name: &str) -> FlowResult<()> {
    Err(flow_error!(
        ErrorKind::InvalidState,
        "mirror already has a live orchestrator",
        flow_job_name
    ))
}
