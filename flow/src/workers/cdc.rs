use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info};

use crate::activities::FlowActivities;
use crate::catalog::Catalog;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;
use crate::model::{CdcFlowState, FlowConnectionConfigs, FlowStatus};
use crate::signals::{FlowController, MaintenancePhase, create_signal_hub};
use crate::workers::base::{Worker, WorkerHandle};
use crate::workflows::{CdcFlowWorkflow, ChildFlows};

/// Handle for monitoring and controlling a running CDC flow worker.
///
/// Exposes the mirror's signal controller and awaits the terminal state.
#[derive(Debug)]
pub struct CdcFlowWorkerHandle {
    controller: FlowController,
    handle: Option<JoinHandle<FlowResult<CdcFlowState>>>,
}

impl CdcFlowWorkerHandle {
    /// Returns the signal controller addressing this mirror.
    pub fn controller(&self) -> FlowController {
        self.controller.clone()
    }
}

impl WorkerHandle<FlowStatus> for CdcFlowWorkerHandle {
    type Output = CdcFlowState;

    fn state(&self) -> FlowStatus {
        self.controller.status()
    }

    /// Waits for the orchestrator to reach a terminal state.
    ///
    /// Maps task panics and cancellation onto flow errors so callers see a
    /// uniform error surface.
    async fn wait(mut self) -> FlowResult<CdcFlowState> {
        let Some(handle) = self.handle.take() else {
            return Err(flow_error!(
                ErrorKind::InvalidState,
                "cdc flow worker was already awaited"
            ));
        };

        handle.await.map_err(|err| {
            if err.is_cancelled() {
                flow_error!(ErrorKind::FlowCancelled, "cdc flow worker was cancelled", err)
            } else {
                flow_error!(ErrorKind::ChildFlowPanicked, "cdc flow worker panicked", err)
            }
        })?
    }
}

/// Worker hosting the orchestrator of one mirror.
pub struct CdcFlowWorker<C, A, W> {
    catalog: C,
    activities: A,
    children: W,
    config: FlowConnectionConfigs,
    resume_state: Option<CdcFlowState>,
    shutdown_rx: ShutdownRx,
    maintenance_rx: Option<watch::Receiver<MaintenancePhase>>,
}

impl<C, A, W> CdcFlowWorker<C, A, W>
where
    C: Catalog,
    A: FlowActivities,
    W: ChildFlows,
{
    /// Creates a worker for a mirror entering at `config`, optionally
    /// resuming from a carried state checkpoint.
    pub fn new(
        catalog: C,
        activities: A,
        children: W,
        config: FlowConnectionConfigs,
        resume_state: Option<CdcFlowState>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            catalog,
            activities,
            children,
            config,
            resume_state,
            shutdown_rx,
            maintenance_rx: None,
        }
    }

    /// Attaches the global maintenance phase channel.
    pub fn with_maintenance_rx(mut self, rx: watch::Receiver<MaintenancePhase>) -> Self {
        self.maintenance_rx = Some(rx);
        self
    }
}

impl<C, A, W> Worker<CdcFlowWorkerHandle, FlowStatus> for CdcFlowWorker<C, A, W>
where
    C: Catalog,
    A: FlowActivities,
    W: ChildFlows,
{
    type Error = FlowError;

    async fn start(self) -> FlowResult<CdcFlowWorkerHandle> {
        info!(flow_job_name = %self.config.flow_job_name, "starting cdc flow worker");

        let (controller, hub) = create_signal_hub();
        let span = tracing::info_span!(
            "cdc_flow",
            flow_job_name = %self.config.flow_job_name
        );

        let mut workflow = CdcFlowWorkflow::new(
            self.catalog,
            self.activities,
            self.children,
            self.shutdown_rx,
            hub,
        );
        if let Some(rx) = self.maintenance_rx {
            workflow = workflow.with_maintenance_rx(rx);
        }

        let flow_job_name = self.config.flow_job_name.clone();
        let worker = async move {
            let result = workflow.run(self.config, self.resume_state).await;
            match &result {
                Ok(state) => {
                    info!(status = %state.current_flow_status, "cdc flow worker completed");
                }
                Err(err) => {
                    // Logged here so the failure is visible even when the
                    // worker is never awaited.
                    error!(flow_job_name = %flow_job_name, error = %err, "cdc flow worker failed");
                }
            }
            result
        }
        .instrument(span.or_current());

        let handle = tokio::spawn(worker);

        Ok(CdcFlowWorkerHandle {
            controller,
            handle: Some(handle),
        })
    }
}
