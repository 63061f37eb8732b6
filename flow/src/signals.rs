//! Signal bus connecting the control surface to a running orchestrator.
//!
//! Three logical channels per mirror: flow signals (pause/noop), state
//! change requests (terminate/resync), and dynamic property updates.
//! Each channel is FIFO and buffers signals sent before the orchestrator
//! reaches its first select. Query handlers are watch channels publishing
//! the durable state and the current status.

use tokio::sync::{mpsc, watch};

use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;
use crate::model::{
    CdcFlowState, FlowConfigUpdate, FlowSignal, FlowStateChangeRequest, FlowStatus,
};

/// Stable identifier of the flow-signal channel.
pub const FLOW_SIGNAL_CHANNEL: &str = "FlowSignal";
/// Stable identifier of the state-change channel.
pub const FLOW_STATE_CHANGE_CHANNEL: &str = "FlowSignalStateChange";
/// Stable identifier of the dynamic-properties channel.
pub const CDC_DYNAMIC_PROPERTIES_CHANNEL: &str = "CDCDynamicPropertiesSignal";
/// Stable identifier of the state query.
pub const CDC_FLOW_STATE_QUERY: &str = "cdc-flow-state";
/// Stable identifier of the status query.
pub const FLOW_STATUS_QUERY: &str = "flow-status";

/// Receiver half of the signal bus, owned by the orchestrator.
///
/// Also carries the watch transmitters backing the state and status
/// queries, which only the orchestrator writes.
pub struct FlowSignalHub {
    pub(crate) flow_signal: mpsc::UnboundedReceiver<FlowSignal>,
    pub(crate) state_change: mpsc::UnboundedReceiver<FlowStateChangeRequest>,
    pub(crate) properties: mpsc::UnboundedReceiver<FlowConfigUpdate>,
    pub(crate) state_tx: watch::Sender<CdcFlowState>,
    pub(crate) status_tx: watch::Sender<FlowStatus>,
}

/// Sender half of the signal bus plus the query handles.
///
/// Cloneable; every clone addresses the same orchestrator.
#[derive(Debug, Clone)]
pub struct FlowController {
    flow_signal_tx: mpsc::UnboundedSender<FlowSignal>,
    state_change_tx: mpsc::UnboundedSender<FlowStateChangeRequest>,
    properties_tx: mpsc::UnboundedSender<FlowConfigUpdate>,
    state_rx: watch::Receiver<CdcFlowState>,
    status_rx: watch::Receiver<FlowStatus>,
}

impl FlowController {
    /// Requests the mirror to pause.
    pub fn pause(&self) -> FlowResult<()> {
        self.send_signal(FlowSignal::Pause)
    }

    /// Requests a paused mirror to resume.
    pub fn resume(&self) -> FlowResult<()> {
        self.send_signal(FlowSignal::Noop)
    }

    /// Routes a requested flow state to the appropriate channel.
    ///
    /// Paused and Running travel as flow signals, matching how the route
    /// service drives them; Terminating and Resync go to the state-change
    /// channel. Other statuses are rejected. A config update piggybacked on
    /// a pause/resume request is forwarded on the properties channel first,
    /// so it is visible when the signal wakes the orchestrator.
    pub fn request_state_change(&self, request: FlowStateChangeRequest) -> FlowResult<()> {
        match request.requested_flow_state {
            FlowStatus::Paused | FlowStatus::Running => {
                if let Some(update) = request.flow_config_update.clone() {
                    self.update_properties(update)?;
                }
                if request.requested_flow_state == FlowStatus::Paused {
                    self.pause()
                } else {
                    self.resume()
                }
            }
            FlowStatus::Terminating | FlowStatus::Resync => self
                .state_change_tx
                .send(request)
                .map_err(|_| mirror_gone(FLOW_STATE_CHANGE_CHANNEL)),
            other => Err(flow_error!(
                ErrorKind::InvalidState,
                "requested flow state is not signalable",
                other
            )),
        }
    }

    /// Delivers a configuration delta on the dynamic-properties channel.
    pub fn update_properties(&self, update: FlowConfigUpdate) -> FlowResult<()> {
        self.properties_tx
            .send(update)
            .map_err(|_| mirror_gone(CDC_DYNAMIC_PROPERTIES_CHANNEL))
    }

    /// Returns the latest published durable state.
    pub fn state(&self) -> CdcFlowState {
        self.state_rx.borrow().clone()
    }

    /// Returns the latest published status.
    pub fn status(&self) -> FlowStatus {
        *self.status_rx.borrow()
    }

    /// Waits until the mirror publishes the given status.
    ///
    /// Returns an error if the orchestrator ends without reaching it.
    pub async fn wait_for_status(&self, status: FlowStatus) -> FlowResult<()> {
        let mut rx = self.status_rx.clone();
        rx.wait_for(|current| *current == status)
            .await
            .map(|_| ())
            .map_err(|_| {
                flow_error!(
                    ErrorKind::InvalidState,
                    "mirror ended before reaching the awaited status",
                    status
                )
            })
    }

    fn send_signal(&self, signal: FlowSignal) -> FlowResult<()> {
        self.flow_signal_tx
            .send(signal)
            .map_err(|_| mirror_gone(FLOW_SIGNAL_CHANNEL))
    }
}

fn mirror_gone(channel: &'static str) -> FlowError {
    flow_error!(
        ErrorKind::InvalidState,
        "mirror is no longer receiving signals",
        channel
    )
}

/// Creates the signal bus for one mirror.
pub fn create_signal_hub() -> (FlowController, FlowSignalHub) {
    let (flow_signal_tx, flow_signal) = mpsc::unbounded_channel();
    let (state_change_tx, state_change) = mpsc::unbounded_channel();
    let (properties_tx, properties) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(CdcFlowState::default());
    let (status_tx, status_rx) = watch::channel(FlowStatus::default());

    let controller = FlowController {
        flow_signal_tx,
        state_change_tx,
        properties_tx,
        state_rx,
        status_rx,
    };
    let hub = FlowSignalHub {
        flow_signal,
        state_change,
        properties,
        state_tx,
        status_tx,
    };

    (controller, hub)
}

/// Global maintenance phase consumed by orchestrators.
///
/// While maintenance is [`MaintenancePhase::Enabled`], main loops rotate
/// their pass at the next selector step so workers can be drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaintenancePhase {
    Start,
    #[default]
    End,
    Enabled,
}

/// Creates a maintenance phase channel, initially out of maintenance.
pub fn create_maintenance_channel()
-> (watch::Sender<MaintenancePhase>, watch::Receiver<MaintenancePhase>) {
    watch::channel(MaintenancePhase::End)
}
