use std::future::Future;

use crate::error::FlowResult;

/// Trait for background workers in the flow system.
///
/// Workers return handles that can be used to monitor their progress and
/// wait for completion. The generic parameter `H` is the handle type
/// returned when the worker starts, and `S` the state type accessible
/// through the handle.
pub trait Worker<H, S>
where
    H: WorkerHandle<S>,
{
    /// Error type returned when worker startup fails.
    type Error;

    /// Starts the worker and returns a handle for monitoring its execution.
    fn start(self) -> impl Future<Output = Result<H, Self::Error>> + Send;
}

/// Handle for monitoring and controlling a running worker.
///
/// The state is a snapshot; holding it gives no guarantee about the
/// worker's current progress.
pub trait WorkerHandle<S> {
    /// Value produced when the worker completes.
    type Output;

    /// Returns the current state of the worker.
    fn state(&self) -> S;

    /// Waits for the worker to complete and returns the final result.
    fn wait(self) -> impl Future<Output = FlowResult<Self::Output>> + Send;
}
