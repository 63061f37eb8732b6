//! Shutdown signaling for orchestrators and long-running activities.
//!
//! A shutdown channel is a watch channel carrying a single boolean: once it
//! flips to `true` it never flips back. Receivers can poll the current value
//! or await the transition, so the signal is observed even by receivers
//! created after it was sent.

use tokio::sync::watch;

/// Transmitter side of a shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Requests shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    /// Creates a new receiver subscribed to this channel.
    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiver side of a shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Returns `true` if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until shutdown is requested.
    ///
    /// Completes immediately when shutdown was requested before the call.
    /// A dropped transmitter counts as shutdown, since no further work can
    /// be coordinated through the channel.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.0.clone();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

/// Creates a new shutdown channel in the not-shut-down state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}
