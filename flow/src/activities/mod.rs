//! Long-running operations the orchestrator drives but does not implement.
//!
//! Connectors provide the implementation; the orchestrator only cares about
//! the contracts: idempotency of the publication alters, cancellation of
//! the sync, and the execution bounds below.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{FlowError, FlowResult};
use crate::model::{FlowConnectionConfigs, RenameTablesInput, SyncFlowOptions, TableMapping};

/// Bound for best-effort status writes to the catalog.
pub const STATUS_UPDATE_TIMEOUT: Duration = Duration::from_secs(60);
/// Bound for best-effort config uploads to the catalog.
pub const CONFIG_UPLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Bound for one publication alter attempt.
pub const PUBLICATION_ALTER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Bound for the shadow-table rename; the swap may wait on large merges.
pub const RENAME_TABLES_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);
/// Bound for one sync activity execution.
pub const SYNC_FLOW_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Initial interval between attempts of retried table-removal activities.
pub const TABLE_REMOVAL_RETRY_INITIAL: Duration = Duration::from_secs(60);
/// Ceiling for the interval between retried attempts.
pub const TABLE_REMOVAL_RETRY_MAX: Duration = Duration::from_secs(10 * 60);
/// Attempts before a retried activity is given up on.
pub const TABLE_REMOVAL_MAX_ATTEMPTS: u32 = 20;

/// The activity surface of a mirror.
///
/// Implementations must be cheap to clone; the orchestrator clones them
/// into spawned tasks.
pub trait FlowActivities: Clone + Send + Sync + 'static {
    /// Runs continuous CDC until cancelled or the configured number of
    /// syncs is reached. Implementations heartbeat at least once a minute.
    fn sync_flow(
        &self,
        cfg: FlowConnectionConfigs,
        options: SyncFlowOptions,
        cancel_rx: ShutdownRx,
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Extends the source publication with the given tables. Idempotent.
    fn add_tables_to_publication(
        &self,
        cfg: &FlowConnectionConfigs,
        tables: &[TableMapping],
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Removes the given tables from the source publication. Idempotent.
    fn remove_tables_from_publication(
        &self,
        cfg: &FlowConnectionConfigs,
        tables: &[TableMapping],
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Purges staged rows belonging to the removed tables.
    fn remove_tables_from_raw_table(
        &self,
        cfg: &FlowConnectionConfigs,
        tables: &[TableMapping],
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Deletes the mapping rows of the removed tables from the catalog.
    fn remove_tables_from_catalog(
        &self,
        cfg: &FlowConnectionConfigs,
        tables: &[TableMapping],
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Swaps `<name>_resync` tables over their originals, atomically per
    /// table.
    fn rename_tables(
        &self,
        input: RenameTablesInput,
    ) -> impl Future<Output = FlowResult<()>> + Send;
}

/// Runs a fallible activity with exponential backoff between attempts.
///
/// The interval starts at `initial_interval` and doubles up to
/// [`TABLE_REMOVAL_RETRY_MAX`]. The last error is returned once
/// `max_attempts` is exhausted.
pub async fn run_with_retries<T, F, Fut>(
    description: &'static str,
    initial_interval: Duration,
    max_attempts: u32,
    mut op: F,
) -> FlowResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FlowResult<T>>,
{
    let mut interval = initial_interval;
    let mut last_error: Option<FlowError> = None;

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    activity = description,
                    attempt,
                    max_attempts,
                    error = %err,
                    "activity attempt failed"
                );
                last_error = Some(err);
            }
        }

        if attempt < max_attempts {
            sleep(interval).await;
            interval = (interval * 2).min(TABLE_REMOVAL_RETRY_MAX);
        }
    }

    // max_attempts is at least 1, so an error is always recorded here.
    Err(last_error.expect("retried activity finished without a result"))
}
