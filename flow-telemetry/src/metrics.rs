use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::trace;

/// Port the standalone Prometheus scrape endpoint listens on.
const METRICS_PORT: u16 = 9000;

/// Interval between recorder upkeep passes.
const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

// The Prometheus recorder is process-global and can only be installed once,
// but tests initialize telemetry repeatedly, so the handle is cached behind
// a mutex (initialization is fallible, which rules out `Once`).
static PROMETHEUS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

// Guards the listener-based installation, which never hands out a handle.
static RECORDER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs the Prometheus recorder and returns a handle for rendering.
///
/// Intended for services that expose `/metrics` through their own HTTP
/// surface. Subsequent calls return the cached handle.
pub fn init_metrics_handle() -> Result<PrometheusHandle, BuildError> {
    let mut cached = PROMETHEUS_HANDLE.lock().unwrap();
    if let Some(handle) = &*cached {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    *cached = Some(handle.clone());
    RECORDER_INSTALLED.store(true, Ordering::SeqCst);
    spawn_upkeep_task(handle.clone());

    Ok(handle)
}

/// Installs the Prometheus recorder with a scrape listener on `[::]:9000`.
///
/// Intended for standalone services such as the flow worker. Must be called
/// from within a Tokio runtime.
pub fn init_metrics() -> Result<(), BuildError> {
    if RECORDER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let address = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), METRICS_PORT);
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
}

// Upkeep bounds the recorder's memory for histograms that are registered
// but rarely scraped.
fn spawn_upkeep_task(handle: PrometheusHandle) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(UPKEEP_INTERVAL).await;
            trace!("running metrics upkeep");
            handle.run_upkeep();
        }
    });
}
