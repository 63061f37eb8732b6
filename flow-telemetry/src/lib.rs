//! Telemetry bootstrap for the flow services: tracing subscribers and the
//! Prometheus metrics recorder.

pub mod metrics;
pub mod tracing;
