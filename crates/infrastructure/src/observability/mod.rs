//! Observability module
//!
//! This module provides the observability stack used by every node:
//! - Structured logging and OpenTelemetry trace export
//! - Metrics collection and Prometheus exposition
//! - Trace context capture at schedule time and restoration at execution time

pub mod cross_component_tracer;
pub mod metrics_collector;
pub mod task_tracer;
pub mod telemetry_setup;

pub use cross_component_tracer::CrossComponentTracer;
pub use metrics_collector::MetricsCollector;
pub use task_tracer::TaskTracer;
pub use telemetry_setup::{init_metrics, init_observability, TelemetryGuard};
