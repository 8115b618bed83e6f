//! # flowtrack telemetry
//!
//! Log subscriber setup and Prometheus export of flow engine statistics.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::MetricsRecorder;
