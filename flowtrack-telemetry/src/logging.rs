//! ## flowtrack-telemetry::logging
//! **`tracing` subscriber setup**
//!
//! `RUST_LOG` wins over the configured level when set.

use flowtrack_core::alloc::stats::FlowStats;
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global fmt subscriber. Fails if one is already set.
    pub fn init(level: &str) -> Result<(), TryInitError> {
        use tracing_subscriber::util::SubscriberInitExt;

        fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
            )
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .finish()
            .try_init()
    }

    /// Emits one summary line for a stats snapshot.
    pub fn log_stats(stats: &FlowStats) {
        info!(
            memuse = stats.memuse,
            memcap = stats.memcap,
            active = stats.active,
            spare = stats.spare,
            emergency = stats.emergency,
            evicted = stats.evicted,
            exhausted = stats.exhausted,
            "Flow engine stats"
        );
    }
}
