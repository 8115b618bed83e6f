//! ## flowtrack-telemetry::metrics
//! **Prometheus export of flow engine statistics**
//!
//! Gauges mirror the current snapshot. Counters track the engine's own
//! monotonic counters: each `record` adds the difference since the last one.

use flowtrack_core::alloc::stats::FlowStats;
use flowtrack_core::manager::ScanReport;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    memuse: IntGauge,
    memcap: IntGauge,
    spare: IntGauge,
    active: IntGauge,
    emergency: IntGauge,
    allocated: IntCounter,
    reused: IntCounter,
    evicted: IntCounter,
    freed: IntCounter,
    exhausted: IntCounter,
    emergency_entered: IntCounter,
    scan_passes: IntCounter,
    scan_duration: Histogram,
}

impl MetricsRecorder {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let memuse = gauge("flowtrack_memuse_bytes", "Bytes of flow memory in use")?;
        let memcap = gauge("flowtrack_memcap_bytes", "Configured flow memory cap")?;
        let spare = gauge("flowtrack_spare_flows", "Flows in the spare pool")?;
        let active = gauge("flowtrack_active_flows", "Flows linked in the flow table")?;
        let emergency = gauge("flowtrack_emergency", "1 while in emergency mode")?;
        let allocated = counter("flowtrack_flows_allocated_total", "Flow objects allocated")?;
        let reused = counter("flowtrack_flows_reused_total", "Flows taken from the spare pool")?;
        let evicted = counter("flowtrack_flows_evicted_total", "Idle flows evicted by the manager")?;
        let freed = counter("flowtrack_flows_freed_total", "Flow objects deallocated")?;
        let exhausted = counter(
            "flowtrack_flows_exhausted_total",
            "Lookups that found neither a spare flow nor memcap room",
        )?;
        let emergency_entered = counter(
            "flowtrack_emergency_entered_total",
            "Transitions into emergency mode",
        )?;
        let scan_passes = counter("flowtrack_manager_passes_total", "Flow manager passes")?;

        let scan_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flowtrack_manager_pass_seconds",
                "Flow manager pass duration",
            )
            .buckets(vec![0.0001, 0.001, 0.01, 0.1, 1.0]),
        )?;
        registry.register(Box::new(scan_duration.clone()))?;

        Ok(Self {
            registry,
            memuse,
            memcap,
            spare,
            active,
            emergency,
            allocated,
            reused,
            evicted,
            freed,
            exhausted,
            emergency_entered,
            scan_passes,
            scan_duration,
        })
    }

    /// Brings every metric up to `stats`.
    pub fn record(&self, stats: &FlowStats) {
        self.memuse.set(clamp(stats.memuse));
        self.memcap.set(clamp(stats.memcap));
        self.spare.set(clamp(stats.spare as u64));
        self.active.set(clamp(stats.active as u64));
        self.emergency.set(i64::from(stats.emergency));

        advance(&self.allocated, stats.allocated);
        advance(&self.reused, stats.reused);
        advance(&self.evicted, stats.evicted);
        advance(&self.freed, stats.freed);
        advance(&self.exhausted, stats.exhausted);
        advance(&self.emergency_entered, stats.emergency_entered);
    }

    pub fn observe_scan(&self, report: &ScanReport) {
        self.scan_passes.inc();
        self.scan_duration.observe(report.duration.as_secs_f64());
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn advance(counter: &IntCounter, total: u64) {
    let delta = total.saturating_sub(counter.get());
    if delta > 0 {
        counter.inc_by(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn record_tracks_snapshot() {
        let metrics = MetricsRecorder::new().unwrap();
        let mut stats = FlowStats {
            memuse: 2048,
            memcap: 8192,
            spare: 4,
            active: 12,
            emergency: true,
            evicted: 5,
            ..FlowStats::default()
        };
        metrics.record(&stats);
        stats.evicted = 9;
        stats.emergency = false;
        metrics.record(&stats);
        metrics.record(&stats);

        assert_eq!(metrics.memuse.get(), 2048);
        assert_eq!(metrics.active.get(), 12);
        assert_eq!(metrics.emergency.get(), 0);
        assert_eq!(metrics.evicted.get(), 9);
    }

    #[test]
    fn exposition_lists_flow_metrics() {
        let metrics = MetricsRecorder::new().unwrap();
        metrics.record(&FlowStats {
            active: 3,
            ..FlowStats::default()
        });
        metrics.observe_scan(&ScanReport {
            duration: Duration::from_micros(250),
            ..ScanReport::default()
        });

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("flowtrack_active_flows 3"));
        assert!(text.contains("flowtrack_manager_passes_total 1"));
        assert!(text.contains("flowtrack_manager_pass_seconds_count 1"));
    }
}
