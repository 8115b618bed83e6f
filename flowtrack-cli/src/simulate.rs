//! Synthetic traffic against a live engine and manager.
//!
//! Workers draw flow identities from a fixed population and push packets
//! through `find_or_create` on a shared virtual clock. The manager runs on
//! the tokio runtime at its configured cadence and scans at the virtual time.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use flowtrack_core::prelude::*;
use flowtrack_telemetry::MetricsRecorder;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub workers: usize,
    pub packets_per_worker: u64,
    pub flows: u32,
    pub packet_gap: Duration,
    pub close_rate: f64,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct SimulationSummary {
    pub packets: u64,
    pub tracked: u64,
    pub untracked: u64,
    pub elapsed: Duration,
    /// Engine counters before shutdown.
    pub stats: FlowStats,
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerTally {
    tracked: u64,
    untracked: u64,
}

/// Identity number `n` of the population, as seen from the client side.
fn identity(n: u32) -> FlowKey {
    let [_, b, c, d] = n.to_be_bytes();
    let (protocol, dst_port) = match n % 10 {
        0..=5 => (6, 443),
        6..=8 => (17, 53),
        _ => (1, 0),
    };
    FlowKey::new(
        IpAddr::V4(Ipv4Addr::new(10, b, c, d)),
        IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
        1024 + (n % 60_000) as u16,
        dst_port,
        protocol,
    )
}

fn drive_worker(
    engine: &FlowEngine,
    clock: &VirtualClock,
    plan: &SimulationPlan,
    worker: usize,
) -> Result<WorkerTally, FlowError> {
    let mut rng = SmallRng::seed_from_u64(plan.seed.wrapping_add(worker as u64));
    let mut tally = WorkerTally::default();

    for _ in 0..plan.packets_per_worker {
        clock.advance(plan.packet_gap);
        let key = identity(rng.random_range(0..plan.flows));
        let key = if rng.random_bool(0.5) { key } else { key.reverse() };

        match engine.find_or_create(&key, clock.now()) {
            Ok(mut flow) => {
                tally.tracked += 1;
                flow.record_packet(rng.random_range(64..1500));
                if flow.state() == FlowState::New && !flow.is_new() {
                    flow.set_state(FlowState::Established);
                }
                if rng.random_bool(plan.close_rate) {
                    flow.set_state(FlowState::Closed);
                }
            }
            Err(FlowError::ResourceExhausted) => tally.untracked += 1,
            Err(e) => return Err(e),
        }
    }
    Ok(tally)
}

pub async fn run(
    plan: SimulationPlan,
    config: FlowConfig,
    metrics: &MetricsRecorder,
) -> anyhow::Result<SimulationSummary> {
    let engine = Arc::new(FlowEngine::init(config).context("Failed to start flow engine")?);
    let clock = VirtualClock::default();

    let manager = FlowManager::new(engine.clone(), Arc::new(clock.clone()));
    let shutdown = manager.shutdown_handle();
    let pass_metrics = metrics.clone();
    let manager_task = tokio::spawn(manager.run_with(move |report| pass_metrics.observe_scan(report)));

    info!(
        workers = plan.workers,
        packets = plan.packets_per_worker,
        flows = plan.flows,
        seed = plan.seed,
        "Simulation started"
    );
    let started = Instant::now();

    let plan = Arc::new(plan);
    let workers: Vec<_> = (0..plan.workers)
        .map(|worker| {
            let engine = engine.clone();
            let clock = clock.clone();
            let plan = plan.clone();
            tokio::task::spawn_blocking(move || drive_worker(&engine, &clock, &plan, worker))
        })
        .collect();

    let mut totals = WorkerTally::default();
    for worker in workers {
        let tally = worker.await.context("Worker panicked")??;
        totals.tracked += tally.tracked;
        totals.untracked += tally.untracked;
    }
    let elapsed = started.elapsed();

    shutdown.trigger();
    manager_task.await.context("Flow manager panicked")?;

    let stats = engine.stats();
    metrics.record(&stats);
    if let Err(e) = engine.shutdown() {
        warn!(error = %e, "Flow engine shutdown reported a problem");
    }

    Ok(SimulationSummary {
        packets: totals.tracked + totals.untracked,
        tracked: totals.tracked,
        untracked: totals.untracked,
        elapsed,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_distinct_and_spread_over_protocols() {
        let keys: Vec<_> = (0..1000).map(identity).collect();
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
        assert_eq!(keys.iter().filter(|k| k.protocol == 6).count(), 600);
        assert_eq!(keys.iter().filter(|k| k.protocol == 1).count(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn small_run_accounts_every_packet() {
        let metrics = MetricsRecorder::new().unwrap();
        let plan = SimulationPlan {
            workers: 2,
            packets_per_worker: 5_000,
            flows: 500,
            packet_gap: Duration::from_millis(10),
            close_rate: 0.1,
            seed: 7,
        };
        let config = FlowConfig {
            hash_size: 256,
            memcap: 200 * FLOW_SIZE,
            prealloc: 20,
            ..FlowConfig::default()
        };

        let summary = run(plan, config, &metrics).await.unwrap();
        assert_eq!(summary.packets, 10_000);
        assert_eq!(summary.tracked + summary.untracked, summary.packets);
        assert!(summary.untracked > 0);
        assert!(summary.stats.memuse <= summary.stats.memcap);
        assert_eq!(
            summary.stats.memuse,
            (summary.stats.active + summary.stats.spare) as u64 * FLOW_SIZE
        );
        assert!(metrics.gather_metrics().unwrap().contains("flowtrack_flows_exhausted_total"));
    }
}
