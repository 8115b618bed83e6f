//! ## flowtrack-core::manager
//! **Flow eviction and emergency mode**
//!
//! The manager walks the table one bucket at a time, evicts idle flows,
//! keeps the spare pool at its target size and decides when the engine runs
//! in emergency mode. It is the only writer of the emergency flag.
//!
//! Mode changes:
//! - NORMAL to EMERGENCY when a worker failed to get a flow since the last
//!   pass, or when memory use is at the high water mark with the spare pool
//!   at or below its minimum. Checked at the start of a pass and again after
//!   eviction.
//! - EMERGENCY to NORMAL only at the start of a pass, with no failed
//!   acquisition since the last pass, memory use below the low water mark
//!   and the spare pool back at its minimum.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::engine::FlowEngine;
use crate::error::FlowError;
use crate::time::{Clock, Timestamp};

/// Summary of one manager pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub buckets_scanned: usize,
    pub flows_checked: usize,
    pub evicted: usize,
    pub skipped_in_use: usize,
    pub spares_added: usize,
    pub spares_freed: usize,
    /// Stopped between buckets because of a shutdown request.
    pub interrupted: bool,
    /// Mode at the end of the pass.
    pub emergency: bool,
    pub duration: Duration,
}

/// Stop request shared between a running manager and its owner.
#[derive(Debug, Default)]
pub struct ManagerShutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl ManagerShutdown {
    /// Asks the manager to stop. A pass in progress ends at the next bucket
    /// boundary.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

pub struct FlowManager {
    engine: Arc<FlowEngine>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<ManagerShutdown>,
}

impl FlowManager {
    pub fn new(engine: Arc<FlowEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            shutdown: Arc::new(ManagerShutdown::default()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<ManagerShutdown> {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    /// Runs one pass at time `now`.
    #[instrument(level = "debug", skip_all, fields(now = now.as_nanos()))]
    pub fn scan(&self, now: Timestamp) -> Result<ScanReport, FlowError> {
        if !self.engine.is_running() {
            return Err(FlowError::ShutDown);
        }
        let started = Instant::now();
        let mut report = ScanReport::default();

        let emergency = self.update_mode_at_pass_start();
        let policy = self.engine.timeouts();
        let table = self.engine.table();
        let mut unlinked = Vec::new();

        for index in 0..table.bucket_count() {
            if self.shutdown.is_triggered() {
                report.interrupted = true;
                break;
            }
            let sweep = table.sweep_bucket(
                index,
                |flow| policy.is_expired(flow.proto(), flow.state(), flow.last_ts(), now, emergency),
                &mut unlinked,
            );
            report.buckets_scanned += 1;
            report.flows_checked += sweep.checked;
            report.skipped_in_use += sweep.in_use;

            for flow in unlinked.drain(..) {
                report.evicted += 1;
                if let Err(e) = self.engine.evict(flow) {
                    error!(error = %e, "Evicted flow could not be recycled, freed instead");
                }
            }
        }

        let spares = self.engine.maintain_spares()?;
        report.spares_added = spares.added;
        report.spares_freed = spares.freed;

        if !emergency && self.high_water_reached() {
            self.enter_emergency("memory use reached high water after eviction");
        }
        report.emergency = self.engine.is_emergency();
        report.duration = started.elapsed();

        debug!(
            checked = report.flows_checked,
            evicted = report.evicted,
            in_use = report.skipped_in_use,
            spare = self.engine.counters().spare(),
            emergency = report.emergency,
            "Flow manager pass complete"
        );
        Ok(report)
    }

    /// Applies mode transitions due at the start of a pass and returns the
    /// mode the pass runs in.
    fn update_mode_at_pass_start(&self) -> bool {
        let counters = self.engine.counters();
        let pressure = counters.take_pressure();

        if !counters.is_emergency() {
            if pressure {
                self.enter_emergency("flow acquisition failed since last pass");
            } else if self.high_water_reached() {
                self.enter_emergency("memory use at high water with spare pool depleted");
            }
        } else if !pressure && self.recovered() {
            counters.set_emergency(false);
            info!(
                memuse = counters.memuse(),
                spare = counters.spare(),
                "Flow engine left emergency mode"
            );
        }
        counters.is_emergency()
    }

    fn high_water_reached(&self) -> bool {
        let config = self.engine.config();
        let counters = self.engine.counters();
        counters.memuse() >= config.emergency.high_water(config.memcap)
            && counters.spare() <= config.emergency.min_spare(config.prealloc)
    }

    fn recovered(&self) -> bool {
        let config = self.engine.config();
        let counters = self.engine.counters();
        counters.memuse() < config.emergency.low_water(config.memcap)
            && counters.spare() >= config.emergency.min_spare(config.prealloc)
    }

    fn enter_emergency(&self, reason: &'static str) {
        let counters = self.engine.counters();
        if !counters.set_emergency(true) {
            info!(
                reason,
                memuse = counters.memuse(),
                memcap = self.engine.config().memcap,
                spare = counters.spare(),
                "Flow engine entered emergency mode"
            );
        }
    }

    /// Scans until shut down, sleeping the normal or emergency interval
    /// between passes.
    pub async fn run(self) {
        self.run_with(|_| {}).await
    }

    /// Like [`run`](Self::run), handing each pass report to `on_pass`.
    pub async fn run_with<F>(self, mut on_pass: F)
    where
        F: FnMut(&ScanReport) + Send,
    {
        info!(
            buckets = self.engine.table().bucket_count(),
            "Flow manager started"
        );
        while !self.shutdown.is_triggered() {
            match self.scan(self.clock.now()) {
                Ok(report) => on_pass(&report),
                Err(FlowError::ShutDown) => break,
                Err(e) => error!(error = %e, "Flow manager pass failed"),
            }

            let config = self.engine.config();
            let interval = if self.engine.is_emergency() {
                config.emergency_scan_interval
            } else {
                config.scan_interval
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.notify.notified() => {}
            }
        }
        info!("Flow manager stopped");
    }

    /// Spawns [`run`](Self::run) on the current tokio runtime.
    ///
    /// Trigger the returned [`ManagerShutdown`] and await the task before
    /// calling [`FlowEngine::shutdown`].
    pub fn spawn(self) -> (JoinHandle<()>, Arc<ManagerShutdown>) {
        let shutdown = self.shutdown_handle();
        (tokio::spawn(self.run()), shutdown)
    }
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager")
            .field("engine", &self.engine)
            .field("shutdown", &self.shutdown.is_triggered())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowConfig;
    use crate::engine::FLOW_SIZE;
    use crate::flow::key::FlowKey;
    use crate::flow::FlowState;
    use crate::time::VirtualClock;
    use std::net::{IpAddr, Ipv4Addr};
    use tracing_test::traced_test;

    fn tcp(port: u16) -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port,
            443,
            6,
        )
    }

    fn manager(flows: u64, prealloc: usize) -> (FlowManager, VirtualClock) {
        let engine = FlowEngine::init(FlowConfig {
            hash_size: 32,
            hash_seed: 9,
            memcap: flows * FLOW_SIZE,
            prealloc,
            ..FlowConfig::default()
        })
        .unwrap();
        let clock = VirtualClock::new(Timestamp::ZERO);
        (FlowManager::new(Arc::new(engine), Arc::new(clock.clone())), clock)
    }

    #[test]
    fn idle_flows_expire_and_busy_ones_survive() {
        let (manager, _) = manager(100, 0);
        let engine = manager.engine().clone();
        drop(engine.find_or_create(&tcp(1), Timestamp::ZERO).unwrap());
        let held = engine.find_or_create(&tcp(2), Timestamp::ZERO).unwrap();

        let report = manager.scan(Timestamp::from_secs(29)).unwrap();
        assert_eq!(report.evicted, 0);
        assert_eq!(report.flows_checked, 2);
        assert_eq!(report.skipped_in_use, 1);

        let report = manager.scan(Timestamp::from_secs(30)).unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.buckets_scanned, 32);
        assert!(engine.table().contains(&tcp(2)));
        drop(held);

        let report = manager.scan(Timestamp::from_secs(30)).unwrap();
        assert_eq!(report.evicted, 1);
        assert!(engine.table().is_empty());
        assert_eq!(engine.stats().evicted, 2);
    }

    #[test]
    fn activity_postpones_expiry() {
        let (manager, _) = manager(100, 0);
        let engine = manager.engine().clone();
        drop(engine.find_or_create(&tcp(1), Timestamp::ZERO).unwrap());
        drop(engine.find_or_create(&tcp(1).reverse(), Timestamp::from_secs(25)).unwrap());

        assert_eq!(manager.scan(Timestamp::from_secs(40)).unwrap().evicted, 0);
        assert_eq!(manager.scan(Timestamp::from_secs(55)).unwrap().evicted, 1);
    }

    #[test]
    #[traced_test]
    fn pressure_enters_emergency_at_next_pass() {
        let (manager, _) = manager(1, 0);
        let engine = manager.engine().clone();
        drop(engine.find_or_create(&tcp(1), Timestamp::ZERO).unwrap());
        assert_eq!(
            engine.find_or_create(&tcp(2), Timestamp::ZERO).unwrap_err(),
            FlowError::ResourceExhausted
        );

        let report = manager.scan(Timestamp::from_secs(5)).unwrap();
        assert!(report.emergency);
        assert_eq!(report.evicted, 0);
        assert!(logs_contain("Flow engine entered emergency mode"));

        // Emergency timeout for new TCP flows is 10s.
        let report = manager.scan(Timestamp::from_secs(10)).unwrap();
        assert_eq!(report.evicted, 1);
        assert!(report.emergency);

        let report = manager.scan(Timestamp::from_secs(11)).unwrap();
        assert!(!report.emergency);
        assert!(logs_contain("Flow engine left emergency mode"));
        assert_eq!(engine.stats().emergency_entered, 1);
    }

    #[test]
    fn high_water_needs_depleted_spares() {
        // 19 preallocated flows put memory use at the 95% mark from the start.
        let (manager, _) = manager(20, 19);
        let engine = manager.engine().clone();
        assert!(!manager.scan(Timestamp::ZERO).unwrap().emergency);

        // Minimum spare level is 30% of 19, so 5.
        let handles: Vec<_> = (0..15)
            .map(|port| engine.find_or_create(&tcp(port), Timestamp::ZERO).unwrap())
            .collect();
        assert_eq!(engine.stats().spare, 4);

        let report = manager.scan(Timestamp::ZERO).unwrap();
        assert!(report.emergency);
        assert_eq!(report.spares_added, 1);
        assert_eq!(engine.stats().memuse, 20 * FLOW_SIZE);
        drop(handles);
    }

    #[test]
    fn closed_flows_go_first() {
        let (manager, _) = manager(100, 0);
        let engine = manager.engine().clone();
        let mut handle = engine.find_or_create(&tcp(1), Timestamp::ZERO).unwrap();
        handle.set_state(FlowState::Closed);
        drop(handle);
        drop(engine.find_or_create(&tcp(2), Timestamp::ZERO).unwrap());

        let report = manager.scan(Timestamp::ZERO).unwrap();
        assert_eq!(report.evicted, 1);
        assert!(!engine.table().contains(&tcp(1)));
        assert!(engine.table().contains(&tcp(2)));
    }

    #[test]
    fn triggered_shutdown_interrupts_between_buckets() {
        let (manager, _) = manager(10, 0);
        manager.shutdown_handle().trigger();
        let report = manager.scan(Timestamp::ZERO).unwrap();
        assert!(report.interrupted);
        assert_eq!(report.buckets_scanned, 0);
    }

    #[test]
    fn scan_after_engine_shutdown_fails() {
        let (manager, _) = manager(10, 0);
        manager.engine().shutdown().unwrap();
        assert_eq!(manager.scan(Timestamp::ZERO).unwrap_err(), FlowError::ShutDown);
    }

    #[tokio::test(start_paused = true)]
    async fn background_manager_evicts_on_clock() {
        let (manager, clock) = manager(100, 0);
        let engine = manager.engine().clone();
        drop(engine.find_or_create(&tcp(7), clock.now()).unwrap());

        let (task, shutdown) = manager.spawn();
        clock.advance(Duration::from_secs(31));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(engine.table().is_empty());

        shutdown.trigger();
        task.await.unwrap();
    }
}
