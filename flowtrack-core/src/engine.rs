//! ## flowtrack-core::engine
//! **The flow engine context**
//!
//! [`FlowEngine`] owns the flow table, the spare pool and the counters.
//! Workers share it through an `Arc` and call [`FlowEngine::find_or_create`]
//! once per packet; the [`FlowManager`](crate::manager::FlowManager) holds
//! another reference and does eviction and pool upkeep.

use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::alloc::pool::SparePool;
use crate::alloc::stats::{FlowCounters, FlowStats};
use crate::config::FlowConfig;
use crate::error::FlowError;
use crate::flow::key::FlowKey;
use crate::flow::proto::ProtoRegistry;
use crate::flow::{Flow, FlowRef};
use crate::table::{FlowHandle, FlowTable, Lookup};
use crate::time::Timestamp;
use crate::timeout::TimeoutPolicy;

/// Bytes accounted against the memcap per flow object: the locked flow, the
/// two `Arc` counts in front of it and the chain entry pointing at it.
pub const FLOW_SIZE: u64 =
    (size_of::<Mutex<Flow>>() + 2 * size_of::<usize>() + size_of::<FlowKey>() + size_of::<FlowRef>()) as u64;

/// Spare pool changes made by one maintenance run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpareMaintenance {
    pub added: usize,
    pub freed: usize,
}

pub struct FlowEngine {
    config: FlowConfig,
    table: FlowTable,
    pool: SparePool,
    counters: Arc<FlowCounters>,
    protos: ProtoRegistry,
    running: AtomicBool,
}

impl FlowEngine {
    /// Validates `config`, builds the table and preallocates spare flows.
    pub fn init(config: FlowConfig) -> Result<Self, FlowError> {
        Self::with_protos(config, ProtoRegistry::new())
    }

    /// Like [`init`](Self::init), with protocol handlers registered.
    pub fn with_protos(config: FlowConfig, protos: ProtoRegistry) -> Result<Self, FlowError> {
        config.validate(FLOW_SIZE)?;

        let seed = if config.hash_seed == 0 {
            rand::random::<u64>()
        } else {
            config.hash_seed
        };
        let counters = Arc::new(FlowCounters::new());
        let engine = Self {
            table: FlowTable::new(config.hash_size, seed),
            pool: SparePool::with_capacity(config.prealloc, counters.clone()),
            counters,
            protos,
            running: AtomicBool::new(true),
            config,
        };

        let prealloc = engine.top_up_spares()?;
        if prealloc < engine.config.prealloc {
            return Err(FlowError::InvariantViolation(format!(
                "preallocated {prealloc} of {} flows within memcap",
                engine.config.prealloc
            )));
        }

        let low_water = engine.config.emergency.low_water(engine.config.memcap);
        if engine.counters.memuse() >= low_water {
            warn!(
                memuse = engine.counters.memuse(),
                low_water, "Preallocated flows alone reach the emergency low water mark"
            );
        }

        info!(
            buckets = engine.table.bucket_count(),
            memcap = engine.config.memcap,
            prealloc,
            flow_size = FLOW_SIZE,
            "Flow engine initialized"
        );
        Ok(engine)
    }

    /// Returns the flow for `key` locked for the caller, creating it if
    /// needed.
    ///
    /// A linked flow already past its timeout is not resumed: it goes
    /// through the timeout and reset hooks and starts over as a new flow for
    /// this packet.
    ///
    /// `ResourceExhausted` means the packet goes untracked; the manager is
    /// told to consider emergency mode. `InvariantViolation` means the
    /// calling thread already holds a handle for this flow.
    pub fn find_or_create(&self, key: &FlowKey, now: Timestamp) -> Result<FlowHandle, FlowError> {
        if !self.is_running() {
            return Err(FlowError::ShutDown);
        }
        let emergency = self.is_emergency();
        let expired = |flow: &Flow| {
            self.config
                .timeouts
                .is_expired(flow.proto(), flow.state(), flow.last_ts(), now, emergency)
        };

        match self.table.get_or_insert(key, now, expired, || self.acquire())? {
            Lookup::Found(handle) => Ok(handle),
            Lookup::Created(handle) => {
                self.counters.increment_active();
                trace!(?key, "Flow created");
                Ok(handle)
            }
            Lookup::Expired(mut handle) => {
                self.restart_expired(&mut handle, key, now);
                Ok(handle)
            }
        }
    }

    /// Gives the flow back to the table. Same as dropping the handle.
    pub fn release_handle(&self, handle: FlowHandle) {
        drop(handle);
    }

    /// Runs under the bucket lock of the flow being created.
    fn acquire(&self) -> Result<FlowRef, FlowError> {
        // Shutdown drains each bucket under its lock after clearing the
        // flag, so a flow created here is always seen by the drain.
        if !self.is_running() {
            return Err(FlowError::ShutDown);
        }
        if let Some(flow) = self.pool.pop() {
            self.counters.increment_reused();
            return Ok(flow);
        }
        if self.counters.try_reserve(FLOW_SIZE, self.config.memcap) {
            self.counters.increment_allocated();
            return Ok(Flow::new_ref());
        }
        if self.counters.signal_pressure() {
            warn!(
                memuse = self.counters.memuse(),
                memcap = self.config.memcap,
                "Flow memcap reached with no spare flow, packets go untracked"
            );
        }
        Err(FlowError::ResourceExhausted)
    }

    /// Expires a flow found by a lookup and reinitializes it in place for
    /// `key`. It stays linked, so the active count is unchanged.
    fn restart_expired(&self, flow: &mut Flow, key: &FlowKey, now: Timestamp) {
        trace!(old = ?flow.key(), state = ?flow.state(), "Restarting expired flow");
        let handler = self.protos.handler(flow.proto());
        handler.on_timeout(flow);
        handler.reset_state(flow);
        flow.clear();
        flow.init(*key, now);
        self.counters.increment_evicted();
    }

    /// Takes an idle flow unlinked by the manager: timeout hook, reset, back
    /// to the pool.
    pub(crate) fn evict(&self, flow: FlowRef) -> Result<(), FlowError> {
        {
            let mut guard = flow.lock();
            trace!(key = ?guard.key(), state = ?guard.state(), "Evicting idle flow");
            let handler = self.protos.handler(guard.proto());
            handler.on_timeout(&mut guard);
            handler.reset_state(&mut guard);
            guard.clear();
        }
        self.counters.decrement_active();
        self.counters.increment_evicted();
        self.release(flow)
    }

    /// Parks a reset flow in the pool, or frees it once shut down.
    ///
    /// A flow the pool refuses is freed and the refusal returned.
    pub(crate) fn release(&self, flow: FlowRef) -> Result<(), FlowError> {
        if !self.is_running() {
            self.free(flow);
            return Ok(());
        }
        if let Err(rejected) = self.pool.push(flow) {
            self.free(rejected.flow);
            return Err(rejected.error);
        }
        self.free_spares_if_stopped();
        Ok(())
    }

    /// Drops the memory charge of `flow` along with the reference. Anyone
    /// else still holding it keeps an unaccounted object.
    fn free(&self, flow: FlowRef) {
        drop(flow);
        self.counters.unreserve(FLOW_SIZE);
        self.counters.increment_freed();
    }

    fn free_spares(&self) {
        self.pool.drain().into_iter().for_each(|flow| self.free(flow));
    }

    /// Catches spares pushed after a concurrent shutdown drained the pool.
    fn free_spares_if_stopped(&self) {
        if !self.is_running() {
            self.free_spares();
        }
    }

    /// Frees spares above the prealloc target, then allocates up to it while
    /// the memcap allows.
    pub(crate) fn maintain_spares(&self) -> Result<SpareMaintenance, FlowError> {
        if !self.is_running() {
            return Ok(SpareMaintenance::default());
        }
        let surplus = self.pool.trim_to(self.config.prealloc);
        let freed = surplus.len();
        surplus.into_iter().for_each(|flow| self.free(flow));

        let added = self.top_up_spares()?;
        self.free_spares_if_stopped();
        if added > 0 || freed > 0 {
            debug!(added, freed, spare = self.counters.spare(), "Spare pool adjusted");
        }
        Ok(SpareMaintenance { added, freed })
    }

    fn top_up_spares(&self) -> Result<usize, FlowError> {
        let mut added = 0;
        while self.pool.len() < self.config.prealloc {
            if !self.counters.try_reserve(FLOW_SIZE, self.config.memcap) {
                break;
            }
            self.counters.increment_allocated();
            if let Err(rejected) = self.pool.push(Flow::new_ref()) {
                self.free(rejected.flow);
                return Err(rejected.error);
            }
            added += 1;
        }
        Ok(added)
    }

    /// Stops the engine and frees every flow.
    ///
    /// Stop workers and the manager first. A flow still held by a handle is
    /// unlinked and its memory released from the accounting, but the call
    /// reports `InvariantViolation`. Calling again is a no-op.
    pub fn shutdown(&self) -> Result<(), FlowError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut outstanding = 0usize;
        for index in 0..self.table.bucket_count() {
            for flow in self.table.drain_bucket(index) {
                self.counters.decrement_active();
                match Arc::try_unwrap(flow) {
                    Ok(mutex) => {
                        let mut flow = mutex.into_inner();
                        self.protos.handler(flow.proto()).reset_state(&mut flow);
                        drop(flow);
                        self.counters.unreserve(FLOW_SIZE);
                        self.counters.increment_freed();
                    }
                    Err(_held) => {
                        outstanding += 1;
                        self.counters.unreserve(FLOW_SIZE);
                        self.counters.increment_freed();
                    }
                }
            }
        }
        self.free_spares();

        info!(
            memuse = self.counters.memuse(),
            freed = self.counters.freed(),
            "Flow engine shut down"
        );
        if outstanding > 0 {
            return Err(FlowError::InvariantViolation(format!(
                "{outstanding} flow handles still held at shutdown"
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_emergency(&self) -> bool {
        self.counters.is_emergency()
    }

    pub fn stats(&self) -> FlowStats {
        self.counters.snapshot(self.config.memcap)
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn timeouts(&self) -> &TimeoutPolicy {
        &self.config.timeouts
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    pub(crate) fn counters(&self) -> &FlowCounters {
        &self.counters
    }

    pub const fn flow_size() -> u64 {
        FLOW_SIZE
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("table", &self.table)
            .field("stats", &self.stats())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::proto::{FlowProtoHandler, FlowProtoKind};
    use crate::flow::Direction;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn config(flows: u64, prealloc: usize) -> FlowConfig {
        FlowConfig {
            hash_size: 64,
            hash_seed: 42,
            memcap: flows * FLOW_SIZE,
            prealloc,
            ..FlowConfig::default()
        }
    }

    fn udp(port: u16) -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 1, 0, 2)),
            port,
            53,
            17,
        )
    }

    #[test]
    fn prealloc_fills_pool_and_accounts_memory() {
        let engine = FlowEngine::init(config(100, 10)).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.spare, 10);
        assert_eq!(stats.memuse, 10 * FLOW_SIZE);
        assert_eq!(stats.allocated, 10);
        assert!(!stats.emergency);
    }

    #[test]
    fn rejects_invalid_config() {
        let err = FlowEngine::init(config(5, 6)).unwrap_err();
        assert!(matches!(err, FlowError::ConfigInvalid(_)));

        let err = FlowEngine::init(FlowConfig {
            memcap: FLOW_SIZE - 1,
            prealloc: 0,
            ..config(1, 0)
        })
        .unwrap_err();
        assert!(matches!(err, FlowError::ConfigInvalid(_)));
    }

    #[test]
    fn creation_prefers_spare_flows() {
        let engine = FlowEngine::init(config(100, 2)).unwrap();
        for port in 0..3 {
            let handle = engine.find_or_create(&udp(port), Timestamp::ZERO).unwrap();
            assert!(handle.is_new());
            engine.release_handle(handle);
        }
        let stats = engine.stats();
        assert_eq!(stats.reused, 2);
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.spare, 0);
        assert_eq!(stats.active, 3);
        assert_eq!(stats.memuse, 3 * FLOW_SIZE);
    }

    #[test]
    fn same_identity_yields_one_flow() {
        let engine = FlowEngine::init(config(100, 0)).unwrap();
        let key = udp(4000);
        drop(engine.find_or_create(&key, Timestamp::from_secs(1)).unwrap());
        let reply = engine.find_or_create(&key.reverse(), Timestamp::from_secs(2)).unwrap();
        assert!(!reply.is_new());
        drop(reply);

        assert_eq!(engine.stats().active, 1);
        assert_eq!(engine.table().flow_ptrs().len(), 1);
    }

    #[test]
    fn no_flow_is_linked_twice() {
        let engine = FlowEngine::init(config(1000, 0)).unwrap();
        for port in 0..200 {
            drop(engine.find_or_create(&udp(port), Timestamp::ZERO).unwrap());
            drop(engine.find_or_create(&udp(port).reverse(), Timestamp::ZERO).unwrap());
        }
        let v6 = FlowKey::new(IpAddr::V6(Ipv6Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST), 1, 2, 6);
        drop(engine.find_or_create(&v6, Timestamp::ZERO).unwrap());

        let ptrs = engine.table().flow_ptrs();
        let unique: HashSet<_> = ptrs.iter().collect();
        assert_eq!(ptrs.len(), 201);
        assert_eq!(unique.len(), ptrs.len());
    }

    #[test]
    fn exhaustion_signals_pressure_once() {
        let engine = FlowEngine::init(config(1, 0)).unwrap();
        drop(engine.find_or_create(&udp(1), Timestamp::ZERO).unwrap());
        for port in 2..5 {
            let err = engine.find_or_create(&udp(port), Timestamp::ZERO).unwrap_err();
            assert_eq!(err, FlowError::ResourceExhausted);
        }
        assert_eq!(engine.stats().exhausted, 3);
        assert!(engine.counters().take_pressure());
        // Existing flows stay reachable at the cap.
        assert!(engine.find_or_create(&udp(1), Timestamp::ZERO).is_ok());
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl FlowProtoHandler for Recorder {
        fn reset_state(&self, flow: &mut Flow) {
            self.calls.lock().push("reset");
            flow.clear_proto_state();
        }

        fn on_timeout(&self, _flow: &mut Flow) {
            self.calls.lock().push("timeout");
        }
    }

    #[test]
    fn eviction_runs_hooks_in_order_and_recycles() {
        let recorder = Arc::new(Recorder::default());
        let mut protos = ProtoRegistry::new();
        protos.register(FlowProtoKind::Udp, recorder.clone());
        let engine = FlowEngine::with_protos(config(10, 0), protos).unwrap();

        drop(engine.find_or_create(&udp(1), Timestamp::ZERO).unwrap());
        let mut unlinked = Vec::new();
        for index in 0..engine.table().bucket_count() {
            engine.table().sweep_bucket(index, |_| true, &mut unlinked);
        }
        assert_eq!(unlinked.len(), 1);
        engine.evict(unlinked.pop().unwrap()).unwrap();

        assert_eq!(*recorder.calls.lock(), vec!["timeout", "reset"]);
        let stats = engine.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.spare, 1);
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.memuse, FLOW_SIZE);
    }

    #[test]
    fn expired_match_runs_hooks_and_starts_over() {
        let recorder = Arc::new(Recorder::default());
        let mut protos = ProtoRegistry::new();
        protos.register(FlowProtoKind::Udp, recorder.clone());
        let engine = FlowEngine::with_protos(config(10, 0), protos).unwrap();

        let mut first = engine.find_or_create(&udp(1), Timestamp::ZERO).unwrap();
        first.set_proto_state(7u32);
        first.record_packet(100);
        drop(first);

        let reply = engine.find_or_create(&udp(1).reverse(), Timestamp::from_secs(31)).unwrap();
        assert!(reply.is_new());
        assert_eq!(reply.direction(), Direction::ToServer);
        assert_eq!(reply.key(), Some(&udp(1).reverse()));
        assert_eq!(reply.start_ts(), Timestamp::from_secs(31));
        assert!(!reply.has_proto_state());
        assert_eq!(reply.counters(Direction::ToServer), (0, 0));
        drop(reply);

        assert_eq!(*recorder.calls.lock(), vec!["timeout", "reset"]);
        let stats = engine.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.memuse, FLOW_SIZE);
        assert_eq!(engine.table().len(), 1);
    }

    #[test]
    fn refused_release_still_frees_memory() {
        let engine = FlowEngine::init(config(10, 0)).unwrap();
        drop(engine.find_or_create(&udp(1), Timestamp::ZERO).unwrap());
        let mut unlinked = Vec::new();
        for index in 0..engine.table().bucket_count() {
            engine.table().sweep_bucket(index, |_| true, &mut unlinked);
        }
        let flow = unlinked.pop().unwrap();
        let stray = flow.clone();

        let err = engine.evict(flow).unwrap_err();
        assert!(matches!(err, FlowError::InvariantViolation(_)));
        let stats = engine.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.spare, 0);
        assert_eq!(stats.memuse, 0);
        assert_eq!(stats.freed, 1);
        drop(stray);
    }

    #[test]
    fn maintenance_trims_and_tops_up() {
        let engine = FlowEngine::init(config(10, 2)).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|port| engine.find_or_create(&udp(port), Timestamp::ZERO).unwrap())
            .collect();
        assert_eq!(engine.stats().spare, 0);
        drop(handles);

        assert_eq!(engine.maintain_spares().unwrap(), SpareMaintenance { added: 2, freed: 0 });
        assert_eq!(engine.stats().memuse, 6 * FLOW_SIZE);

        for _ in 0..3 {
            engine.release(Flow::new_ref()).unwrap();
            assert!(engine.counters().try_reserve(FLOW_SIZE, u64::MAX));
        }
        assert_eq!(engine.maintain_spares().unwrap(), SpareMaintenance { added: 0, freed: 3 });
        assert_eq!(engine.stats().spare, 2);
        assert_eq!(engine.stats().memuse, 6 * FLOW_SIZE);
    }

    #[test]
    fn shutdown_frees_everything_and_is_idempotent() {
        let engine = FlowEngine::init(config(50, 5)).unwrap();
        for port in 0..20 {
            drop(engine.find_or_create(&udp(port), Timestamp::ZERO).unwrap());
        }
        engine.shutdown().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.memuse, 0);
        assert_eq!(stats.spare, 0);
        assert_eq!(stats.active, 0);
        assert!(engine.table().is_empty());
        assert_eq!(
            engine.find_or_create(&udp(1), Timestamp::ZERO).unwrap_err(),
            FlowError::ShutDown
        );
        engine.shutdown().unwrap();
    }

    #[test]
    fn shutdown_reports_held_handles() {
        let engine = FlowEngine::init(config(10, 0)).unwrap();
        let held = engine.find_or_create(&udp(1), Timestamp::ZERO).unwrap();
        let err = engine.shutdown().unwrap_err();
        assert!(matches!(err, FlowError::InvariantViolation(_)));
        assert_eq!(engine.stats().memuse, 0);
        drop(held);
    }
}
