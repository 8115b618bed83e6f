//! ## flowtrack-core::alloc::stats
//! **Engine-wide flow counters**
//!
//! Memory use and spare count are the two counters the memcap and the
//! emergency logic depend on. Both are plain atomics: each is individually
//! consistent, and a brief window where memory is accounted before the flow
//! object lands in the table or the pool is acceptable.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// Counters shared by the flow table, the spare pool and the flow manager.
///
/// The two hot counters sit on their own cache lines so worker threads
/// bumping `memuse` do not invalidate the line holding `spare`.
#[derive(Debug, Default)]
pub struct FlowCounters {
    memuse: CachePadded<AtomicU64>,
    spare: CachePadded<AtomicUsize>,
    active: AtomicUsize,
    emergency: AtomicBool,
    pressure: AtomicBool,
    allocated: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    freed: AtomicU64,
    exhausted: AtomicU64,
    emergency_entered: AtomicU64,
}

impl FlowCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently accounted against the memcap.
    #[inline]
    pub fn memuse(&self) -> u64 {
        self.memuse.load(Ordering::Acquire)
    }

    /// Accounts `size` bytes if that keeps usage at or below `memcap`.
    ///
    /// Returns `false` without touching the counter otherwise.
    #[inline]
    pub fn try_reserve(&self, size: u64, memcap: u64) -> bool {
        self.memuse
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|next| *next <= memcap)
            })
            .is_ok()
    }

    #[inline]
    pub fn unreserve(&self, size: u64) {
        self.memuse.fetch_sub(size, Ordering::AcqRel);
    }

    /// Number of flows sitting in the spare pool.
    #[inline]
    pub fn spare(&self) -> usize {
        self.spare.load(Ordering::Acquire)
    }

    #[inline]
    pub fn increment_spare(&self) {
        self.spare.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn decrement_spare(&self) {
        self.spare.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of flows linked into the flow table.
    #[inline]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn increment_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decrement_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::Acquire)
    }

    /// Sets the emergency flag and returns the previous value.
    pub fn set_emergency(&self, on: bool) -> bool {
        let was = self.emergency.swap(on, Ordering::AcqRel);
        if on && !was {
            self.emergency_entered.fetch_add(1, Ordering::Relaxed);
        }
        was
    }

    /// Records a failed acquisition. Returns `true` if this is the first
    /// failure since the manager last consumed the signal.
    #[inline]
    pub fn signal_pressure(&self) -> bool {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
        !self.pressure.swap(true, Ordering::AcqRel)
    }

    /// Clears the pressure signal and reports whether it was raised.
    #[inline]
    pub fn take_pressure(&self) -> bool {
        self.pressure.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub fn increment_allocated(&self) {
        self.allocated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_freed(&self) {
        self.freed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn freed(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn emergency_entered(&self) -> u64 {
        self.emergency_entered.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of the engine counters.
///
/// Fields are read one by one, so a snapshot taken under load may mix
/// values from slightly different moments.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    pub memuse: u64,
    pub memcap: u64,
    pub spare: usize,
    pub active: usize,
    pub emergency: bool,
    pub allocated: u64,
    pub reused: u64,
    pub evicted: u64,
    pub freed: u64,
    pub exhausted: u64,
    pub emergency_entered: u64,
}

impl FlowCounters {
    pub fn snapshot(&self, memcap: u64) -> FlowStats {
        FlowStats {
            memuse: self.memuse(),
            memcap,
            spare: self.spare(),
            active: self.active(),
            emergency: self.is_emergency(),
            allocated: self.allocated(),
            reused: self.reused(),
            evicted: self.evicted(),
            freed: self.freed(),
            exhausted: self.exhausted(),
            emergency_entered: self.emergency_entered(),
        }
    }
}
