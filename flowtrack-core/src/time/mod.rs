//! ## flowtrack-core::time
//! **Flow timestamps and clock sources**
//!
//! All flow bookkeeping runs on [`Timestamp`], a nanosecond counter. The
//! engine never reads a clock itself: callers pass `now` into
//! `find_or_create`, and the flow manager pulls it from a [`Clock`].
//! [`VirtualClock`] drives deterministic tests and simulations,
//! [`WallClock`] drives live deployments.

use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Point in time, in nanoseconds since an arbitrary epoch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    #[inline]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    #[inline]
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let ns = u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(ns))
    }
}

/// Source of "now" for the flow manager.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Manually advanced clock backed by an atomic counter.
///
/// Clones share the same counter, so a worker advancing time is observed by
/// the manager holding another clone.
#[derive(Clone, Debug, Default)]
pub struct VirtualClock {
    offset: Arc<AtomicU64>, // Nanoseconds
}

impl VirtualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            offset: Arc::new(AtomicU64::new(start.as_nanos())),
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn advance(&self, by: Duration) {
        let ns = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.offset.fetch_add(ns, Ordering::Release);
    }

    /// Moves the clock to `to`. Never goes backwards.
    pub fn set(&self, to: Timestamp) {
        self.offset.fetch_max(to.as_nanos(), Ordering::AcqRel);
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.now_ns())
    }
}

/// System time since the Unix epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> Timestamp {
        let ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Timestamp::from_nanos(ns)
    }
}
