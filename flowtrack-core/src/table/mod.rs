//! ## flowtrack-core::table
//! **Bucketed flow hash table**
//!
//! A fixed array of buckets, each with its own lock and a collision chain of
//! live flows. Lookups only ever hold one bucket lock, and only for the
//! chain walk plus an O(1) head insert.
//!
//! A chain entry keeps its own copy of the flow key, so walking a chain
//! never touches a flow's lock. The entry's `Arc` is the only reference to
//! an idle flow; a handle holds a second one. The manager relies on that:
//! under the bucket lock, a flow whose strong count is above one is in use
//! and is skipped.

mod handle;

pub use handle::FlowHandle;

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FlowError;
use crate::flow::key::{FlowHasher, FlowKey};
use crate::flow::{Direction, Flow, FlowLocation, FlowRef};
use crate::time::Timestamp;

struct ChainEntry {
    key: FlowKey,
    flow: FlowRef,
}

#[derive(Default)]
struct FlowBucket {
    chain: Mutex<VecDeque<ChainEntry>>,
}

/// Outcome of a table lookup. Every variant carries the locked flow.
#[derive(Debug)]
pub(crate) enum Lookup {
    Found(FlowHandle),
    /// Linked by this lookup.
    Created(FlowHandle),
    /// Matched a flow past its timeout. It is still linked, with its old
    /// identity and state.
    Expired(FlowHandle),
}

/// Outcome of sweeping one bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BucketSweep {
    pub checked: usize,
    pub evicted: usize,
    pub in_use: usize,
}

pub struct FlowTable {
    buckets: Box<[FlowBucket]>,
    hasher: FlowHasher,
}

impl FlowTable {
    /// Creates a table with `size` buckets.
    ///
    /// # Panics
    /// If `size` is zero.
    pub fn new(size: usize, seed: u64) -> Self {
        assert!(size > 0, "Flow table needs at least one bucket");
        Self {
            buckets: (0..size).map(|_| FlowBucket::default()).collect(),
            hasher: FlowHasher::new(seed),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn bucket_index(&self, key: &FlowKey) -> usize {
        (self.hasher.hash(key) % self.buckets.len() as u64) as usize
    }

    /// Returns the flow for `key`, locked for the caller, or links the flow
    /// produced by `obtain` at the head of the bucket chain.
    ///
    /// A matching flow for which `expired` holds comes back as
    /// [`Lookup::Expired`]: still linked and locked, for the caller to
    /// start over. `obtain` runs under the bucket lock and must not call
    /// back into the table.
    pub(crate) fn get_or_insert<E, F>(
        &self,
        key: &FlowKey,
        now: Timestamp,
        expired: E,
        obtain: F,
    ) -> Result<Lookup, FlowError>
    where
        E: FnOnce(&Flow) -> bool,
        F: FnOnce() -> Result<FlowRef, FlowError>,
    {
        let bucket = &self.buckets[self.bucket_index(key)];
        let mut chain = bucket.chain.lock();

        let found = chain.iter().find_map(|entry| {
            entry
                .key
                .direction_of(key)
                .map(|direction| (entry.flow.clone(), direction))
        });
        if let Some((flow, direction)) = found {
            // The extra reference keeps the manager away once the bucket is
            // unlocked, so waiting on the flow lock happens bucket-free.
            drop(chain);
            let mut guard = match flow.try_lock_arc() {
                Some(guard) => guard,
                None if handle::held_by_current_thread(&flow) => {
                    return Err(FlowError::InvariantViolation(
                        "flow looked up again while this thread holds its handle".into(),
                    ));
                }
                None => flow.lock_arc(),
            };
            drop(flow);

            if expired(&*guard) {
                return Ok(Lookup::Expired(FlowHandle::new(guard, Direction::ToServer, true)));
            }
            // Direction follows the flow's own key, which a restart while
            // this lookup waited may have flipped.
            let direction = guard
                .key()
                .and_then(|flow_key| flow_key.direction_of(key))
                .unwrap_or(direction);
            guard.touch(now);
            return Ok(Lookup::Found(FlowHandle::new(guard, direction, false)));
        }

        let flow = obtain()?;
        let mut guard = flow.lock_arc();
        debug_assert_eq!(guard.location(), FlowLocation::Detached);
        guard.init(*key, now);
        guard.set_location(FlowLocation::Table);
        chain.push_front(ChainEntry { key: *key, flow });
        drop(chain);

        Ok(Lookup::Created(FlowHandle::new(guard, Direction::ToServer, true)))
    }

    /// Unlinks idle flows of bucket `index` for which `expired` holds and
    /// appends them to `out`.
    ///
    /// Flows referenced by a handle are skipped, never waited on. `expired`
    /// runs under the bucket lock.
    pub(crate) fn sweep_bucket<F>(&self, index: usize, mut expired: F, out: &mut Vec<FlowRef>) -> BucketSweep
    where
        F: FnMut(&Flow) -> bool,
    {
        let mut sweep = BucketSweep::default();
        let mut chain = self.buckets[index].chain.lock();
        chain.retain(|entry| {
            sweep.checked += 1;
            if Arc::strong_count(&entry.flow) > 1 {
                sweep.in_use += 1;
                return true;
            }
            let Some(mut flow) = entry.flow.try_lock() else {
                sweep.in_use += 1;
                return true;
            };
            if !expired(&*flow) {
                return true;
            }
            flow.set_location(FlowLocation::Detached);
            drop(flow);
            out.push(entry.flow.clone());
            sweep.evicted += 1;
            false
        });
        sweep
    }

    /// Unlinks every flow of bucket `index` without locking them.
    ///
    /// Flows still referenced by a handle come back with a strong count
    /// above one and keep their `Table` tag.
    pub(crate) fn drain_bucket(&self, index: usize) -> Vec<FlowRef> {
        let drained = std::mem::take(&mut *self.buckets[index].chain.lock());
        drained.into_iter().map(|entry| entry.flow).collect()
    }

    /// Whether a flow for `key` (either direction) is linked.
    pub fn contains(&self, key: &FlowKey) -> bool {
        self.buckets[self.bucket_index(key)]
            .chain
            .lock()
            .iter()
            .any(|entry| entry.key.direction_of(key).is_some())
    }

    /// Number of linked flows. Locks every bucket in turn.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.chain.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn flow_ptrs(&self) -> Vec<*const Mutex<Flow>> {
        self.buckets
            .iter()
            .flat_map(|bucket| {
                bucket
                    .chain
                    .lock()
                    .iter()
                    .map(|entry| Arc::as_ptr(&entry.flow))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl std::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTable")
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}
