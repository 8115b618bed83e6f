//! Exclusive access to a flow for the duration of one packet.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;

use crate::flow::{Direction, Flow, FlowRef};

thread_local! {
    /// Flow slots this thread holds a handle for.
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn slot_of(flow: &FlowRef) -> usize {
    Arc::as_ptr(flow) as usize
}

/// Whether the calling thread holds a handle for `flow`.
pub(crate) fn held_by_current_thread(flow: &FlowRef) -> bool {
    let slot = slot_of(flow);
    HELD.try_with(|held| held.borrow().contains(&slot))
        .unwrap_or(false)
}

/// A flow locked for use by one packet-processing context.
///
/// While a handle exists the flow manager will not evict the flow. Dropping
/// the handle releases it; the flow stays in the table.
///
/// Looking the same flow up again on the thread holding its handle fails
/// with `InvariantViolation`. Handles stay on the thread that took them.
pub struct FlowHandle {
    guard: ArcMutexGuard<RawMutex, Flow>,
    slot: usize,
    direction: Direction,
    created: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl FlowHandle {
    pub(crate) fn new(guard: ArcMutexGuard<RawMutex, Flow>, direction: Direction, created: bool) -> Self {
        let slot = slot_of(ArcMutexGuard::mutex(&guard));
        let _ = HELD.try_with(|held| held.borrow_mut().push(slot));
        Self {
            guard,
            slot,
            direction,
            created,
            _thread_bound: PhantomData,
        }
    }

    /// Direction of the packet this handle was obtained for.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// `true` if the lookup created the flow, or started it over after it
    /// had expired.
    pub fn is_new(&self) -> bool {
        self.created
    }

    /// Counts the current packet in its direction.
    pub fn record_packet(&mut self, bytes: u64) {
        let direction = self.direction;
        self.guard.record_packet(direction, bytes);
    }
}

impl Drop for FlowHandle {
    fn drop(&mut self) {
        let slot = self.slot;
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&s| s == slot) {
                held.swap_remove(pos);
            }
        });
    }
}

impl Deref for FlowHandle {
    type Target = Flow;

    fn deref(&self) -> &Flow {
        &self.guard
    }
}

impl DerefMut for FlowHandle {
    fn deref_mut(&mut self) -> &mut Flow {
        &mut self.guard
    }
}

impl std::fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHandle")
            .field("flow", &*self.guard)
            .field("direction", &self.direction)
            .field("created", &self.created)
            .finish()
    }
}
