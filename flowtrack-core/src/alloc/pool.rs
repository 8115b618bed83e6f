//! ## flowtrack-core::alloc::pool
//! **Spare flow pool**
//!
//! A mutex-guarded stack of reset flow objects. Popping hands exclusive
//! ownership of a flow to the caller; pushing takes it back. Memory for
//! pooled flows stays accounted against the memcap, the pool only tracks
//! the spare count.

use std::sync::Arc;

use parking_lot::Mutex;

use super::stats::FlowCounters;
use crate::error::FlowError;
use crate::flow::{FlowLocation, FlowRef};

/// A flow the pool refused, handed back so its memory can be released.
#[derive(Debug)]
pub struct RejectedFlow {
    pub flow: FlowRef,
    pub error: FlowError,
}

pub struct SparePool {
    stack: Mutex<Vec<FlowRef>>,
    counters: Arc<FlowCounters>,
}

impl SparePool {
    pub fn new(counters: Arc<FlowCounters>) -> Self {
        Self::with_capacity(0, counters)
    }

    pub fn with_capacity(capacity: usize, counters: Arc<FlowCounters>) -> Self {
        Self {
            stack: Mutex::new(Vec::with_capacity(capacity)),
            counters,
        }
    }

    /// Takes the most recently stored flow, if any.
    pub fn pop(&self) -> Option<FlowRef> {
        let flow = self.stack.lock().pop()?;
        self.counters.decrement_spare();
        flow.lock().set_location(FlowLocation::Detached);
        Some(flow)
    }

    /// Stores a reset flow.
    ///
    /// Refuses flows that are still referenced elsewhere or already spare:
    /// either means a caller kept a reference to a flow it gave away.
    pub fn push(&self, flow: FlowRef) -> Result<(), RejectedFlow> {
        if let Err(error) = Self::admit(&flow) {
            return Err(RejectedFlow { flow, error });
        }
        self.stack.lock().push(flow);
        self.counters.increment_spare();
        Ok(())
    }

    fn admit(flow: &FlowRef) -> Result<(), FlowError> {
        if Arc::strong_count(flow) != 1 {
            return Err(FlowError::InvariantViolation(
                "flow returned to spare pool while still referenced".into(),
            ));
        }
        let mut guard = flow.lock();
        match guard.location() {
            FlowLocation::Spare => {
                return Err(FlowError::InvariantViolation(
                    "flow returned to spare pool twice".into(),
                ))
            }
            FlowLocation::Table => {
                return Err(FlowError::InvariantViolation(
                    "flow returned to spare pool while linked in the flow table".into(),
                ))
            }
            FlowLocation::Detached => {}
        }
        if guard.key().is_some() || guard.has_proto_state() {
            return Err(FlowError::InvariantViolation(
                "flow returned to spare pool without being reset".into(),
            ));
        }
        guard.set_location(FlowLocation::Spare);
        Ok(())
    }

    /// Removes spares beyond `target` and hands them to the caller for
    /// deallocation.
    pub fn trim_to(&self, target: usize) -> Vec<FlowRef> {
        let surplus = {
            let mut stack = self.stack.lock();
            if stack.len() <= target {
                return Vec::new();
            }
            stack.split_off(target)
        };
        for flow in &surplus {
            self.counters.decrement_spare();
            flow.lock().set_location(FlowLocation::Detached);
        }
        surplus
    }

    /// Empties the pool.
    pub fn drain(&self) -> Vec<FlowRef> {
        self.trim_to(0)
    }

    pub fn len(&self) -> usize {
        self.stack.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
