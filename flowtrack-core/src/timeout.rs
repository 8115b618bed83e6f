//! ## flowtrack-core::timeout
//! **Per-protocol idle timeouts**
//!
//! Every protocol family carries a normal and an emergency timeout for each
//! lifecycle state. Emergency values are never longer than the normal ones;
//! [`TimeoutPolicy::validate`] refuses a table that breaks this.

use std::time::Duration;

use crate::error::FlowError;
use crate::flow::proto::FlowProtoKind;
use crate::flow::FlowState;
use crate::time::Timestamp;

/// Idle timeouts for one protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoTimeouts {
    pub new: Duration,
    pub established: Duration,
    pub closed: Duration,
    pub emergency_new: Duration,
    pub emergency_established: Duration,
    pub emergency_closed: Duration,
}

impl ProtoTimeouts {
    /// Builds a table from whole seconds, normal values first.
    pub const fn from_secs(normal: [u64; 3], emergency: [u64; 3]) -> Self {
        Self {
            new: Duration::from_secs(normal[0]),
            established: Duration::from_secs(normal[1]),
            closed: Duration::from_secs(normal[2]),
            emergency_new: Duration::from_secs(emergency[0]),
            emergency_established: Duration::from_secs(emergency[1]),
            emergency_closed: Duration::from_secs(emergency[2]),
        }
    }

    #[inline]
    pub const fn get(&self, state: FlowState, emergency: bool) -> Duration {
        match (state, emergency) {
            (FlowState::New, false) => self.new,
            (FlowState::Established, false) => self.established,
            (FlowState::Closed, false) => self.closed,
            (FlowState::New, true) => self.emergency_new,
            (FlowState::Established, true) => self.emergency_established,
            (FlowState::Closed, true) => self.emergency_closed,
        }
    }

    fn validate(&self, kind: FlowProtoKind) -> Result<(), FlowError> {
        let pairs = [
            ("new", self.new, self.emergency_new),
            ("established", self.established, self.emergency_established),
            ("closed", self.closed, self.emergency_closed),
        ];
        for (state, normal, emergency) in pairs {
            // A zero normal timeout leaves nothing to shorten.
            if emergency > normal || (!normal.is_zero() && emergency == normal) {
                return Err(FlowError::ConfigInvalid(format!(
                    "{} {state} emergency timeout {}s must be shorter than normal timeout {}s",
                    kind.as_str(),
                    emergency.as_secs(),
                    normal.as_secs()
                )));
            }
        }
        Ok(())
    }
}

impl Default for ProtoTimeouts {
    fn default() -> Self {
        Self::from_secs([30, 300, 0], [10, 100, 0])
    }
}

/// Timeout table for every protocol family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    table: [ProtoTimeouts; 5],
}

impl TimeoutPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, kind: FlowProtoKind, timeouts: ProtoTimeouts) -> &mut Self {
        self.table[kind.index()] = timeouts;
        self
    }

    pub fn get(&self, kind: FlowProtoKind) -> &ProtoTimeouts {
        &self.table[kind.index()]
    }

    /// Timeout for a flow of IP protocol `protocol` in `state`.
    #[inline]
    pub fn timeout_for(&self, protocol: u8, state: FlowState, emergency: bool) -> Duration {
        self.timeout_for_kind(FlowProtoKind::from_ip_proto(protocol), state, emergency)
    }

    #[inline]
    pub fn timeout_for_kind(&self, kind: FlowProtoKind, state: FlowState, emergency: bool) -> Duration {
        self.table[kind.index()].get(state, emergency)
    }

    /// `now - last_seen >= timeout`, evaluated with the given mode.
    #[inline]
    pub fn is_expired(
        &self,
        kind: FlowProtoKind,
        state: FlowState,
        last_seen: Timestamp,
        now: Timestamp,
        emergency: bool,
    ) -> bool {
        now.saturating_duration_since(last_seen) >= self.timeout_for_kind(kind, state, emergency)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        FlowProtoKind::ALL
            .iter()
            .try_for_each(|kind| self.table[kind.index()].validate(*kind))
    }
}
