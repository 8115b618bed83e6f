//! ## flowtrack-core::flow
//! **The tracked flow and its identity**
//!
//! A [`Flow`] object lives in exactly one place at a time: linked into a
//! flow table bucket, parked in the spare pool, or freed. The location tag
//! on the flow records which, and every transition checks it.

pub mod key;
pub mod proto;

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::time::Timestamp;
use key::FlowKey;
use proto::FlowProtoKind;

/// Shared slot holding one flow object. Bucket chains and the spare pool
/// store these; the allocation is what gets recycled.
pub type FlowRef = Arc<Mutex<Flow>>;

/// Lifecycle state driving timeout selection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    #[default]
    New,
    Established,
    Closed,
}

/// Where a flow object currently lives.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FlowLocation {
    /// Freshly allocated or just unlinked, owned by whoever holds it.
    #[default]
    Detached,
    Table,
    Spare,
}

/// Packet direction relative to the packet that created the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

/// Tracked state for one bidirectional conversation.
pub struct Flow {
    key: Option<FlowKey>,
    proto: FlowProtoKind,
    state: FlowState,
    start_ts: Timestamp,
    last_ts: Timestamp,
    location: FlowLocation,
    proto_state: Option<Box<dyn Any + Send>>,
    to_server_pkts: u64,
    to_client_pkts: u64,
    to_server_bytes: u64,
    to_client_bytes: u64,
}

impl Flow {
    pub(crate) fn empty() -> Self {
        Self {
            key: None,
            proto: FlowProtoKind::Default,
            state: FlowState::New,
            start_ts: Timestamp::ZERO,
            last_ts: Timestamp::ZERO,
            location: FlowLocation::Detached,
            proto_state: None,
            to_server_pkts: 0,
            to_client_pkts: 0,
            to_server_bytes: 0,
            to_client_bytes: 0,
        }
    }

    pub(crate) fn new_ref() -> FlowRef {
        Arc::new(Mutex::new(Self::empty()))
    }

    /// Prepares a clean flow object for `key`, first seen at `now`.
    pub(crate) fn init(&mut self, key: FlowKey, now: Timestamp) {
        debug_assert!(self.key.is_none() && self.proto_state.is_none());
        self.key = Some(key);
        self.proto = FlowProtoKind::from_ip_proto(key.protocol);
        self.state = FlowState::New;
        self.start_ts = now;
        self.last_ts = now;
    }

    /// Wipes identity, counters and protocol state.
    pub(crate) fn clear(&mut self) {
        let location = self.location;
        *self = Self::empty();
        self.location = location;
    }

    #[inline]
    pub(crate) fn touch(&mut self, now: Timestamp) {
        if now > self.last_ts {
            self.last_ts = now;
        }
    }

    #[inline]
    pub(crate) fn location(&self) -> FlowLocation {
        self.location
    }

    #[inline]
    pub(crate) fn set_location(&mut self, location: FlowLocation) {
        self.location = location;
    }

    /// Identity as seen on the packet that created the flow. `None` for a
    /// recycled object that has not been re-initialized.
    pub fn key(&self) -> Option<&FlowKey> {
        self.key.as_ref()
    }

    pub fn proto(&self) -> FlowProtoKind {
        self.proto
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn set_state(&mut self, state: FlowState) {
        self.state = state;
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    pub fn last_ts(&self) -> Timestamp {
        self.last_ts
    }

    /// Counts one packet of `bytes` in `direction`.
    pub fn record_packet(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::ToServer => {
                self.to_server_pkts += 1;
                self.to_server_bytes += bytes;
            }
            Direction::ToClient => {
                self.to_client_pkts += 1;
                self.to_client_bytes += bytes;
            }
        }
    }

    /// (packets, bytes) seen in `direction`.
    pub fn counters(&self, direction: Direction) -> (u64, u64) {
        match direction {
            Direction::ToServer => (self.to_server_pkts, self.to_server_bytes),
            Direction::ToClient => (self.to_client_pkts, self.to_client_bytes),
        }
    }

    pub fn has_proto_state(&self) -> bool {
        self.proto_state.is_some()
    }

    /// Attaches collaborator state, replacing any previous state.
    pub fn set_proto_state<T: Any + Send>(&mut self, state: T) {
        self.proto_state = Some(Box::new(state));
    }

    pub fn proto_state<T: Any + Send>(&self) -> Option<&T> {
        self.proto_state.as_ref()?.downcast_ref::<T>()
    }

    pub fn proto_state_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.proto_state.as_mut()?.downcast_mut::<T>()
    }

    pub fn take_proto_state(&mut self) -> Option<Box<dyn Any + Send>> {
        self.proto_state.take()
    }

    pub fn clear_proto_state(&mut self) {
        self.proto_state = None;
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("key", &self.key)
            .field("proto", &self.proto)
            .field("state", &self.state)
            .field("start_ts", &self.start_ts)
            .field("last_ts", &self.last_ts)
            .field("location", &self.location)
            .field("has_proto_state", &self.proto_state.is_some())
            .finish()
    }
}
