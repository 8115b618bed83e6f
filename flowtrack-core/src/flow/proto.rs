//! Per-protocol capability hooks.
//!
//! Protocol collaborators (TCP tracking, app-layer parsers) keep their own
//! state inside a flow. They register a [`FlowProtoHandler`] per
//! [`FlowProtoKind`] at init so the engine can clean that state up on
//! timeout and before the flow object is reused.

use std::sync::Arc;

use super::Flow;

/// Protocol families with independent timeouts and handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProtoKind {
    Default,
    Tcp,
    Udp,
    Icmp,
    Sctp,
}

impl FlowProtoKind {
    pub const ALL: [FlowProtoKind; 5] = [
        FlowProtoKind::Default,
        FlowProtoKind::Tcp,
        FlowProtoKind::Udp,
        FlowProtoKind::Icmp,
        FlowProtoKind::Sctp,
    ];

    /// Maps an IP protocol number to its family. Unknown protocols use
    /// [`FlowProtoKind::Default`].
    #[inline]
    pub const fn from_ip_proto(protocol: u8) -> Self {
        match protocol {
            6 => FlowProtoKind::Tcp,
            17 => FlowProtoKind::Udp,
            1 | 58 => FlowProtoKind::Icmp,
            132 => FlowProtoKind::Sctp,
            _ => FlowProtoKind::Default,
        }
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        match self {
            FlowProtoKind::Default => 0,
            FlowProtoKind::Tcp => 1,
            FlowProtoKind::Udp => 2,
            FlowProtoKind::Icmp => 3,
            FlowProtoKind::Sctp => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            FlowProtoKind::Default => "default",
            FlowProtoKind::Tcp => "tcp",
            FlowProtoKind::Udp => "udp",
            FlowProtoKind::Icmp => "icmp",
            FlowProtoKind::Sctp => "sctp",
        }
    }
}

/// Hooks the engine calls on a flow outside of any bucket lock.
///
/// Implementations must be bounded and must not block: they run on the flow
/// manager's scan path and on the shutdown path.
pub trait FlowProtoHandler: Send + Sync {
    /// Releases protocol state before the flow is recycled or freed.
    fn reset_state(&self, flow: &mut Flow) {
        flow.clear_proto_state();
    }

    /// Called when the manager evicts an idle flow, before `reset_state`.
    fn on_timeout(&self, _flow: &mut Flow) {}
}

/// Handler used for every protocol nobody registered for.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProtoHandler;

impl FlowProtoHandler for DefaultProtoHandler {}

/// Handler table indexed by [`FlowProtoKind`].
#[derive(Clone)]
pub struct ProtoRegistry {
    handlers: [Arc<dyn FlowProtoHandler>; 5],
}

impl ProtoRegistry {
    pub fn new() -> Self {
        let default: Arc<dyn FlowProtoHandler> = Arc::new(DefaultProtoHandler);
        Self {
            handlers: std::array::from_fn(|_| default.clone()),
        }
    }

    pub fn register(&mut self, kind: FlowProtoKind, handler: Arc<dyn FlowProtoHandler>) -> &mut Self {
        self.handlers[kind.index()] = handler;
        self
    }

    #[inline]
    pub fn handler(&self, kind: FlowProtoKind) -> &dyn FlowProtoHandler {
        self.handlers[kind.index()].as_ref()
    }
}

impl Default for ProtoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProtoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtoRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn maps_ip_protocols() {
        assert_eq!(FlowProtoKind::from_ip_proto(6), FlowProtoKind::Tcp);
        assert_eq!(FlowProtoKind::from_ip_proto(17), FlowProtoKind::Udp);
        assert_eq!(FlowProtoKind::from_ip_proto(1), FlowProtoKind::Icmp);
        assert_eq!(FlowProtoKind::from_ip_proto(58), FlowProtoKind::Icmp);
        assert_eq!(FlowProtoKind::from_ip_proto(132), FlowProtoKind::Sctp);
        assert_eq!(FlowProtoKind::from_ip_proto(47), FlowProtoKind::Default);
    }

    #[test]
    fn indices_are_distinct() {
        let mut seen = [false; 5];
        for kind in FlowProtoKind::ALL {
            assert!(!seen[kind.index()]);
            seen[kind.index()] = true;
        }
    }

    struct Counting(AtomicUsize);

    impl FlowProtoHandler for Counting {
        fn on_timeout(&self, _flow: &mut Flow) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn registered_handler_is_dispatched_by_kind() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let mut registry = ProtoRegistry::new();
        registry.register(FlowProtoKind::Udp, counting.clone());

        let mut flow = Flow::empty();
        registry.handler(FlowProtoKind::Udp).on_timeout(&mut flow);
        registry.handler(FlowProtoKind::Tcp).on_timeout(&mut flow);
        assert_eq!(counting.0.load(Ordering::Relaxed), 1);
    }
}
