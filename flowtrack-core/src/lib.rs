//! # flowtrack-core
//!
//! Flow tracking engine: a bucket-locked flow table, a spare pool under a
//! memory cap, per-protocol idle timeouts and a flow manager that evicts
//! idle flows and switches to shorter timeouts under memory pressure.
//!
//! ### Key Submodules:
//! - `engine`: [`FlowEngine`], the shared context workers call per packet
//! - `table`: bucketed hash table and the [`FlowHandle`] returned per packet
//! - `alloc`: spare pool and memory accounting
//! - `timeout`: per-protocol normal and emergency timeouts
//! - `manager`: [`FlowManager`], eviction and emergency mode
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use flowtrack_core::prelude::*;
//!
//! let engine = FlowEngine::init(FlowConfig::default()).unwrap();
//! let key = FlowKey::new(
//!     IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
//!     IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
//!     40000,
//!     80,
//!     6,
//! );
//! let mut flow = engine.find_or_create(&key, Timestamp::from_secs(1)).unwrap();
//! flow.record_packet(60);
//! engine.release_handle(flow);
//! ```

pub mod alloc;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod manager;
pub mod table;
pub mod time;
pub mod timeout;

pub use engine::{FlowEngine, FLOW_SIZE};
pub use error::FlowError;
pub use manager::FlowManager;
pub use table::FlowHandle;

pub mod prelude {
    pub use crate::alloc::stats::FlowStats;
    pub use crate::config::{EmergencyThresholds, FlowConfig};
    pub use crate::engine::{FlowEngine, FLOW_SIZE};
    pub use crate::error::FlowError;
    pub use crate::flow::key::FlowKey;
    pub use crate::flow::proto::{FlowProtoHandler, FlowProtoKind, ProtoRegistry};
    pub use crate::flow::{Direction, Flow, FlowState};
    pub use crate::manager::{FlowManager, ManagerShutdown, ScanReport};
    pub use crate::table::FlowHandle;
    pub use crate::time::{Clock, Timestamp, VirtualClock, WallClock};
    pub use crate::timeout::{ProtoTimeouts, TimeoutPolicy};
}
