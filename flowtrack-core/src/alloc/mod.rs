//! ## flowtrack-core::alloc
//! **Spare flows and memory accounting**
//!
//! - `pool`: stack of reset flow objects ready for reuse
//! - `stats`: memuse, spare count, emergency flag and event counters

pub mod pool;
pub mod stats;
