//! Engine configuration, validated once at init.
//!
//! File and environment loading lives in `flowtrack-config`; this is the
//! resolved form the engine runs with.

use std::time::Duration;

use crate::error::FlowError;
use crate::timeout::TimeoutPolicy;

/// Memory-pressure thresholds driving emergency mode.
///
/// Percentages of the memcap for the water marks, percentage of the
/// prealloc count for the spare minimum. Entering happens at or above the
/// high mark, leaving only below the low mark, so the gap between the two
/// keeps the mode from flapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyThresholds {
    pub high_water_pct: u8,
    pub low_water_pct: u8,
    pub recovery_pct: u8,
}

impl EmergencyThresholds {
    pub fn high_water(&self, memcap: u64) -> u64 {
        percent_of(memcap, self.high_water_pct)
    }

    pub fn low_water(&self, memcap: u64) -> u64 {
        percent_of(memcap, self.low_water_pct)
    }

    /// Spares required before emergency mode may be left.
    pub fn min_spare(&self, prealloc: usize) -> usize {
        percent_of(prealloc as u64, self.recovery_pct) as usize
    }
}

impl Default for EmergencyThresholds {
    fn default() -> Self {
        Self {
            high_water_pct: 95,
            low_water_pct: 80,
            recovery_pct: 30,
        }
    }
}

fn percent_of(value: u64, pct: u8) -> u64 {
    (u128::from(value) * u128::from(pct) / 100) as u64
}

/// Flow engine configuration.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Number of hash buckets.
    pub hash_size: usize,
    /// Hash seed; 0 picks a random one at init.
    pub hash_seed: u64,
    /// Upper bound on flow memory, in bytes.
    pub memcap: u64,
    /// Flows allocated into the spare pool at init, and the spare level
    /// the manager maintains.
    pub prealloc: usize,
    pub timeouts: TimeoutPolicy,
    pub emergency: EmergencyThresholds,
    pub scan_interval: Duration,
    pub emergency_scan_interval: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            hash_size: 65536,
            hash_seed: 0,
            memcap: 32 * 1024 * 1024,
            prealloc: 10000,
            timeouts: TimeoutPolicy::default(),
            emergency: EmergencyThresholds::default(),
            scan_interval: Duration::from_secs(1),
            emergency_scan_interval: Duration::from_millis(250),
        }
    }
}

impl FlowConfig {
    /// Checks the configuration against a flow object size of `flow_size`
    /// bytes.
    pub fn validate(&self, flow_size: u64) -> Result<(), FlowError> {
        if self.hash_size == 0 {
            return Err(invalid("hash_size must be greater than zero"));
        }
        if self.memcap == 0 {
            return Err(invalid("memcap must be greater than zero"));
        }
        if self.memcap < flow_size {
            return Err(invalid(format!(
                "memcap {} is smaller than a single flow ({flow_size} bytes)",
                self.memcap
            )));
        }
        let prealloc_bytes = (self.prealloc as u64).saturating_mul(flow_size);
        if prealloc_bytes > self.memcap {
            return Err(invalid(format!(
                "prealloc of {} flows needs {prealloc_bytes} bytes, above memcap {}",
                self.prealloc, self.memcap
            )));
        }

        let e = &self.emergency;
        if e.high_water_pct > 100 || e.recovery_pct > 100 {
            return Err(invalid("emergency percentages must not exceed 100"));
        }
        if e.low_water_pct >= e.high_water_pct {
            return Err(invalid(format!(
                "emergency low water ({}%) must be below high water ({}%)",
                e.low_water_pct, e.high_water_pct
            )));
        }
        if self.scan_interval.is_zero() || self.emergency_scan_interval.is_zero() {
            return Err(invalid("scan intervals must be greater than zero"));
        }
        if self.emergency_scan_interval > self.scan_interval {
            return Err(invalid("emergency scan interval must not exceed the normal one"));
        }

        self.timeouts.validate()
    }
}

fn invalid(msg: impl Into<String>) -> FlowError {
    FlowError::ConfigInvalid(msg.into())
}
