//! Flow manager cadence and emergency mode thresholds.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

/// Water marks are percentages of the memcap. The recovery level is the
/// percentage of `flow.prealloc` that must be spare again before emergency
/// mode can end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "crate::validation::validate_water_marks"))]
#[serde(default)]
pub struct ManagerSettings {
    #[validate(range(min = 1, max = 100))]
    pub emergency_high_water: u8,

    #[validate(range(max = 99))]
    pub emergency_low_water: u8,

    #[validate(range(max = 100))]
    pub emergency_recovery: u8,

    /// Pause between passes in normal mode.
    #[validate(range(min = 1, max = 3600000))]
    pub scan_interval_ms: u64,

    /// Pause between passes in emergency mode.
    #[validate(range(min = 1, max = 3600000))]
    pub emergency_scan_interval_ms: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            emergency_high_water: 95,
            emergency_low_water: 80,
            emergency_recovery: 30,
            scan_interval_ms: 1000,
            emergency_scan_interval_ms: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_water_must_stay_below_high_water() {
        let settings = ManagerSettings {
            emergency_low_water: 95,
            ..ManagerSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn emergency_interval_not_longer_than_normal() {
        let settings = ManagerSettings {
            emergency_scan_interval_ms: 5000,
            ..ManagerSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
