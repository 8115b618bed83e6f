//! Idle timeouts in seconds, per protocol family.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

/// Protocols not listed use `default`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct TimeoutSettings {
    #[validate(nested)]
    pub default: ProtoTimeoutSettings,
    #[validate(nested)]
    pub tcp: ProtoTimeoutSettings,
    #[validate(nested)]
    pub udp: ProtoTimeoutSettings,
    #[validate(nested)]
    pub icmp: ProtoTimeoutSettings,
    #[validate(nested)]
    pub sctp: ProtoTimeoutSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "crate::validation::validate_emergency_timeouts"))]
#[serde(default)]
pub struct ProtoTimeoutSettings {
    pub new: u64,
    pub established: u64,
    pub closed: u64,
    pub emergency_new: u64,
    pub emergency_established: u64,
    pub emergency_closed: u64,
}

impl ProtoTimeoutSettings {
    /// `(state, normal, emergency)` for each lifecycle state.
    pub fn pairs(&self) -> [(&'static str, u64, u64); 3] {
        [
            ("new", self.new, self.emergency_new),
            ("established", self.established, self.emergency_established),
            ("closed", self.closed, self.emergency_closed),
        ]
    }
}

impl Default for ProtoTimeoutSettings {
    fn default() -> Self {
        Self {
            new: 30,
            established: 300,
            closed: 0,
            emergency_new: 10,
            emergency_established: 100,
            emergency_closed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_must_be_shorter() {
        let longer = ProtoTimeoutSettings {
            emergency_established: 400,
            ..ProtoTimeoutSettings::default()
        };
        assert!(longer.validate().is_err());

        let equal = ProtoTimeoutSettings {
            emergency_new: 30,
            ..ProtoTimeoutSettings::default()
        };
        assert!(equal.validate().is_err());

        // Closed defaults are 0/0, nothing to shorten.
        ProtoTimeoutSettings::default().validate().unwrap();
    }

    #[test]
    fn nested_errors_name_the_protocol() {
        let settings = TimeoutSettings {
            sctp: ProtoTimeoutSettings {
                emergency_new: 60,
                ..ProtoTimeoutSettings::default()
            },
            ..TimeoutSettings::default()
        };
        let errors = settings.validate().unwrap_err();
        assert!(errors.errors().contains_key("sctp"));
    }
}
