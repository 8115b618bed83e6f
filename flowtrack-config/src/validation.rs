//! Custom validation functions for configuration.

use std::borrow::Cow;

use validator::ValidationError;

use crate::manager::ManagerSettings;
use crate::timeouts::ProtoTimeoutSettings;

pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = ["trace", "debug", "info", "warn", "error", "off"]
        .contains(&level.to_lowercase().as_str());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

/// Low water below high water, emergency scans at least as frequent as
/// normal ones.
pub fn validate_water_marks(settings: &ManagerSettings) -> Result<(), ValidationError> {
    if settings.emergency_low_water >= settings.emergency_high_water {
        return Err(ValidationError::new("water_marks").with_message(Cow::Owned(format!(
            "emergency_low_water ({}) must be below emergency_high_water ({})",
            settings.emergency_low_water, settings.emergency_high_water
        ))));
    }
    if settings.emergency_scan_interval_ms > settings.scan_interval_ms {
        return Err(ValidationError::new("scan_interval").with_message(Cow::Borrowed(
            "emergency_scan_interval_ms must not exceed scan_interval_ms",
        )));
    }
    Ok(())
}

/// Emergency timeouts must be shorter than normal ones. A normal timeout of
/// 0 only allows an emergency timeout of 0.
pub fn validate_emergency_timeouts(settings: &ProtoTimeoutSettings) -> Result<(), ValidationError> {
    for (state, normal, emergency) in settings.pairs() {
        if emergency > normal || (normal > 0 && emergency == normal) {
            return Err(ValidationError::new("emergency_timeout").with_message(Cow::Owned(format!(
                "emergency_{state} ({emergency}s) must be shorter than {state} ({normal}s)"
            ))));
        }
    }
    Ok(())
}
