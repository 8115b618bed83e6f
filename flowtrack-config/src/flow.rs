//! Flow table sizing and memory limits.

use serde::{Deserialize, Deserializer, Serialize};
use validator::{self, Validate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct FlowSettings {
    /// Number of hash buckets.
    #[validate(range(min = 1, max = 16777216))]
    #[serde(default = "default_hash_size")]
    pub hash_size: usize,

    /// Bucket hash seed. 0 draws a random seed at startup.
    #[serde(default)]
    pub hash_seed: u64,

    /// Flow memory cap in bytes. Accepts "32MiB" style values.
    #[validate(range(min = 1))]
    #[serde(default = "default_memcap", deserialize_with = "deserialize_size")]
    pub memcap: u64,

    /// Flows preallocated at startup and kept spare by the manager.
    #[serde(default = "default_prealloc")]
    pub prealloc: usize,
}

fn default_hash_size() -> usize {
    65536
}

fn default_memcap() -> u64 {
    32 * 1024 * 1024
}

fn default_prealloc() -> usize {
    10000
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            hash_size: default_hash_size(),
            hash_seed: 0,
            memcap: default_memcap(),
            prealloc: default_prealloc(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Num(u64),
    Str(String),
}

/// Accepts a byte count or a number with a KiB/MiB/GiB style unit.
fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Num(n) => Ok(n),
        SizeValue::Str(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num_part, unit_part) = s.split_at(split);
    let number: f64 = num_part
        .parse()
        .map_err(|_| format!("Invalid size value '{s}'"))?;
    let multiplier = match unit_part.trim().to_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" | "kib" => 1024.0,
        "mb" | "mib" => 1024.0 * 1024.0,
        "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        unit => return Err(format!("Unknown size unit '{unit}'")),
    };
    Ok((number * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_with_units() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64KiB").unwrap(), 65536);
        assert_eq!(parse_size("1.5 MiB").unwrap(), 1572864);
        assert_eq!(parse_size("2gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("12 parsecs").is_err());
        assert!(parse_size("MiB").is_err());
    }

    #[test]
    fn zero_memcap_fails_validation() {
        let settings = FlowSettings {
            memcap: 0,
            ..FlowSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
