// ============================================================================
// File: src/models/bandwidth.rs
// ----------------------------------------------------------------------------
// Bandwidth limit literal (`^\d+[KMG]?$`) and its unit conversions.
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CloneError, CloneResult};

/// Unit suffix of a bandwidth literal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthUnit {
    /// No suffix; interpreted as KiB/s like rsync does
    None,
    Kilo,
    Mega,
    Giga,
}

/// Validated transfer throttle such as `100M`, `1G` or `500`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthLimit {
    value: u64,
    unit: BandwidthUnit,
}

impl BandwidthLimit {
    /// Parse and validate a bandwidth literal
    pub fn parse(literal: &str) -> CloneResult<Self> {
        let invalid = || {
            CloneError::validation(
                "bandwidth_limit",
                format!("Invalid bandwidth limit format: {literal:?} (expected e.g. 100M, 1G, 500)"),
            )
        };

        let (digits, unit) = match literal.as_bytes().last() {
            Some(b'K') => (&literal[..literal.len() - 1], BandwidthUnit::Kilo),
            Some(b'M') => (&literal[..literal.len() - 1], BandwidthUnit::Mega),
            Some(b'G') => (&literal[..literal.len() - 1], BandwidthUnit::Giga),
            Some(_) => (literal, BandwidthUnit::None),
            None => return Err(invalid()),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let value = digits.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self { value, unit })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn unit(&self) -> BandwidthUnit {
        self.unit
    }

    /// Whole megabytes per second, never below 1
    ///
    /// `K` (and the bare form) divide by 1024, `M` is taken as is and `G`
    /// multiplies by 1024.
    pub fn to_megabytes_per_sec(&self) -> u64 {
        let mb = match self.unit {
            BandwidthUnit::None | BandwidthUnit::Kilo => self.value / 1024,
            BandwidthUnit::Mega => self.value,
            BandwidthUnit::Giga => self.value.saturating_mul(1024),
        };
        mb.max(1)
    }
}

impl fmt::Display for BandwidthLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.unit {
            BandwidthUnit::None => "",
            BandwidthUnit::Kilo => "K",
            BandwidthUnit::Mega => "M",
            BandwidthUnit::Giga => "G",
        };
        write!(f, "{}{}", self.value, suffix)
    }
}

impl FromStr for BandwidthLimit {
    type Err = CloneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for BandwidthLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BandwidthLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let literal = String::deserialize(deserializer)?;
        Self::parse(&literal).map_err(serde::de::Error::custom)
    }
}
