use crate::error::{BootstrapError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;

const KIB: u64 = 1024;
const UNITS: [(&str, u64); 4] = [
    ("t", KIB * KIB * KIB * KIB),
    ("g", KIB * KIB * KIB),
    ("m", KIB * KIB),
    ("k", KIB),
];

/// A memory amount in bytes, written the way container runtimes expect
/// (`24g`, `512m`). Suffixes are binary; `g`, `gi`, `gb` and `Gi` all mean GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemoryQuantity(u64);

impl MemoryQuantity {
    pub const fn from_bytes(bytes: u64) -> Self {
        MemoryQuantity(bytes)
    }

    pub fn from_gib(gib: u64) -> Self {
        MemoryQuantity(gib * KIB * KIB * KIB)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    pub fn as_gib(&self) -> f64 {
        self.0 as f64 / (KIB * KIB * KIB) as f64
    }
}

impl FromStr for MemoryQuantity {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BootstrapError::InvalidQuantity(s.to_string());
        let lower = s.trim().to_ascii_lowercase();
        let split = lower
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(lower.len());
        let (number, suffix) = lower.split_at(split);
        let suffix = suffix.trim();
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let multiplier = if suffix.is_empty() || suffix == "b" {
            1
        } else {
            let unit = suffix
                .strip_suffix("ib")
                .or_else(|| suffix.strip_suffix('i'))
                .or_else(|| suffix.strip_suffix('b'))
                .unwrap_or(suffix);
            UNITS
                .iter()
                .find(|(name, _)| *name == unit)
                .map(|(_, m)| *m)
                .ok_or_else(invalid)?
        };

        let bytes = (value * multiplier as f64).round();
        if !bytes.is_finite() || bytes < 1.0 {
            return Err(invalid());
        }
        Ok(MemoryQuantity(bytes as u64))
    }
}

impl fmt::Display for MemoryQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, m) in UNITS {
            if self.0 >= m && self.0 % m == 0 {
                return write!(f, "{}{name}", self.0 / m);
            }
        }
        write!(f, "{}b", self.0)
    }
}

impl TryFrom<String> for MemoryQuantity {
    type Error = BootstrapError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MemoryQuantity> for String {
    fn from(q: MemoryQuantity) -> String {
        q.to_string()
    }
}

impl Add for MemoryQuantity {
    type Output = MemoryQuantity;

    fn add(self, rhs: Self) -> Self {
        MemoryQuantity(self.0.saturating_add(rhs.0))
    }
}

impl Sum for MemoryQuantity {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(MemoryQuantity(0), Add::add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> MemoryQuantity {
        s.parse().unwrap()
    }

    #[test]
    fn suffix_spellings_agree() {
        for s in ["24g", "24G", "24gb", "24Gi", "24GiB", "24576m", "24576Mi"] {
            assert_eq!(q(s), MemoryQuantity::from_gib(24), "{s}");
        }
    }

    #[test]
    fn display_round_trips() {
        for s in ["24g", "512m", "1536m", "3k", "1t", "100b"] {
            assert_eq!(q(s).to_string(), s);
            assert_eq!(q(&q(s).to_string()), q(s));
        }
    }

    #[test]
    fn fractional_values_normalize() {
        assert_eq!(q("1.5g").to_string(), "1536m");
    }

    #[test]
    fn rejects_garbage_and_zero() {
        for s in ["", "g", "abc", "12x", "0g", "-1g"] {
            assert!(s.parse::<MemoryQuantity>().is_err(), "{s}");
        }
    }

    #[test]
    fn sums_through_the_same_parser() {
        let total: MemoryQuantity = ["8g", "6g", "512m"].iter().map(|s| q(s)).sum();
        assert_eq!(total.to_string(), "14848m");
        assert!((total.as_gib() - 14.5).abs() < f64::EPSILON);
    }

    #[test]
    fn serde_uses_string_form() {
        let json = serde_json::to_string(&q("6g")).unwrap();
        assert_eq!(json, "\"6g\"");
        let back: MemoryQuantity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, q("6g"));
    }
}
