//! Severity thresholds and concentration classification.
//!
//! Three ascending breakpoints `a < b < c` split the number line into four
//! half-open buckets:
//!
//! ```text
//! [-inf, a) -> green   [a, b) -> yellow   [b, c) -> orange   [c, +inf) -> red
//! ```
//!
//! Comparisons are strict less-than, so a reading exactly on a breakpoint
//! lands in the higher bucket.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity bucket, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Green,
    Yellow,
    Orange,
    Red,
}

impl Bucket {
    pub fn rank(self) -> u8 {
        match self {
            Bucket::Green => 0,
            Bucket::Yellow => 1,
            Bucket::Orange => 2,
            Bucket::Red => 3,
        }
    }

    /// Fill color used by the map collaborator.
    pub fn color(self) -> &'static str {
        match self {
            Bucket::Green => "#28a745",
            Bucket::Yellow => "#ffc107",
            Bucket::Orange => "#fd7e14",
            Bucket::Red => "#dc3545",
        }
    }
}

/// One of the three operator-editable breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdField {
    A,
    B,
    C,
}

impl ThresholdField {
    pub const ALL: [ThresholdField; 3] = [ThresholdField::A, ThresholdField::B, ThresholdField::C];

    /// Key used in the local settings store.
    pub fn settings_key(self) -> &'static str {
        match self {
            ThresholdField::A => "th_a",
            ThresholdField::B => "th_b",
            ThresholdField::C => "th_c",
        }
    }
}

impl fmt::Display for ThresholdField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThresholdField::A => "a",
            ThresholdField::B => "b",
            ThresholdField::C => "c",
        };
        f.write_str(name)
    }
}

/// Validation failure, always tagged with the offending field.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThresholdError {
    #[error("threshold {field} is not a finite number: {input:?}")]
    NotANumber { field: ThresholdField, input: String },
    #[error("threshold {field} must be below threshold {upper}")]
    NotAscending {
        field: ThresholdField,
        upper: ThresholdField,
    },
}

impl ThresholdError {
    pub fn field(&self) -> ThresholdField {
        match self {
            ThresholdError::NotANumber { field, .. } => *field,
            ThresholdError::NotAscending { field, .. } => *field,
        }
    }
}

/// Validated breakpoints. The only way to build one is through [`ThresholdConfig::new`]
/// (or deserialization, which runs the same checks), so `a < b < c` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawThresholds", into = "RawThresholds")]
pub struct ThresholdConfig {
    a: f64,
    b: f64,
    c: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawThresholds {
    a: f64,
    b: f64,
    c: f64,
}

impl TryFrom<RawThresholds> for ThresholdConfig {
    type Error = ThresholdError;

    fn try_from(raw: RawThresholds) -> Result<Self, Self::Error> {
        ThresholdConfig::new(raw.a, raw.b, raw.c)
    }
}

impl From<ThresholdConfig> for RawThresholds {
    fn from(cfg: ThresholdConfig) -> Self {
        RawThresholds {
            a: cfg.a,
            b: cfg.b,
            c: cfg.c,
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            a: 50.0,
            b: 100.0,
            c: 150.0,
        }
    }
}

impl ThresholdConfig {
    pub fn new(a: f64, b: f64, c: f64) -> Result<Self, ThresholdError> {
        for (field, value) in ThresholdField::ALL.into_iter().zip([a, b, c]) {
            if !value.is_finite() {
                return Err(ThresholdError::NotANumber {
                    field,
                    input: value.to_string(),
                });
            }
        }
        if a >= b {
            return Err(ThresholdError::NotAscending {
                field: ThresholdField::A,
                upper: ThresholdField::B,
            });
        }
        if b >= c {
            return Err(ThresholdError::NotAscending {
                field: ThresholdField::B,
                upper: ThresholdField::C,
            });
        }
        Ok(Self { a, b, c })
    }

    /// Parses the three operator inputs. Nothing is committed on failure.
    pub fn parse(a: &str, b: &str, c: &str) -> Result<Self, ThresholdError> {
        let a = parse_field(ThresholdField::A, a)?;
        let b = parse_field(ThresholdField::B, b)?;
        let c = parse_field(ThresholdField::C, c)?;
        Self::new(a, b, c)
    }

    pub fn a(&self) -> f64 {
        self.a
    }

    pub fn b(&self) -> f64 {
        self.b
    }

    pub fn c(&self) -> f64 {
        self.c
    }

    pub fn get(&self, field: ThresholdField) -> f64 {
        match field {
            ThresholdField::A => self.a,
            ThresholdField::B => self.b,
            ThresholdField::C => self.c,
        }
    }

    pub fn classify(&self, value: f64) -> Bucket {
        classify(value, self)
    }
}

fn parse_field(field: ThresholdField, input: &str) -> Result<f64, ThresholdError> {
    match input.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ThresholdError::NotANumber {
            field,
            input: input.to_string(),
        }),
    }
}

/// Maps a reading to its bucket. Callers filter out NaN before calling.
pub fn classify(value: f64, thresholds: &ThresholdConfig) -> Bucket {
    if value < thresholds.a {
        Bucket::Green
    } else if value < thresholds.b {
        Bucket::Yellow
    } else if value < thresholds.c {
        Bucket::Orange
    } else {
        Bucket::Red
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ThresholdConfig {
        ThresholdConfig::new(50.0, 100.0, 150.0).unwrap()
    }

    #[test]
    fn test_breakpoints_fall_into_higher_bucket() {
        let t = cfg();
        assert_eq!(t.classify(149.9), Bucket::Orange);
        assert_eq!(t.classify(150.0), Bucket::Red);
        assert_eq!(t.classify(49.999), Bucket::Green);
        assert_eq!(t.classify(50.0), Bucket::Yellow);
        assert_eq!(t.classify(100.0), Bucket::Orange);
        assert_eq!(t.classify(-1e9), Bucket::Green);
        assert_eq!(t.classify(1e9), Bucket::Red);
    }

    #[test]
    fn test_classification_is_monotonic() {
        let t = ThresholdConfig::new(-3.5, 0.0, 12.25).unwrap();
        let mut previous = Bucket::Green;
        let mut v = -20.0;
        while v < 30.0 {
            let bucket = t.classify(v);
            assert!(bucket.rank() >= previous.rank(), "bucket went down at {v}");
            previous = bucket;
            v += 0.05;
        }
        assert_eq!(previous, Bucket::Red);
    }

    #[test]
    fn test_rejects_non_ascending_with_field_tag() {
        let err = ThresholdConfig::parse("100", "100", "150").unwrap_err();
        assert_eq!(err.field(), ThresholdField::A);

        let err = ThresholdConfig::parse("10", "200", "150").unwrap_err();
        assert_eq!(err.field(), ThresholdField::B);
    }

    #[test]
    fn test_rejects_non_numeric_input() {
        let err = ThresholdConfig::parse("10", "abc", "150").unwrap_err();
        assert_eq!(
            err,
            ThresholdError::NotANumber {
                field: ThresholdField::B,
                input: "abc".into()
            }
        );
        assert!(ThresholdConfig::parse("10", "20", "inf").is_err());
        assert!(ThresholdConfig::parse("", "20", "30").is_err());
    }

    #[test]
    fn test_deserialize_runs_validation() {
        let ok: ThresholdConfig = serde_json::from_str(r#"{"a":1,"b":2,"c":3}"#).unwrap();
        assert_eq!(ok.b(), 2.0);
        assert!(serde_json::from_str::<ThresholdConfig>(r#"{"a":3,"b":2,"c":1}"#).is_err());

        let json = serde_json::to_value(cfg()).unwrap();
        assert_eq!(json, serde_json::json!({"a": 50.0, "b": 100.0, "c": 150.0}));
    }
}
