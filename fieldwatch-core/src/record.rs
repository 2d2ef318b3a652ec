//! Normalization of loosely-typed remote records.
//!
//! Producers write whatever their sensors give them: numbers as strings,
//! missing coordinates when GPS drops, missing concentration when the gas
//! reader stalls. [`normalize`] turns that into a [`PositionSample`] where
//! every numeric field is either a finite value or explicitly absent.

use crate::thresholds::{Bucket, ThresholdConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Placeholder shown for a field that has no reading.
pub const NO_DATA: &str = "no data";
/// Placeholder shown when the live panel is cleared.
pub const NEUTRAL: &str = "-";

/// Receiver fix quality as reported by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFlag {
    /// NMEA `A`: fix is valid.
    Valid,
    /// NMEA `V`: receiver reports void data.
    Void,
    /// Concentration was back-filled after the pairing window expired.
    Filled,
}

impl StatusFlag {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw {
            "A" | "a" | "valid" => Some(StatusFlag::Valid),
            "V" | "v" | "void" => Some(StatusFlag::Void),
            _ if raw.to_ascii_lowercase().starts_with("filled") => Some(StatusFlag::Filled),
            _ => None,
        }
    }
}

/// Canonical reading. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub concentration: Option<f64>,
    pub unit: Option<String>,
    pub timestamp: String,
    pub status: Option<StatusFlag>,
}

impl PositionSample {
    /// Both coordinates, or nothing.
    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn bucket(&self, thresholds: &ThresholdConfig) -> Option<Bucket> {
        self.concentration.map(|c| thresholds.classify(c))
    }

    /// Wire form, using the producer's field names.
    pub fn to_wire(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("timestamp".into(), Value::String(self.timestamp.clone()));
        if let Some(lat) = self.lat {
            obj.insert("lat".into(), lat.into());
        }
        if let Some(lon) = self.lon {
            obj.insert("lon".into(), lon.into());
        }
        if let Some(alt) = self.alt {
            obj.insert("alt".into(), alt.into());
        }
        if let Some(conc) = self.concentration {
            obj.insert("conc".into(), conc.into());
        }
        if let Some(unit) = &self.unit {
            obj.insert("conc_unit".into(), Value::String(unit.clone()));
        }
        if let Some(status) = self.status {
            let flag = match status {
                StatusFlag::Valid => "A",
                StatusFlag::Void => "V",
                StatusFlag::Filled => "Filled(Timeout)",
            };
            obj.insert("status".into(), Value::String(flag.into()));
        }
        Value::Object(obj)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("record is not an object")]
    NotAnObject,
    #[error("record has no timestamp")]
    MissingTimestamp,
}

/// Strict form of [`normalize`], for callers that want the reason.
pub fn try_normalize(raw: &Value) -> Result<PositionSample, RecordError> {
    let obj = raw.as_object().ok_or(RecordError::NotAnObject)?;

    let timestamp = match obj.get("timestamp") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(RecordError::MissingTimestamp),
    };

    let unit = obj
        .get("conc_unit")
        .or_else(|| obj.get("unit"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let status = match obj.get("status") {
        Some(Value::String(s)) => {
            let flag = StatusFlag::parse(s);
            if flag.is_none() {
                debug!("unknown status flag {s:?} ignored");
            }
            flag
        }
        _ => None,
    };

    Ok(PositionSample {
        lat: number_field(obj.get("lat")),
        lon: number_field(obj.get("lon")),
        alt: number_field(obj.get("alt")),
        concentration: number_field(obj.get("conc").or_else(|| obj.get("concentration"))),
        unit,
        timestamp,
        status,
    })
}

/// Shapes a raw payload. Records that cannot be identified are logged and dropped.
pub fn normalize(raw: &Value) -> Option<PositionSample> {
    match try_normalize(raw) {
        Ok(sample) => Some(sample),
        Err(e) => {
            warn!("dropping malformed record ({e}): {raw}");
            None
        }
    }
}

fn number_field(value: Option<&Value>) -> Option<f64> {
    let v = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// Text shown in the live panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveReading {
    pub coords: String,
    pub concentration: String,
    pub bucket: Option<Bucket>,
}

impl LiveReading {
    pub fn neutral() -> Self {
        Self {
            coords: NEUTRAL.to_string(),
            concentration: NEUTRAL.to_string(),
            bucket: None,
        }
    }

    pub fn from_sample(sample: &PositionSample, thresholds: &ThresholdConfig, default_unit: &str) -> Self {
        Self {
            coords: format_coords(sample),
            concentration: format_concentration(sample, default_unit),
            bucket: sample.bucket(thresholds),
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.coords == NEUTRAL && self.concentration == NEUTRAL
    }
}

impl Default for LiveReading {
    fn default() -> Self {
        Self::neutral()
    }
}

pub fn format_coords(sample: &PositionSample) -> String {
    match sample.position() {
        Some((lat, lon)) => format!("{lat:.6}, {lon:.6}"),
        None => NO_DATA.to_string(),
    }
}

pub fn format_concentration(sample: &PositionSample, default_unit: &str) -> String {
    match sample.concentration {
        Some(conc) => {
            let unit = sample.unit.as_deref().unwrap_or(default_unit);
            format!("{conc} {unit}")
        }
        None => NO_DATA.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_record() {
        let s = normalize(&json!({
            "timestamp": "2024-05-01 10:00:00",
            "lat": 25.033, "lon": 121.5654, "alt": 12.5,
            "conc": 88.2, "conc_unit": "ppb", "status": "A"
        }))
        .unwrap();
        assert_eq!(s.position(), Some((25.033, 121.5654)));
        assert_eq!(s.concentration, Some(88.2));
        assert_eq!(s.unit.as_deref(), Some("ppb"));
        assert_eq!(s.status, Some(StatusFlag::Valid));
    }

    #[test]
    fn test_missing_fields_stay_absent() {
        let s = normalize(&json!({"timestamp": "t1", "conc": 0.0})).unwrap();
        assert_eq!(s.lat, None);
        assert_eq!(s.position(), None);
        assert_eq!(s.concentration, Some(0.0));

        let s = normalize(&json!({"timestamp": "t2", "lat": 1.0, "lon": 2.0, "alt": "?"})).unwrap();
        assert_eq!(s.alt, None);
        assert_eq!(s.concentration, None);
    }

    #[test]
    fn test_string_numbers_and_garbage() {
        let s = normalize(&json!({"timestamp": "t", "lat": "25.5", "lon": null, "conc": "n/a"})).unwrap();
        assert_eq!(s.lat, Some(25.5));
        assert_eq!(s.lon, None);
        assert_eq!(s.concentration, None);
    }

    #[test]
    fn test_rejects_without_timestamp() {
        assert!(normalize(&json!({"lat": 1.0, "lon": 2.0})).is_none());
        assert!(normalize(&json!({"timestamp": "  "})).is_none());
        assert_eq!(try_normalize(&json!(42)), Err(RecordError::NotAnObject));
    }

    #[test]
    fn test_status_flags() {
        let flag = |s: &str| normalize(&json!({"timestamp": "t", "status": s})).unwrap().status;
        assert_eq!(flag("V"), Some(StatusFlag::Void));
        assert_eq!(flag("Filled(Timeout)"), Some(StatusFlag::Filled));
        assert_eq!(flag("weird"), None);
    }

    #[test]
    fn test_partial_reading_renders_no_data() {
        let t = ThresholdConfig::default();
        let s = normalize(&json!({"timestamp": "t", "lat": 25.0, "lon": 121.0})).unwrap();
        let live = LiveReading::from_sample(&s, &t, "ppm");
        assert_eq!(live.coords, "25.000000, 121.000000");
        assert_eq!(live.concentration, NO_DATA);
        assert_eq!(live.bucket, None);

        let s = normalize(&json!({"timestamp": "t", "conc": 151})).unwrap();
        let live = LiveReading::from_sample(&s, &t, "ppm");
        assert_eq!(live.coords, NO_DATA);
        assert_eq!(live.concentration, "151 ppm");
        assert_eq!(live.bucket, Some(Bucket::Red));
    }

    #[test]
    fn test_zero_coordinates_are_a_position() {
        let s = normalize(&json!({"timestamp": "t", "lat": 0.0, "lon": 0.0})).unwrap();
        assert_eq!(s.position(), Some((0.0, 0.0)));
        let s = normalize(&json!({"timestamp": "t", "conc": 5.0})).unwrap();
        assert_eq!(s.position(), None);
    }

    #[test]
    fn test_wire_form_normalizes_back() {
        let s = normalize(&json!({"timestamp": "t", "lat": 1.5, "lon": 2.5, "conc": 3.0, "status": "V"})).unwrap();
        assert_eq!(normalize(&s.to_wire()), Some(s));
    }
}
