/*!
Builders for the payloads a field backend writes

Samples use the producer's wire names (`lat`, `lon`, `conc`, `conc_unit`, ...)
and its local-time timestamp format, so they go through the same
normalization as real device output.
*/

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use fieldwatch_core::record::try_normalize;
use fieldwatch_core::{ConnectionState, PositionSample, ThresholdConfig};
use serde_json::{json, Map, Value};

/// Timestamp format written by the field device.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// One sample record, built field by field.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    timestamp: String,
    lat: Option<f64>,
    lon: Option<f64>,
    alt: Option<f64>,
    conc: Option<f64>,
    unit: Option<String>,
    status: Option<String>,
}

impl RecordBuilder {
    /// Sample stamped with the current time and a valid fix flag.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            timestamp: timestamp(at),
            lat: None,
            lon: None,
            alt: None,
            conc: None,
            unit: None,
            status: Some("A".into()),
        }
    }

    pub fn timestamp<S: Into<String>>(mut self, raw: S) -> Self {
        self.timestamp = raw.into();
        self
    }

    pub fn position(mut self, lat: f64, lon: f64) -> Self {
        self.lat = Some(lat);
        self.lon = Some(lon);
        self
    }

    pub fn altitude(mut self, alt: f64) -> Self {
        self.alt = Some(alt);
        self
    }

    pub fn concentration(mut self, conc: f64) -> Self {
        self.conc = Some(conc);
        self
    }

    pub fn unit<S: Into<String>>(mut self, unit: S) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Raw status flag (`A`, `V`, `Filled(Timeout)`); `None` drops the field.
    pub fn status(mut self, flag: Option<&str>) -> Self {
        self.status = flag.map(str::to_string);
        self
    }

    /// Fix lost: no coordinates, void flag.
    pub fn gps_lost(mut self) -> Self {
        self.lat = None;
        self.lon = None;
        self.status = Some("V".into());
        self
    }

    pub fn build(&self) -> Value {
        let mut obj = Map::new();
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
        if let Some(conc) = self.conc {
            obj.insert("conc".into(), conc.into());
        }
        if let Some(unit) = &self.unit {
            obj.insert("conc_unit".into(), Value::String(unit.clone()));
        }
        if let Some(status) = &self.status {
            obj.insert("status".into(), Value::String(status.clone()));
        }
        Value::Object(obj)
    }

    /// The sample as the engine will see it after normalization.
    pub fn sample(&self) -> Result<PositionSample> {
        Ok(try_normalize(&self.build())?)
    }
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `count` samples one second apart along a straight line, with rising
/// concentration.
pub fn track(start: DateTime<Utc>, origin: (f64, f64), count: usize, conc_step: f64) -> Vec<RecordBuilder> {
    (0..count)
        .map(|i| {
            RecordBuilder::at(start + Duration::seconds(i as i64))
                .position(origin.0 + 0.0001 * i as f64, origin.1 + 0.0001 * i as f64)
                .concentration(conc_step * (i + 1) as f64)
                .unit("ppm")
        })
        .collect()
}

pub fn status(state: ConnectionState, message: &str) -> Value {
    json!({ "state": state.as_str(), "message": message })
}

pub fn thresholds(cfg: &ThresholdConfig) -> Value {
    json!({ "a": cfg.a(), "b": cfg.b(), "c": cfg.c() })
}
