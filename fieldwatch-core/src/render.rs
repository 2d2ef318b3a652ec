//! Rendering seams.
//!
//! The map and the chart are collaborators with fixed interfaces. The engine
//! calls them and never reads anything back, except chart click selections,
//! which come back as `Dashboard::select_chart_point`.
//!
//! [`MapModel`] and [`ChartModel`] are retained-mode implementations: they keep
//! what was drawn plus call counters. The monitor serves them over HTTP and
//! the tests assert on them.

use crate::history::HistoryRecord;
use crate::thresholds::{Bucket, ThresholdConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Fill used for a point that has a position but no concentration.
pub const NO_READING_COLOR: &str = "#6c757d";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyledPoint {
    pub key: String,
    pub lat: f64,
    pub lon: f64,
    pub concentration: Option<f64>,
    pub bucket: Option<Bucket>,
    pub color: &'static str,
    pub timestamp: String,
}

impl StyledPoint {
    /// `None` when the record has no position to draw.
    pub fn from_record(record: &HistoryRecord, thresholds: &ThresholdConfig) -> Option<Self> {
        let (lat, lon) = record.sample.position()?;
        let bucket = record.sample.bucket(thresholds);
        Some(Self {
            key: record.key.clone(),
            lat,
            lon,
            concentration: record.sample.concentration,
            bucket,
            color: bucket.map_or(NO_READING_COLOR, Bucket::color),
            timestamp: record.sample.timestamp.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub key: String,
    pub timestamp: String,
    pub value: f64,
    pub bucket: Bucket,
}

impl SeriesPoint {
    /// `None` when the record has no concentration to plot.
    pub fn from_record(record: &HistoryRecord, thresholds: &ThresholdConfig) -> Option<Self> {
        let value = record.sample.concentration?;
        Some(Self {
            key: record.key.clone(),
            timestamp: record.sample.timestamp.clone(),
            value,
            bucket: thresholds.classify(value),
        })
    }
}

pub fn styled_points(records: &[HistoryRecord], thresholds: &ThresholdConfig) -> Vec<StyledPoint> {
    records
        .iter()
        .filter_map(|r| StyledPoint::from_record(r, thresholds))
        .collect()
}

pub fn series(records: &[HistoryRecord], thresholds: &ThresholdConfig) -> Vec<SeriesPoint> {
    records
        .iter()
        .filter_map(|r| SeriesPoint::from_record(r, thresholds))
        .collect()
}

pub trait MapSurface: Send {
    fn set_marker(&mut self, lat: f64, lon: f64, auto_center: bool);
    /// One batched render of history points.
    fn draw_history(&mut self, points: &[StyledPoint]);
    fn append_point(&mut self, point: StyledPoint);
    /// Recolors every drawn point after a threshold change.
    fn restyle(&mut self, points: &[StyledPoint]);
    fn focus(&mut self, lat: f64, lon: f64);
    fn clear(&mut self);
}

pub trait ChartSurface: Send {
    fn set_series(&mut self, points: &[SeriesPoint]);
    fn append(&mut self, point: SeriesPoint);
    fn clear(&mut self);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MapState {
    pub marker: Option<(f64, f64)>,
    pub center: Option<(f64, f64)>,
    pub points: Vec<StyledPoint>,
    pub batch_renders: usize,
    pub point_renders: usize,
    pub restyles: usize,
}

/// Cloneable handle; every clone sees the same map.
#[derive(Debug, Clone, Default)]
pub struct MapModel {
    inner: Arc<Mutex<MapState>>,
}

impl MapModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MapState {
        self.inner.lock().clone()
    }

    /// Batched plus single-point renders.
    pub fn render_count(&self) -> usize {
        let s = self.inner.lock();
        s.batch_renders + s.point_renders
    }
}

impl MapSurface for MapModel {
    fn set_marker(&mut self, lat: f64, lon: f64, auto_center: bool) {
        let mut s = self.inner.lock();
        s.marker = Some((lat, lon));
        if auto_center {
            s.center = Some((lat, lon));
        }
    }

    fn draw_history(&mut self, points: &[StyledPoint]) {
        let mut s = self.inner.lock();
        s.points.extend_from_slice(points);
        s.batch_renders += 1;
    }

    fn append_point(&mut self, point: StyledPoint) {
        let mut s = self.inner.lock();
        s.points.push(point);
        s.point_renders += 1;
    }

    fn restyle(&mut self, points: &[StyledPoint]) {
        let mut s = self.inner.lock();
        s.points = points.to_vec();
        s.restyles += 1;
    }

    fn focus(&mut self, lat: f64, lon: f64) {
        self.inner.lock().center = Some((lat, lon));
    }

    fn clear(&mut self) {
        let mut s = self.inner.lock();
        s.marker = None;
        s.points.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartState {
    pub series: Vec<SeriesPoint>,
    pub batch_renders: usize,
    pub appends: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ChartModel {
    inner: Arc<Mutex<ChartState>>,
}

impl ChartModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ChartState {
        self.inner.lock().clone()
    }

    pub fn render_count(&self) -> usize {
        let s = self.inner.lock();
        s.batch_renders + s.appends
    }
}

impl ChartSurface for ChartModel {
    fn set_series(&mut self, points: &[SeriesPoint]) {
        let mut s = self.inner.lock();
        s.series = points.to_vec();
        s.batch_renders += 1;
    }

    fn append(&mut self, point: SeriesPoint) {
        let mut s = self.inner.lock();
        s.series.push(point);
        s.appends += 1;
    }

    fn clear(&mut self) {
        self.inner.lock().series.clear();
    }
}
