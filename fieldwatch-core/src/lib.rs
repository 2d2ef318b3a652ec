//! Real-time sync and reconciliation engine for a field-monitoring dashboard.
//!
//! The engine sits between a remote key-value store (status, latest reading,
//! append-only history, settings and control paths per project namespace)
//! and two rendering collaborators (a map and a chart). See [`Dashboard`].

pub mod command;
pub mod config_sync;
pub mod connection;
pub mod dashboard;
pub mod error;
pub mod history;
pub mod record;
pub mod render;
pub mod settings;
pub mod store;
pub mod switch;
pub mod thresholds;

pub use command::Command;
pub use config_sync::{BackendConfig, ConfigField, ConfigPatch, InputField};
pub use connection::{ConnectionState, ConnectionStatus, Posture, SwitchIntent};
pub use dashboard::{Dashboard, DashboardView, EngineOptions, Notice, NoticeLevel};
pub use error::{DashboardError, ValidationError};
pub use history::{DedupIndex, HistoryFeed, HistoryRecord};
pub use record::{normalize, LiveReading, PositionSample};
pub use render::{ChartModel, ChartSurface, MapModel, MapSurface};
pub use settings::{FileSettings, MemorySettings, SettingsStore};
pub use store::{Generation, MemoryStore, Namespace, RemoteStore, StoreError, StoreEvent, StorePath};
pub use thresholds::{classify, Bucket, ThresholdConfig, ThresholdField};
