//! Remote store seam.
//!
//! The remote side is a namespaced key-value tree with "value changed" and
//! "child added" notifications. The engine only ever talks to it through
//! [`RemoteStore`]; notifications come back as [`StoreEvent`]s that the
//! driver feeds to the dashboard one at a time.

mod memory;

pub use memory::{MemoryStore, WriteRecord};

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Isolated subtree for one monitoring project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyNamespace);
        }
        if trimmed.contains(&['/', '#', '+'][..]) {
            return Err(ValidationError::InvalidNamespace(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Namespace {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Namespace::parse(&value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locations inside one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorePath {
    Status,
    Latest,
    History,
    CurrentConfig,
    Thresholds,
    Command,
    ConfigUpdate,
}

impl StorePath {
    /// Single-value paths the engine subscribes to on attach.
    pub const WATCHED: [StorePath; 4] = [
        StorePath::Status,
        StorePath::Latest,
        StorePath::CurrentConfig,
        StorePath::Thresholds,
    ];

    pub fn relative(self) -> &'static str {
        match self {
            StorePath::Status => "status",
            StorePath::Latest => "latest",
            StorePath::History => "history",
            StorePath::CurrentConfig => "settings/current_config",
            StorePath::Thresholds => "settings/thresholds",
            StorePath::Command => "control/command",
            StorePath::ConfigUpdate => "control/config_update",
        }
    }

    pub fn from_relative(raw: &str) -> Option<Self> {
        [
            StorePath::Status,
            StorePath::Latest,
            StorePath::History,
            StorePath::CurrentConfig,
            StorePath::Thresholds,
            StorePath::Command,
            StorePath::ConfigUpdate,
        ]
        .into_iter()
        .find(|p| p.relative() == raw)
    }

    /// Producer-owned paths are read-only to the engine.
    pub fn is_engine_writable(self) -> bool {
        matches!(
            self,
            StorePath::Thresholds | StorePath::Command | StorePath::ConfigUpdate
        )
    }

    pub fn under(self, namespace: &Namespace) -> String {
        format!("{}/{}", namespace, self.relative())
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relative())
    }
}

/// Attachment counter. A snapshot stamped with an older generation belongs
/// to a view that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

/// Notification delivered by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A single-value path changed. `None` means the value is absent.
    Value {
        namespace: Namespace,
        path: StorePath,
        value: Option<Value>,
    },
    /// A record was appended to the history feed.
    ChildAdded {
        namespace: Namespace,
        key: String,
        value: Value,
    },
    /// Result of the bulk history read started by `attach`.
    Snapshot {
        namespace: Namespace,
        generation: Generation,
        entries: Vec<(String, Value)>,
    },
}

impl StoreEvent {
    pub fn namespace(&self) -> &Namespace {
        match self {
            StoreEvent::Value { namespace, .. }
            | StoreEvent::ChildAdded { namespace, .. }
            | StoreEvent::Snapshot { namespace, .. } => namespace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("path {0} is owned by the producer")]
    ReadOnly(StorePath),
    #[error("write to {path} rejected: {reason}")]
    Rejected { path: String, reason: String },
    #[error("store connection closed")]
    Closed,
}

/// Operations the engine performs against the remote tree.
///
/// Writes resolve once: `Ok` when the store accepted the write, `Err` when it
/// refused. There is no local retry.
pub trait RemoteStore: Send + Sync {
    /// Subscribes to the watched paths and history appends of `namespace`,
    /// and starts one bulk read of its history. The bulk result comes back
    /// as a [`StoreEvent::Snapshot`] stamped with `generation`.
    fn attach(&self, namespace: &Namespace, generation: Generation) -> Result<(), StoreError>;

    /// Drops every subscription held for `namespace`.
    fn detach(&self, namespace: &Namespace) -> Result<(), StoreError>;

    /// Overwrites a single-value path.
    fn set(&self, namespace: &Namespace, path: StorePath, value: Value) -> Result<(), StoreError>;

    /// Appends to a keyed collection and returns the store-assigned key.
    fn push(&self, namespace: &Namespace, path: StorePath, value: Value) -> Result<String, StoreError>;
}
