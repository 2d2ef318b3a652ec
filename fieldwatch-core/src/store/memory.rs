//! In-process remote store.
//!
//! Holds the whole tree in memory and queues notifications in an outbox
//! instead of delivering them, so a driver (or a test) decides when and in
//! which order the engine sees them. The producer side of the API lets the
//! devkit simulator play the field backend against the same tree.

use super::{Generation, Namespace, RemoteStore, StoreError, StoreEvent, StorePath};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// One engine-initiated write, kept for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub namespace: Namespace,
    pub path: StorePath,
    pub value: Value,
}

#[derive(Default)]
struct Inner {
    values: HashMap<(Namespace, StorePath), Value>,
    history: HashMap<Namespace, Vec<(String, Value)>>,
    attached: HashSet<Namespace>,
    outbox: VecDeque<StoreEvent>,
    writes: Vec<WriteRecord>,
    reject_writes: Option<String>,
    next_key: u64,
}

impl Inner {
    fn notify_value(&mut self, namespace: &Namespace, path: StorePath) {
        if self.attached.contains(namespace) {
            let value = self.values.get(&(namespace.clone(), path)).cloned();
            self.outbox.push_back(StoreEvent::Value {
                namespace: namespace.clone(),
                path,
                value,
            });
        }
    }

    fn append(&mut self, namespace: &Namespace, value: Value) -> String {
        self.next_key += 1;
        // Zero-padded so lexical key order matches insertion order.
        let key = format!("-k{:012}", self.next_key);
        self.history
            .entry(namespace.clone())
            .or_default()
            .push((key.clone(), value.clone()));
        if self.attached.contains(namespace) {
            self.outbox.push_back(StoreEvent::ChildAdded {
                namespace: namespace.clone(),
                key: key.clone(),
                value,
            });
        }
        key
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- producer side ----

    /// Overwrites (or removes, with `None`) any path, as the producer would.
    pub fn publish_value(&self, namespace: &Namespace, path: StorePath, value: Option<Value>) {
        let mut inner = self.inner.lock();
        let slot = (namespace.clone(), path);
        match value {
            Some(v) if !v.is_null() => {
                inner.values.insert(slot, v);
            }
            _ => {
                inner.values.remove(&slot);
            }
        }
        inner.notify_value(namespace, path);
    }

    pub fn append_history(&self, namespace: &Namespace, value: Value) -> String {
        self.inner.lock().append(namespace, value)
    }

    pub fn value(&self, namespace: &Namespace, path: StorePath) -> Option<Value> {
        self.inner.lock().values.get(&(namespace.clone(), path)).cloned()
    }

    /// Reads and clears a path, as the producer does with consumed requests.
    pub fn take_value(&self, namespace: &Namespace, path: StorePath) -> Option<Value> {
        let mut inner = self.inner.lock();
        let taken = inner.values.remove(&(namespace.clone(), path));
        if taken.is_some() {
            inner.notify_value(namespace, path);
        }
        taken
    }

    pub fn history(&self, namespace: &Namespace) -> Vec<(String, Value)> {
        self.inner
            .lock()
            .history
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    // ---- driver / test side ----

    pub fn drain_events(&self) -> Vec<StoreEvent> {
        self.inner.lock().outbox.drain(..).collect()
    }

    pub fn pending_events(&self) -> usize {
        self.inner.lock().outbox.len()
    }

    pub fn is_attached(&self, namespace: &Namespace) -> bool {
        self.inner.lock().attached.contains(namespace)
    }

    /// Makes every following engine write fail with `reason` (or succeed again with `None`).
    pub fn reject_writes(&self, reason: Option<&str>) {
        self.inner.lock().reject_writes = reason.map(str::to_string);
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.lock().writes.clone()
    }

    pub fn writes_to(&self, path: StorePath) -> Vec<WriteRecord> {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|w| w.path == path)
            .cloned()
            .collect()
    }

    fn check_write(inner: &Inner, namespace: &Namespace, path: StorePath) -> Result<(), StoreError> {
        match &inner.reject_writes {
            Some(reason) => Err(StoreError::Rejected {
                path: path.under(namespace),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl RemoteStore for MemoryStore {
    fn attach(&self, namespace: &Namespace, generation: Generation) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.attached.insert(namespace.clone());
        for path in StorePath::WATCHED {
            inner.notify_value(namespace, path);
        }
        let entries = inner.history.get(namespace).cloned().unwrap_or_default();
        debug!("memory store: attach {namespace} (gen {}), {} history entries", generation.0, entries.len());
        inner.outbox.push_back(StoreEvent::Snapshot {
            namespace: namespace.clone(),
            generation,
            entries,
        });
        Ok(())
    }

    fn detach(&self, namespace: &Namespace) -> Result<(), StoreError> {
        self.inner.lock().attached.remove(namespace);
        Ok(())
    }

    fn set(&self, namespace: &Namespace, path: StorePath, value: Value) -> Result<(), StoreError> {
        if !path.is_engine_writable() {
            return Err(StoreError::ReadOnly(path));
        }
        let mut inner = self.inner.lock();
        Self::check_write(&inner, namespace, path)?;
        inner.writes.push(WriteRecord {
            namespace: namespace.clone(),
            path,
            value: value.clone(),
        });
        inner.values.insert((namespace.clone(), path), value);
        inner.notify_value(namespace, path);
        Ok(())
    }

    fn push(&self, namespace: &Namespace, path: StorePath, value: Value) -> Result<String, StoreError> {
        if path != StorePath::History {
            return Err(StoreError::ReadOnly(path));
        }
        let mut inner = self.inner.lock();
        Self::check_write(&inner, namespace, path)?;
        inner.writes.push(WriteRecord {
            namespace: namespace.clone(),
            path,
            value: value.clone(),
        });
        Ok(inner.append(namespace, value))
    }
}
