//! History ingestion with exactly-once delivery.
//!
//! The feed reaches us twice: one bulk snapshot when a namespace is attached
//! and a standing "child added" subscription that may overlap with it. Every
//! key goes through the [`DedupIndex`] first; whichever path sees a key first
//! surfaces it, the other drops it silently.
//!
//! The feed is scoped by a [`Generation`] token. Attaching (or re-attaching)
//! a namespace bumps the generation and throws away the index and the
//! in-memory sequence; a snapshot that arrives stamped with an older
//! generation is discarded.

use crate::record::{normalize, PositionSample};
use crate::store::{Generation, Namespace};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub key: String,
    pub sample: PositionSample,
}

/// Keys already surfaced for the current generation.
#[derive(Debug, Default)]
pub struct DedupIndex {
    seen: HashSet<String>,
}

impl DedupIndex {
    /// Returns `true` the first time a key is marked.
    pub fn mark(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn clear(&mut self) {
        self.seen.clear();
    }
}

/// Output of the bulk path: one batch for a single initial render.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialBatch {
    /// New records, sorted by timestamp.
    pub records: Vec<HistoryRecord>,
    /// Last record with coordinates in the batch.
    pub last_position: Option<(f64, f64)>,
    /// Set when a snap directive was pending and the batch had a position.
    pub snap_to: Option<(f64, f64)>,
}

#[derive(Debug, Default)]
pub struct HistoryFeed {
    namespace: Option<Namespace>,
    generation: Generation,
    index: DedupIndex,
    records: Vec<HistoryRecord>,
    snap_pending: bool,
}

impl HistoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fresh view of `namespace` and returns the generation to stamp
    /// the bulk read with.
    pub fn reset(&mut self, namespace: Namespace) -> Generation {
        self.generation = self.generation.next();
        self.index.clear();
        self.records.clear();
        debug!("history: reset to {namespace} (gen {})", self.generation.0);
        self.namespace = Some(namespace);
        self.generation
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn namespace(&self) -> Option<&Namespace> {
        self.namespace.as_ref()
    }

    /// Asks the next bulk batch to report its last known point.
    pub fn request_snap(&mut self) {
        self.snap_pending = true;
    }

    pub fn snap_pending(&self) -> bool {
        self.snap_pending
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn find(&self, key: &str) -> Option<&HistoryRecord> {
        self.records.iter().find(|r| r.key == key)
    }

    fn is_current(&self, namespace: &Namespace) -> bool {
        self.namespace.as_ref() == Some(namespace)
    }

    pub fn ingest_snapshot(
        &mut self,
        namespace: &Namespace,
        generation: Generation,
        entries: Vec<(String, Value)>,
    ) -> Option<InitialBatch> {
        if !self.is_current(namespace) || generation != self.generation {
            warn!(
                "history: discarding stale snapshot for {namespace} (gen {}, current gen {})",
                generation.0, self.generation.0
            );
            return None;
        }

        let mut batch = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if !self.index.mark(&key) {
                continue;
            }
            if let Some(sample) = normalize(&value) {
                batch.push(HistoryRecord { key, sample });
            }
        }
        batch.sort_by(|x, y| x.sample.timestamp.cmp(&y.sample.timestamp));

        let last_position = batch.iter().rev().find_map(|r| r.sample.position());
        let snap_to = if self.snap_pending {
            self.snap_pending = false;
            last_position
        } else {
            None
        };

        for record in &batch {
            self.insert_ordered(record.clone());
        }
        debug!(
            "history: snapshot for {namespace} surfaced {} records ({} keys indexed)",
            batch.len(),
            self.index.len()
        );

        Some(InitialBatch {
            records: batch,
            last_position,
            snap_to,
        })
    }

    pub fn ingest_appended(&mut self, namespace: &Namespace, key: &str, value: &Value) -> Option<HistoryRecord> {
        if !self.is_current(namespace) {
            debug!("history: append {key} for detached {namespace} ignored");
            return None;
        }
        if !self.index.mark(key) {
            return None;
        }
        let sample = normalize(value)?;
        let record = HistoryRecord {
            key: key.to_string(),
            sample,
        };
        self.insert_ordered(record.clone());
        Some(record)
    }

    fn insert_ordered(&mut self, record: HistoryRecord) {
        let at = self
            .records
            .partition_point(|r| r.sample.timestamp <= record.sample.timestamp);
        self.records.insert(at, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn ns(s: &str) -> Namespace {
        Namespace::parse(s).unwrap()
    }

    fn entry(key: &str, ts: &str, lat: Option<f64>) -> (String, Value) {
        let mut v = json!({"timestamp": ts, "conc": 10.0});
        if let Some(lat) = lat {
            v["lat"] = json!(lat);
            v["lon"] = json!(121.0);
        }
        (key.to_string(), v)
    }

    #[test]
    fn test_empty_feed_is_an_empty_batch() {
        let mut feed = HistoryFeed::new();
        let p = ns("p");
        let generation = feed.reset(p.clone());
        let batch = feed.ingest_snapshot(&p, generation, Vec::new()).unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.last_position, None);
    }

    #[test]
    fn test_snapshot_is_sorted_and_seeds_last_position() {
        let mut feed = HistoryFeed::new();
        let p = ns("p");
        let generation = feed.reset(p.clone());
        let batch = feed
            .ingest_snapshot(
                &p,
                generation,
                vec![
                    entry("k3", "2024-01-01 10:00:03", None),
                    entry("k1", "2024-01-01 10:00:01", Some(25.1)),
                    entry("k2", "2024-01-01 10:00:02", Some(25.2)),
                ],
            )
            .unwrap();
        let keys: Vec<_> = batch.records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["k1", "k2", "k3"]);
        assert_eq!(batch.last_position, Some((25.2, 121.0)));
        assert_eq!(batch.snap_to, None);
    }

    #[test]
    fn test_snap_directive_is_consumed_once() {
        let mut feed = HistoryFeed::new();
        let p = ns("p");
        feed.request_snap();
        let generation = feed.reset(p.clone());
        let batch = feed
            .ingest_snapshot(&p, generation, vec![entry("k1", "1", Some(1.0))])
            .unwrap();
        assert_eq!(batch.snap_to, Some((1.0, 121.0)));
        assert!(!feed.snap_pending());

        // no coordinates at all: falls back silently
        let mut feed = HistoryFeed::new();
        feed.request_snap();
        let generation = feed.reset(p.clone());
        let batch = feed.ingest_snapshot(&p, generation, vec![entry("k1", "1", None)]).unwrap();
        assert_eq!(batch.snap_to, None);
    }

    #[test]
    fn test_overlap_is_surfaced_exactly_once_in_any_order() {
        let p = ns("p");
        let all = ["a", "b", "c", "d", "e"];
        // (keys in snapshot, keys delivered incrementally before it, after it)
        let interleavings: [(&[&str], &[&str], &[&str]); 5] = [
            (&["a", "b", "c"], &[], &["c", "d", "e"]),
            (&["a", "b", "c", "d", "e"], &["e", "d"], &["a"]),
            (&[], &["a", "b"], &["c", "d", "e", "a"]),
            (&["c", "a"], &["b", "d", "e"], &["e", "b"]),
            (&["a", "b", "c", "d", "e"], &[], &["a", "b", "c", "d", "e"]),
        ];

        for (snapshot, before, after) in interleavings {
            let mut feed = HistoryFeed::new();
            let generation = feed.reset(p.clone());
            let mut surfaced: HashMap<String, usize> = HashMap::new();
            let value = |k: &str| json!({"timestamp": format!("t-{k}")});

            for k in before {
                if let Some(r) = feed.ingest_appended(&p, k, &value(k)) {
                    *surfaced.entry(r.key).or_default() += 1;
                }
            }
            let entries = snapshot.iter().map(|k| (k.to_string(), value(k))).collect();
            for r in feed.ingest_snapshot(&p, generation, entries).unwrap().records {
                *surfaced.entry(r.key).or_default() += 1;
            }
            for k in after {
                if let Some(r) = feed.ingest_appended(&p, k, &value(k)) {
                    *surfaced.entry(r.key).or_default() += 1;
                }
            }

            assert_eq!(surfaced.len(), all.len(), "missing keys for {snapshot:?}/{before:?}/{after:?}");
            assert!(surfaced.values().all(|&n| n == 1), "duplicates: {surfaced:?}");
            assert_eq!(feed.records().len(), all.len());
        }
    }

    #[test]
    fn test_stale_generation_and_namespace_are_discarded() {
        let mut feed = HistoryFeed::new();
        let a = ns("a");
        let b = ns("b");
        let old = feed.reset(a.clone());
        let fresh = feed.reset(a.clone());
        assert!(feed.ingest_snapshot(&a, old, vec![entry("k1", "1", None)]).is_none());
        assert!(feed.records().is_empty());

        feed.reset(b.clone());
        assert!(feed.ingest_snapshot(&a, fresh, vec![entry("k1", "1", None)]).is_none());
        assert!(feed.ingest_appended(&a, "k2", &json!({"timestamp": "2"})).is_none());
        assert_eq!(feed.namespace(), Some(&b));
    }

    #[test]
    fn test_reset_forgets_previous_keys() {
        let mut feed = HistoryFeed::new();
        let p = ns("p");
        feed.reset(p.clone());
        assert!(feed.ingest_appended(&p, "k1", &json!({"timestamp": "1"})).is_some());
        feed.reset(p.clone());
        assert!(feed.ingest_appended(&p, "k1", &json!({"timestamp": "1"})).is_some());
        assert_eq!(feed.records().len(), 1);
    }

    #[test]
    fn test_malformed_entries_are_dropped_once() {
        let mut feed = HistoryFeed::new();
        let p = ns("p");
        let generation = feed.reset(p.clone());
        let batch = feed
            .ingest_snapshot(&p, generation, vec![("bad".into(), json!({"lat": 1.0}))])
            .unwrap();
        assert!(batch.records.is_empty());
        assert!(feed.ingest_appended(&p, "bad", &json!({"timestamp": "now"})).is_none());
    }

    #[test]
    fn test_late_append_is_kept_in_time_order() {
        let mut feed = HistoryFeed::new();
        let p = ns("p");
        feed.reset(p.clone());
        feed.ingest_appended(&p, "k2", &json!({"timestamp": "2"}));
        feed.ingest_appended(&p, "k1", &json!({"timestamp": "1"}));
        let keys: Vec<_> = feed.records().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["k1", "k2"]);
        assert!(feed.find("k2").is_some());
    }
}
