//! MQTT rendition of the remote store.
//!
//! Topic layout, per namespace:
//!
//! ```text
//! {root}/{ns}/status | latest | settings/* | control/*   retained single values
//! {root}/{ns}/history/added                              {key, record} appends
//! {root}/{ns}/history/append                             append requests from us
//! {root}/{ns}/history/snapshot/request                   {request_id, generation}
//! {root}/{ns}/history/snapshot/response                  {request_id, generation, entries}
//! ```
//!
//! An empty retained payload means the value is absent. Writes are accepted
//! once rumqttc has queued them; the broker round trip is not awaited.

use crate::config::MonitorConfig;
use crate::state::SharedDashboard;
use fieldwatch_core::{Generation, Namespace, RemoteStore, StoreError, StoreEvent, StorePath};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const APPENDED: &str = "history/added";
const APPEND_REQUEST: &str = "history/append";
const SNAPSHOT_REQUEST: &str = "history/snapshot/request";
const SNAPSHOT_RESPONSE: &str = "history/snapshot/response";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntryWire {
    pub key: String,
    pub record: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub request_id: String,
    pub generation: Generation,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SnapshotResponse {
    pub request_id: String,
    pub generation: Generation,
    #[serde(default)]
    pub entries: Vec<HistoryEntryWire>,
}

/// A decoded publish, before snapshot responses are matched to requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(StoreEvent),
    Snapshot {
        namespace: Namespace,
        response: SnapshotResponse,
    },
}

#[derive(Debug, Clone)]
pub struct Topics {
    root: String,
}

impl Topics {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_matches('/').to_string(),
        }
    }

    fn under(&self, namespace: &Namespace, relative: &str) -> String {
        format!("{}/{}/{}", self.root, namespace, relative)
    }

    pub fn path(&self, namespace: &Namespace, path: StorePath) -> String {
        self.under(namespace, path.relative())
    }

    /// Every topic `attach` subscribes to.
    pub fn subscriptions(&self, namespace: &Namespace) -> Vec<String> {
        StorePath::WATCHED
            .iter()
            .map(|p| self.path(namespace, *p))
            .chain([
                self.under(namespace, APPENDED),
                self.under(namespace, SNAPSHOT_RESPONSE),
            ])
            .collect()
    }

    fn split<'a>(&self, topic: &'a str) -> Option<(Namespace, &'a str)> {
        let rest = topic.strip_prefix(&self.root)?.strip_prefix('/')?;
        let (ns, relative) = rest.split_once('/')?;
        Some((Namespace::parse(ns).ok()?, relative))
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> Option<Inbound> {
        let (namespace, relative) = self.split(topic)?;
        match relative {
            APPENDED => {
                let entry: HistoryEntryWire = parse_json(topic, payload)?;
                Some(Inbound::Event(StoreEvent::ChildAdded {
                    namespace,
                    key: entry.key,
                    value: entry.record,
                }))
            }
            SNAPSHOT_RESPONSE => {
                let response = parse_json(topic, payload)?;
                Some(Inbound::Snapshot { namespace, response })
            }
            other => {
                let path = StorePath::from_relative(other).filter(|p| StorePath::WATCHED.contains(p))?;
                let value = if payload.is_empty() {
                    None
                } else {
                    Some(parse_json::<Value>(topic, payload)?).filter(|v| !v.is_null())
                };
                Some(Inbound::Event(StoreEvent::Value { namespace, path, value }))
            }
        }
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(topic: &str, payload: &[u8]) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("[mqtt] invalid JSON on {topic}: {e}");
            None
        }
    }
}

pub struct MqttStore {
    client: AsyncClient,
    topics: Topics,
    pending: Mutex<HashMap<String, (Namespace, Generation)>>,
}

impl MqttStore {
    pub fn new(client: AsyncClient, topic_root: &str) -> Self {
        Self {
            client,
            topics: Topics::new(topic_root),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Decodes a publish; snapshot responses are only accepted for a request
    /// this instance made.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Option<StoreEvent> {
        match self.topics.decode(topic, payload)? {
            Inbound::Event(event) => Some(event),
            Inbound::Snapshot { namespace, response } => {
                let requested = self.pending.lock().remove(&response.request_id);
                match requested {
                    Some((ns, generation)) if ns == namespace && generation == response.generation => {
                        Some(StoreEvent::Snapshot {
                            namespace,
                            generation,
                            entries: response.entries.into_iter().map(|e| (e.key, e.record)).collect(),
                        })
                    }
                    Some(_) => {
                        warn!("[mqtt] snapshot {} does not match its request", response.request_id);
                        None
                    }
                    None => {
                        debug!("[mqtt] snapshot {} was not requested here", response.request_id);
                        None
                    }
                }
            }
        }
    }

    fn publish(&self, topic: String, retain: bool, payload: Vec<u8>) -> Result<(), StoreError> {
        self.client
            .try_publish(topic.clone(), QoS::AtLeastOnce, retain, payload)
            .map_err(|e| StoreError::Rejected {
                path: topic,
                reason: e.to_string(),
            })
    }
}

impl RemoteStore for MqttStore {
    fn attach(&self, namespace: &Namespace, generation: Generation) -> Result<(), StoreError> {
        for topic in self.topics.subscriptions(namespace) {
            self.client
                .try_subscribe(topic, QoS::AtLeastOnce)
                .map_err(|_| StoreError::Closed)?;
        }
        let request_id = Uuid::new_v4().to_string();
        let request = SnapshotRequest {
            request_id: request_id.clone(),
            generation,
        };
        let payload = serde_json::to_vec(&request).map_err(|_| StoreError::Closed)?;
        {
            let mut pending = self.pending.lock();
            // Requests of a previous view can no longer be honoured.
            pending.retain(|_, (ns, _)| ns != namespace);
            pending.insert(request_id, (namespace.clone(), generation));
        }
        info!("[mqtt] attached {namespace} (gen {})", generation.0);
        self.publish(self.topics.under(namespace, SNAPSHOT_REQUEST), false, payload)
    }

    fn detach(&self, namespace: &Namespace) -> Result<(), StoreError> {
        self.pending.lock().retain(|_, (ns, _)| ns != namespace);
        for topic in self.topics.subscriptions(namespace) {
            self.client.try_unsubscribe(topic).map_err(|_| StoreError::Closed)?;
        }
        info!("[mqtt] detached {namespace}");
        Ok(())
    }

    fn set(&self, namespace: &Namespace, path: StorePath, value: Value) -> Result<(), StoreError> {
        if !path.is_engine_writable() {
            return Err(StoreError::ReadOnly(path));
        }
        let payload = serde_json::to_vec(&value).map_err(|e| StoreError::Rejected {
            path: path.under(namespace),
            reason: e.to_string(),
        })?;
        self.publish(self.topics.path(namespace, path), true, payload)
    }

    fn push(&self, namespace: &Namespace, path: StorePath, value: Value) -> Result<String, StoreError> {
        if path != StorePath::History {
            return Err(StoreError::ReadOnly(path));
        }
        let key = format!("-{}", Uuid::new_v4().simple());
        let entry = HistoryEntryWire {
            key: key.clone(),
            record: value,
        };
        let payload = serde_json::to_vec(&entry).map_err(|e| StoreError::Rejected {
            path: path.under(namespace),
            reason: e.to_string(),
        })?;
        self.publish(self.topics.under(namespace, APPEND_REQUEST), false, payload)?;
        Ok(key)
    }
}

pub fn create_mqtt_client(cfg: &MonitorConfig) -> (AsyncClient, EventLoop) {
    let client_id = format!("{}-{}", cfg.mqtt.client_id, &Uuid::new_v4().simple().to_string()[..8]);
    let mut opts = MqttOptions::new(client_id, cfg.mqtt.host.clone(), cfg.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_secs.max(5)));
    opts.set_clean_session(true);
    AsyncClient::new(opts, 64)
}

/// Polls the broker and feeds every decoded publish to the dashboard. Each
/// (re)connection re-attaches the current namespace, since a clean session
/// loses its subscriptions.
pub fn spawn_store_listener(
    mut eventloop: EventLoop,
    store: Arc<MqttStore>,
    dashboard: SharedDashboard,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    let mut d = dashboard.lock();
                    info!("[mqtt] connected, attaching {}", d.namespace());
                    if let Err(e) = d.start() {
                        error!("[mqtt] attach failed: {e}");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    if let Some(event) = store.decode(&p.topic, &p.payload) {
                        dashboard.lock().handle(event, OffsetDateTime::now_utc());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[mqtt] connection error: {e:?}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}
