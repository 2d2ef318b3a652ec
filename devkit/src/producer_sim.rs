/*!
Field backend simulator

Plays the producer side of the remote tree the way the field controller
does: it listens on `control/command` and `control/config_update`, consumes
and clears whatever it finds there, reports its state on `status` and
publishes its readings on `latest` and `history`.

Nothing runs on its own: `poll()` is one pass of the controller's listeners,
so tests decide exactly when the backend reacts.
*/

use crate::records::{status, RecordBuilder};
use fieldwatch_core::{Command, ConnectionState, MemoryStore, Namespace, StorePath};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// What one `poll()` consumed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollOutcome {
    pub command: Option<Command>,
    pub config_update: Option<Value>,
    /// Namespace the simulator moved to while applying the update.
    pub moved_to: Option<Namespace>,
}

impl PollOutcome {
    pub fn is_empty(&self) -> bool {
        self.command.is_none() && self.config_update.is_none()
    }
}

pub struct ProducerSim {
    store: Arc<MemoryStore>,
    namespace: Namespace,
    device_address: String,
    device_port: u16,
    unit: String,
    running: bool,
    reported: Option<ConnectionState>,
}

impl ProducerSim {
    pub fn new(store: Arc<MemoryStore>, namespace: Namespace) -> Self {
        Self {
            store,
            namespace,
            device_address: "192.168.1.100".into(),
            device_port: 4001,
            unit: "ppm".into(),
            running: false,
            reported: None,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Controller start-up: leftover requests are dropped, the device is
    /// reported stopped and the current config is published.
    pub fn boot(&mut self) {
        self.store.take_value(&self.namespace, StorePath::Command);
        self.store.take_value(&self.namespace, StorePath::ConfigUpdate);
        self.running = false;
        self.report(ConnectionState::Stopped, "");
        self.publish_config();
        log::info!("🟢 producer sim up on {}", self.namespace);
    }

    pub fn config(&self) -> Value {
        json!({
            "project_id": self.namespace.as_str(),
            "gps_ip": self.device_address,
            "gps_port": self.device_port,
            "conc_unit": self.unit,
        })
    }

    /// One pass over both request paths.
    pub fn poll(&mut self) -> PollOutcome {
        let mut outcome = PollOutcome::default();

        if let Some(raw) = self.store.take_value(&self.namespace, StorePath::Command) {
            outcome.command = self.on_command(&raw);
        }
        if let Some(update) = self.store.take_value(&self.namespace, StorePath::ConfigUpdate) {
            outcome.moved_to = self.reconfigure(&update);
            outcome.config_update = Some(update);
        }
        outcome
    }

    fn on_command(&mut self, raw: &Value) -> Option<Command> {
        let text = match raw {
            Value::String(s) => s.to_lowercase(),
            other => other.to_string(),
        };
        if text.trim().is_empty() {
            return None;
        }
        let Some(command) = Command::parse(&text) else {
            log::warn!("⚠️ producer sim: unknown command {text:?}");
            return None;
        };
        log::info!("📩 producer sim: {command}");
        match command {
            Command::Start if self.running => log::warn!("producer sim already running"),
            Command::Start => {
                self.running = true;
                self.report(ConnectionState::Connecting, "");
            }
            Command::Stop if !self.running => log::warn!("producer sim not running"),
            Command::Stop => {
                self.running = false;
                self.report(ConnectionState::Stopped, "");
            }
        }
        Some(command)
    }

    /// Merges a config patch, as if the operator edited the controller's
    /// config file. A new `project_id` moves the simulator to that namespace.
    pub fn reconfigure(&mut self, update: &Value) -> Option<Namespace> {
        let Some(patch) = update.as_object() else {
            log::warn!("⚠️ producer sim: ignoring config update {update}");
            return None;
        };
        log::info!("⚙️ producer sim: config update {update}");

        if let Some(address) = text_field(patch, "gps_ip") {
            self.device_address = address;
        }
        if let Some(port) = text_field(patch, "gps_port") {
            match port.parse() {
                Ok(p) => self.device_port = p,
                Err(_) => log::warn!("producer sim: bad gps_port {port:?}"),
            }
        }
        if let Some(unit) = text_field(patch, "conc_unit") {
            self.unit = unit;
        }

        let target = text_field(patch, "project_id").and_then(|raw| Namespace::parse(&raw).ok());
        let moved = match target {
            Some(target) if target != self.namespace => {
                self.move_to(target.clone());
                Some(target)
            }
            _ => None,
        };
        self.publish_config();
        moved
    }

    fn move_to(&mut self, target: Namespace) {
        self.report(ConnectionState::Offline, &format!("Switching to project {target}"));
        log::info!("🔀 producer sim: {} -> {target}", self.namespace);
        self.running = false;
        self.namespace = target;
        self.reported = None;
        self.report(ConnectionState::Stopped, "");
    }

    /// Writes one reading while running. Returns the history key.
    pub fn emit(&mut self, sample: &RecordBuilder) -> Option<String> {
        if !self.running {
            log::warn!("producer sim: not running, sample dropped");
            return None;
        }
        let record = sample.build();
        self.store
            .publish_value(&self.namespace, StorePath::Latest, Some(record.clone()));
        let key = self.store.append_history(&self.namespace, record);
        if self.reported != Some(ConnectionState::Active) {
            self.report(ConnectionState::Active, "");
        }
        Some(key)
    }

    /// Forces a status, e.g. a lost signal or a device timeout.
    pub fn report(&mut self, state: ConnectionState, message: &str) {
        self.store
            .publish_value(&self.namespace, StorePath::Status, Some(status(state, message)));
        self.reported = Some(state);
    }

    /// Removes the status record, as a crashed controller leaves it.
    pub fn vanish(&mut self) {
        self.store.publish_value(&self.namespace, StorePath::Status, None);
        self.running = false;
        self.reported = None;
    }

    fn publish_config(&self) {
        self.store
            .publish_value(&self.namespace, StorePath::CurrentConfig, Some(self.config()));
    }
}

fn text_field(patch: &Map<String, Value>, key: &str) -> Option<String> {
    let text = match patch.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}
