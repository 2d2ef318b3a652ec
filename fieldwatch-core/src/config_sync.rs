//! Bidirectional sync of backend parameters and thresholds.
//!
//! Backend parameters flow in from `settings/current_config` and out through
//! the write-only `control/config_update` patch location. Thresholds flow
//! both ways through `settings/thresholds`. In both directions an input that
//! currently holds focus is never overwritten under the operator.

use crate::store::Namespace;
use crate::thresholds::{ThresholdConfig, ThresholdError, ThresholdField};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

/// Producer-side configuration snapshot, in the producer's field names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "project_id", default)]
    pub namespace: String,
    #[serde(rename = "gps_ip", default)]
    pub device_address: String,
    #[serde(rename = "gps_port", default, deserialize_with = "scalar_string")]
    pub device_port: String,
    #[serde(rename = "conc_unit", default)]
    pub unit: String,
}

// The producer writes its port as an integer, operators type it as text.
fn scalar_string<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(de)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

impl BackendConfig {
    pub fn from_value(value: &Value) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!("config: unreadable current_config ({e}): {value}");
                None
            }
        }
    }

    pub fn get(&self, field: ConfigField) -> &str {
        match field {
            ConfigField::Namespace => &self.namespace,
            ConfigField::DeviceAddress => &self.device_address,
            ConfigField::DevicePort => &self.device_port,
            ConfigField::Unit => &self.unit,
        }
    }

    fn slot(&mut self, field: ConfigField) -> &mut String {
        match field {
            ConfigField::Namespace => &mut self.namespace,
            ConfigField::DeviceAddress => &mut self.device_address,
            ConfigField::DevicePort => &mut self.device_port,
            ConfigField::Unit => &mut self.unit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    Namespace,
    DeviceAddress,
    DevicePort,
    Unit,
}

impl ConfigField {
    pub const ALL: [ConfigField; 4] = [
        ConfigField::Namespace,
        ConfigField::DeviceAddress,
        ConfigField::DevicePort,
        ConfigField::Unit,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            ConfigField::Namespace => "project_id",
            ConfigField::DeviceAddress => "gps_ip",
            ConfigField::DevicePort => "gps_port",
            ConfigField::Unit => "conc_unit",
        }
    }
}

/// Any operator input that can hold focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InputField {
    Config(ConfigField),
    Threshold(ThresholdField),
}

impl InputField {
    pub fn name(self) -> &'static str {
        match self {
            InputField::Config(f) => f.wire_name(),
            InputField::Threshold(f) => f.settings_key(),
        }
    }
}

impl TryFrom<String> for InputField {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        ConfigField::ALL
            .into_iter()
            .map(InputField::Config)
            .chain(ThresholdField::ALL.into_iter().map(InputField::Threshold))
            .find(|f| f.name() == raw)
            .ok_or_else(|| format!("unknown input field {raw:?}"))
    }
}

impl From<InputField> for String {
    fn from(field: InputField) -> Self {
        field.name().to_string()
    }
}

impl fmt::Display for InputField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Partial update proposed to the producer. Empty fields are left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(rename = "project_id", default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "gps_ip", default, skip_serializing_if = "Option::is_none")]
    pub device_address: Option<String>,
    #[serde(rename = "gps_port", default, skip_serializing_if = "Option::is_none")]
    pub device_port: Option<String>,
    #[serde(rename = "conc_unit", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl ConfigPatch {
    fn fields(&self) -> [(ConfigField, Option<&str>); 4] {
        [
            (ConfigField::Namespace, self.namespace.as_deref()),
            (ConfigField::DeviceAddress, self.device_address.as_deref()),
            (ConfigField::DevicePort, self.device_port.as_deref()),
            (ConfigField::Unit, self.unit.as_deref()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.fields()
            .iter()
            .all(|(_, v)| v.map_or(true, |s| s.trim().is_empty()))
    }

    /// Wire payload for `control/config_update`.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        for (field, value) in self.fields() {
            let Some(value) = value.map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };
            let wire = match field {
                ConfigField::DevicePort => value
                    .parse::<u16>()
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::String(value.to_string())),
                _ => Value::String(value.to_string()),
            };
            obj.insert(field.wire_name().to_string(), wire);
        }
        Value::Object(obj)
    }
}

/// Settings editor state: open flag and the text currently in each input.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettingsEditor {
    pub open: bool,
    pub inputs: BackendConfig,
}

#[derive(Debug, Default)]
pub struct ConfigSync {
    view: BackendConfig,
    editor: SettingsEditor,
    focus: Option<ConfigField>,
}

impl ConfigSync {
    pub fn new(namespace: &Namespace) -> Self {
        let mut sync = Self::default();
        sync.view.namespace = namespace.to_string();
        sync
    }

    pub fn view(&self) -> &BackendConfig {
        &self.view
    }

    pub fn editor(&self) -> &SettingsEditor {
        &self.editor
    }

    /// Navigation owns the namespace; this is the only way it changes.
    pub fn set_route_namespace(&mut self, namespace: &Namespace) {
        self.view.namespace = namespace.to_string();
        self.refresh_editor();
    }

    /// Merges a remote `current_config`. Returns whether the view changed.
    pub fn on_remote_config(&mut self, value: Option<&Value>) -> bool {
        let Some(remote) = value.and_then(BackendConfig::from_value) else {
            return false;
        };
        if !remote.namespace.is_empty() && remote.namespace != self.view.namespace {
            debug!(
                "config: producer reports project {:?} while viewing {:?}; route unchanged",
                remote.namespace, self.view.namespace
            );
        }

        let before = self.view.clone();
        for field in [ConfigField::DeviceAddress, ConfigField::DevicePort, ConfigField::Unit] {
            let incoming = remote.get(field);
            if !incoming.is_empty() {
                *self.view.slot(field) = incoming.to_string();
            }
        }
        self.refresh_editor();
        before != self.view
    }

    pub fn open_editor(&mut self) {
        self.editor.open = true;
        self.editor.inputs = self.view.clone();
    }

    pub fn close_editor(&mut self) {
        self.editor.open = false;
        self.focus = None;
    }

    pub fn focus(&mut self, field: ConfigField) {
        self.focus = Some(field);
    }

    pub fn blur(&mut self, field: ConfigField) {
        if self.focus == Some(field) {
            self.focus = None;
        }
    }

    pub fn focused(&self) -> Option<ConfigField> {
        self.focus
    }

    /// Operator typing into an editor input.
    pub fn type_into(&mut self, field: ConfigField, text: &str) {
        *self.editor.inputs.slot(field) = text.to_string();
    }

    /// Patch of the editor inputs that differ from the view.
    pub fn editor_patch(&self) -> ConfigPatch {
        let changed = |field: ConfigField| {
            let input = self.editor.inputs.get(field).trim();
            (!input.is_empty() && input != self.view.get(field)).then(|| input.to_string())
        };
        ConfigPatch {
            namespace: changed(ConfigField::Namespace),
            device_address: changed(ConfigField::DeviceAddress),
            device_port: changed(ConfigField::DevicePort),
            unit: changed(ConfigField::Unit),
        }
    }

    fn refresh_editor(&mut self) {
        if !self.editor.open {
            return;
        }
        for field in ConfigField::ALL {
            if self.focus == Some(field) {
                continue;
            }
            *self.editor.inputs.slot(field) = self.view.get(field).to_string();
        }
    }
}

/// What a remote threshold delivery did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RemoteThresholds {
    /// Adopted as the committed set.
    Applied(ThresholdConfig),
    /// Held back until the focused input is released.
    Parked,
    /// Remote was empty: the local set should be published.
    Republish(ThresholdConfig),
    /// Same as committed.
    Unchanged,
    /// Invalid payload, nothing changed.
    Ignored,
}

#[derive(Debug)]
pub struct ThresholdSync {
    committed: ThresholdConfig,
    parked: Option<ThresholdConfig>,
    focus: Option<ThresholdField>,
}

impl ThresholdSync {
    pub fn new(seed: ThresholdConfig) -> Self {
        Self {
            committed: seed,
            parked: None,
            focus: None,
        }
    }

    pub fn committed(&self) -> ThresholdConfig {
        self.committed
    }

    pub fn parked(&self) -> Option<ThresholdConfig> {
        self.parked
    }

    /// Validates operator input and commits all three values, or none.
    pub fn commit(&mut self, a: &str, b: &str, c: &str) -> Result<ThresholdConfig, ThresholdError> {
        let cfg = ThresholdConfig::parse(a, b, c)?;
        self.committed = cfg;
        self.parked = None;
        Ok(cfg)
    }

    pub fn on_remote(&mut self, value: Option<&Value>) -> RemoteThresholds {
        let value = match value {
            None | Some(Value::Null) => return RemoteThresholds::Republish(self.committed),
            Some(Value::Object(obj)) if obj.is_empty() => return RemoteThresholds::Republish(self.committed),
            Some(v) => v,
        };
        let remote: ThresholdConfig = match serde_json::from_value(value.clone()) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("thresholds: ignoring remote set ({e}): {value}");
                return RemoteThresholds::Ignored;
            }
        };
        if remote == self.committed {
            self.parked = None;
            return RemoteThresholds::Unchanged;
        }
        if self.focus.is_some() {
            debug!("thresholds: remote update parked while an input holds focus");
            self.parked = Some(remote);
            return RemoteThresholds::Parked;
        }
        self.committed = remote;
        RemoteThresholds::Applied(remote)
    }

    pub fn focus(&mut self, field: ThresholdField) {
        self.focus = Some(field);
    }

    /// Releases focus and applies any parked remote set.
    pub fn blur(&mut self, field: ThresholdField) -> Option<ThresholdConfig> {
        if self.focus != Some(field) {
            return None;
        }
        self.focus = None;
        let parked = self.parked.take()?;
        self.committed = parked;
        Some(parked)
    }

    pub fn to_value(cfg: &ThresholdConfig) -> Value {
        serde_json::json!({ "a": cfg.a(), "b": cfg.b(), "c": cfg.c() })
    }
}
