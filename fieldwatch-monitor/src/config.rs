use fieldwatch_core::EngineOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub mqtt: MqttConf,
    /// First topic level; every namespace lives under it.
    pub topic_root: String,
    /// Project shown at startup.
    pub namespace: String,
    /// Identity of the remote store, reported alongside the view.
    pub store_id: String,
    pub http_addr: String,
    pub switch_timeout_secs: u64,
    pub tick_millis: u64,
    pub auto_center: bool,
    pub default_unit: String,
    /// Local settings file; the platform config dir when unset.
    pub settings_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "fieldwatch-monitor".into(),
            keep_alive_secs: 15,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            topic_root: "fieldwatch".into(),
            namespace: "default".into(),
            store_id: "local".into(),
            http_addr: "0.0.0.0:8080".into(),
            switch_timeout_secs: 30,
            tick_millis: 500,
            auto_center: true,
            default_unit: "ppm".into(),
            settings_path: None,
        }
    }
}

impl MonitorConfig {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            switch_timeout: Duration::from_secs(self.switch_timeout_secs),
            default_unit: self.default_unit.clone(),
            auto_center: self.auto_center,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(50))
    }

    /// `FIELDWATCH_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ns) = lookup("FIELDWATCH_NAMESPACE").filter(|v| !v.trim().is_empty()) {
            self.namespace = ns;
        }
        if let Some(host) = lookup("FIELDWATCH_MQTT_HOST").filter(|v| !v.trim().is_empty()) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("FIELDWATCH_MQTT_PORT") {
            match port.trim().parse() {
                Ok(p) => self.mqtt.port = p,
                Err(_) => warn!("[monitor] ignoring invalid FIELDWATCH_MQTT_PORT={port:?}"),
            }
        }
    }
}

pub fn parse_config(txt: &str) -> Result<MonitorConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(MonitorConfig::default());
    }
    serde_yaml::from_str(txt)
}

/// Reads `fieldwatch.yaml` (or `FIELDWATCH_CONFIG`). Missing or invalid files
/// fall back to defaults; environment overrides apply either way.
pub async fn load_config() -> MonitorConfig {
    let path = std::env::var("FIELDWATCH_CONFIG").unwrap_or_else(|_| "fieldwatch.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[monitor] invalid config {path}: {e}");
            MonitorConfig::default()
        })
    } else {
        warn!("[monitor] no {path}, using default config");
        MonitorConfig::default()
    };
    cfg.apply_env();
    cfg
}
