//! Local persisted settings.
//!
//! A flat map of scalar strings, read at startup. The engine keeps two things
//! here: the last committed thresholds (a seed only, the remote copy wins once
//! it arrives) and the durable switch intent, so a restart in the middle of a
//! handoff still knows it was switching.

use crate::connection::SwitchIntent;
use crate::thresholds::{ThresholdConfig, ThresholdField};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const SWITCH_INTENT_KEY: &str = "switch_intent";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {path} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("cannot encode settings: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("cannot encode value for {key}: {reason}")]
    Value { key: String, reason: String },
}

pub trait SettingsStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError>;
    fn remove(&mut self, key: &str) -> Result<(), SettingsError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    values: HashMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), SettingsError> {
        self.values.remove(key);
        Ok(())
    }
}

/// TOML-backed settings. Every write rewrites the whole file.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileSettings {
    /// `~/.config/fieldwatch/settings.toml` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fieldwatch").join("settings.toml"))
    }

    /// Opens `path`; a missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = if path.exists() {
            let txt = fs::read_to_string(&path).map_err(|source| SettingsError::Io {
                path: path.clone(),
                source,
            })?;
            toml::from_str(&txt).map_err(|source| SettingsError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            debug!("settings: {} does not exist yet", path.display());
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let txt = toml::to_string(&self.values)?;
        fs::write(&self.path, txt).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl SettingsStore for FileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<(), SettingsError> {
        if self.values.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

/// Last thresholds the operator committed, if all three keys hold a valid set.
pub fn load_threshold_seed(store: &dyn SettingsStore) -> Option<ThresholdConfig> {
    let values: Vec<String> = ThresholdField::ALL
        .iter()
        .map(|f| store.get(f.settings_key()))
        .collect::<Option<_>>()?;
    match ThresholdConfig::parse(&values[0], &values[1], &values[2]) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warn!("settings: ignoring stored thresholds ({e})");
            None
        }
    }
}

pub fn save_threshold_seed(store: &mut dyn SettingsStore, cfg: &ThresholdConfig) -> Result<(), SettingsError> {
    for field in ThresholdField::ALL {
        store.set(field.settings_key(), &cfg.get(field).to_string())?;
    }
    Ok(())
}

pub fn load_switch_intent(store: &dyn SettingsStore) -> Option<SwitchIntent> {
    let raw = store.get(SWITCH_INTENT_KEY)?;
    match serde_json::from_str(&raw) {
        Ok(intent) => Some(intent),
        Err(e) => {
            warn!("settings: unreadable switch intent {raw:?} ({e})");
            None
        }
    }
}

pub fn save_switch_intent(store: &mut dyn SettingsStore, intent: &SwitchIntent) -> Result<(), SettingsError> {
    let raw = serde_json::to_string(intent).map_err(|e| SettingsError::Value {
        key: SWITCH_INTENT_KEY.to_string(),
        reason: e.to_string(),
    })?;
    store.set(SWITCH_INTENT_KEY, &raw)
}

pub fn clear_switch_intent(store: &mut dyn SettingsStore) -> Result<(), SettingsError> {
    store.remove(SWITCH_INTENT_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Namespace;
    use time::macros::datetime;

    #[test]
    fn test_threshold_seed_requires_all_three_valid_keys() {
        let mut store = MemorySettings::new().with("th_a", "10").with("th_b", "20");
        assert_eq!(load_threshold_seed(&store), None);

        store.set("th_c", "30").unwrap();
        assert_eq!(load_threshold_seed(&store), Some(ThresholdConfig::new(10.0, 20.0, 30.0).unwrap()));

        store.set("th_c", "15").unwrap();
        assert_eq!(load_threshold_seed(&store), None);
    }

    #[test]
    fn test_threshold_seed_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let cfg = ThresholdConfig::new(1.5, 2.5, 3.5).unwrap();
        {
            let mut file = FileSettings::open(&path).unwrap();
            save_threshold_seed(&mut file, &cfg).unwrap();
        }
        let file = FileSettings::open(&path).unwrap();
        assert_eq!(load_threshold_seed(&file), Some(cfg));
        assert_eq!(file.get("th_b").as_deref(), Some("2.5"));
    }

    #[test]
    fn test_switch_intent_persists() {
        let mut store = MemorySettings::new();
        let intent = SwitchIntent {
            target: Namespace::parse("next").unwrap(),
            deadline: datetime!(2024-03-01 12:00:30 UTC),
        };
        save_switch_intent(&mut store, &intent).unwrap();
        assert_eq!(load_switch_intent(&store), Some(intent));
        clear_switch_intent(&mut store).unwrap();
        assert_eq!(load_switch_intent(&store), None);

        store.set(SWITCH_INTENT_KEY, "garbage").unwrap();
        assert_eq!(load_switch_intent(&store), None);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "th_a = [").unwrap();
        assert!(matches!(FileSettings::open(&path), Err(SettingsError::Parse { .. })));
    }
}
