use crate::connection::Posture;
use crate::error::DashboardError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Literal written to `control/command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
        }
    }

    pub fn to_value(self) -> Value {
        Value::String(self.as_str().to_string())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "start" => Some(Command::Start),
            "stop" => Some(Command::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the toggle command from what the UI currently shows.
pub fn command_for(posture: Posture) -> Result<Command, DashboardError> {
    match posture {
        Posture::Recording => Ok(Command::Stop),
        Posture::Idle | Posture::Offline => Ok(Command::Start),
        Posture::Switching => Err(DashboardError::ControlsLocked),
    }
}
