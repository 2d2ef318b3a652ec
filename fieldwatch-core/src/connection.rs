//! Connection state machine.
//!
//! Every remote status update (and every deadline tick) is folded into one
//! authoritative [`ConnectionState`] through a fixed priority order:
//!
//! 1. switch intent set, status neither `stopped` nor `active` -> `switching`
//! 2. switch intent set, status `stopped` or `active` -> intent cleared, fall through
//! 3. no status, or `offline` -> `offline`, or `switching` when the producer
//!    says it is moving to another project
//! 4. anything else is adopted verbatim
//!
//! An intent whose deadline has passed is dropped before rule 1 runs, so a
//! failed switch lands on the normal offline handling in the same cycle.

use crate::store::Namespace;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Offline,
    Switching,
    Connecting,
    Active,
    GpsLost,
    ConcLost,
    AllLost,
    Timeout,
    Stopped,
}

impl ConnectionState {
    pub fn parse(raw: &str) -> Option<Self> {
        let state = match raw.trim().to_ascii_lowercase().as_str() {
            "offline" => ConnectionState::Offline,
            "switching" => ConnectionState::Switching,
            "connecting" => ConnectionState::Connecting,
            "active" => ConnectionState::Active,
            "gps_lost" => ConnectionState::GpsLost,
            "conc_lost" => ConnectionState::ConcLost,
            "all_lost" => ConnectionState::AllLost,
            "timeout" => ConnectionState::Timeout,
            "stopped" => ConnectionState::Stopped,
            _ => return None,
        };
        Some(state)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Offline => "offline",
            ConnectionState::Switching => "switching",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::GpsLost => "gps_lost",
            ConnectionState::ConcLost => "conc_lost",
            ConnectionState::AllLost => "all_lost",
            ConnectionState::Timeout => "timeout",
            ConnectionState::Stopped => "stopped",
        }
    }

    pub fn posture(self) -> Posture {
        match self {
            ConnectionState::Active
            | ConnectionState::Connecting
            | ConnectionState::GpsLost
            | ConnectionState::ConcLost => Posture::Recording,
            ConnectionState::Stopped | ConnectionState::AllLost | ConnectionState::Timeout => Posture::Idle,
            ConnectionState::Offline => Posture::Offline,
            ConnectionState::Switching => Posture::Switching,
        }
    }

    /// States in which the live panel shows the latest reading.
    pub fn shows_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Active | ConnectionState::GpsLost | ConnectionState::ConcLost
        )
    }

    /// Whether this status confirms a pending project switch.
    fn resolves_switch(self) -> bool {
        matches!(self, ConnectionState::Active | ConnectionState::Stopped)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse UI mode governing which controls are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    Recording,
    Idle,
    Offline,
    Switching,
}

impl Posture {
    pub fn controls(self) -> Controls {
        match self {
            Posture::Recording => Controls {
                start: false,
                stop: true,
                upload: false,
                download: false,
                settings: false,
                thresholds_locked: false,
            },
            Posture::Idle | Posture::Offline => Controls {
                start: true,
                stop: false,
                upload: true,
                download: true,
                settings: true,
                thresholds_locked: false,
            },
            Posture::Switching => Controls {
                start: false,
                stop: false,
                upload: false,
                download: false,
                settings: false,
                thresholds_locked: true,
            },
        }
    }
}

/// Visibility of the operator controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Controls {
    pub start: bool,
    pub stop: bool,
    pub upload: bool,
    pub download: bool,
    pub settings: bool,
    pub thresholds_locked: bool,
}

/// Remote `status` record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub message: String,
}

impl ConnectionStatus {
    pub fn new(state: ConnectionState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }

    /// Reads a remote status payload. Unknown states degrade to `offline`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let (raw_state, message) = match value {
            Value::Object(obj) => (
                obj.get("state").and_then(Value::as_str),
                obj.get("message").and_then(Value::as_str).unwrap_or_default(),
            ),
            Value::String(s) => (Some(s.as_str()), ""),
            _ => (None, ""),
        };
        let raw_state = raw_state?;
        let state = ConnectionState::parse(raw_state).unwrap_or_else(|| {
            warn!("connection: unknown remote state {raw_state:?}, treating as offline");
            ConnectionState::Offline
        });
        Some(Self::new(state, message))
    }

    /// The producer is moving to another project on its own.
    pub fn announces_switch(&self) -> bool {
        self.message.to_lowercase().contains("switch") || self.message.contains("切換")
    }
}

/// Local, durable record of an in-flight project switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchIntent {
    pub target: Namespace,
    #[serde(with = "time::serde::rfc3339")]
    pub deadline: OffsetDateTime,
}

impl SwitchIntent {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.deadline
    }
}

/// Status text and color for the header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusLine {
    pub label: &'static str,
    pub detail: Option<String>,
    pub color: &'static str,
}

const GRAY: &str = "#6c757d";

pub fn status_line(state: ConnectionState, message: Option<&str>) -> StatusLine {
    let (label, color) = match state {
        ConnectionState::Offline => ("Not connected", GRAY),
        ConnectionState::Switching => ("Switching project...", "#17a2b8"),
        ConnectionState::Connecting => ("Connecting...", "#d39e00"),
        ConnectionState::Active => ("Receiving data", "#28a745"),
        ConnectionState::GpsLost => ("GPS signal lost", "#fd7e14"),
        ConnectionState::ConcLost => ("Concentration signal lost", "#fd7e14"),
        ConnectionState::AllLost => ("All signals lost", "#dc3545"),
        ConnectionState::Timeout => ("Device timed out", "#dc3545"),
        ConnectionState::Stopped => ("Stopped", GRAY),
    };
    StatusLine {
        label,
        detail: message.map(str::trim).filter(|m| !m.is_empty()).map(str::to_string),
        color,
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Leaving `active`: the live panel must revert to its placeholder.
    pub clear_live: bool,
    /// The switch intent was confirmed by the remote status.
    pub intent_cleared: bool,
    /// The switch intent ran past its deadline.
    pub intent_expired: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    pub fn intent_dropped(&self) -> bool {
        self.intent_cleared || self.intent_expired
    }
}

/// Pure evaluation of the priority rules. Mutates `intent` only to drop it.
pub fn evaluate(
    status: Option<&ConnectionStatus>,
    intent: &mut Option<SwitchIntent>,
    now: OffsetDateTime,
) -> (ConnectionState, bool, bool) {
    let mut cleared = false;
    let mut expired = false;

    if intent.as_ref().is_some_and(|i| i.is_expired(now)) {
        *intent = None;
        expired = true;
    }

    if intent.is_some() {
        match status {
            Some(s) if s.state.resolves_switch() => {
                *intent = None;
                cleared = true;
            }
            _ => return (ConnectionState::Switching, cleared, expired),
        }
    }

    let state = match status {
        None => ConnectionState::Offline,
        Some(s) if s.state == ConnectionState::Offline => {
            if s.announces_switch() {
                ConnectionState::Switching
            } else {
                ConnectionState::Offline
            }
        }
        Some(s) => s.state,
    };
    (state, cleared, expired)
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    last: Option<ConnectionStatus>,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Offline,
            last: None,
        }
    }
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn posture(&self) -> Posture {
        self.state.posture()
    }

    pub fn last_status(&self) -> Option<&ConnectionStatus> {
        self.last.as_ref()
    }

    pub fn status_line(&self) -> StatusLine {
        let message = self.last.as_ref().map(|s| s.message.as_str());
        status_line(self.state, message)
    }

    /// Folds a new remote status (or its absence) into the machine.
    pub fn on_status(
        &mut self,
        status: Option<ConnectionStatus>,
        intent: &mut Option<SwitchIntent>,
        now: OffsetDateTime,
    ) -> Transition {
        self.last = status;
        self.reevaluate(intent, now)
    }

    /// Re-runs the rules against the last status, used by the deadline tick.
    pub fn reevaluate(&mut self, intent: &mut Option<SwitchIntent>, now: OffsetDateTime) -> Transition {
        let (to, intent_cleared, intent_expired) = evaluate(self.last.as_ref(), intent, now);
        self.apply(to, intent_cleared, intent_expired)
    }

    /// Optimistic entry into `switching` when the operator starts a switch.
    pub fn enter_switching(&mut self) -> Transition {
        self.apply(ConnectionState::Switching, false, false)
    }

    /// Forgets the last status; the next namespace has not reported yet.
    pub fn forget_status(&mut self) {
        self.last = None;
    }

    fn apply(&mut self, to: ConnectionState, intent_cleared: bool, intent_expired: bool) -> Transition {
        let from = self.state;
        self.state = to;
        if from != to {
            info!("connection: {from} -> {to} ({:?})", to.posture());
        }
        Transition {
            from,
            to,
            clear_live: from == ConnectionState::Active && to != ConnectionState::Active,
            intent_cleared,
            intent_expired,
        }
    }
}
