//! Project switch protocol.
//!
//! Holds the [`SwitchIntent`] and decides what a switch request turns into.
//! The side effects (remote write, navigation, persistence) are carried out
//! by the dashboard in protocol order; this module only guards the intent.

use crate::config_sync::ConfigPatch;
use crate::connection::SwitchIntent;
use crate::error::DashboardError;
use crate::store::Namespace;
use serde_json::Value;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

pub const DEFAULT_SWITCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const MIN_SWITCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_SWITCH_TIMEOUT: Duration = Duration::from_secs(60);

pub fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.clamp(MIN_SWITCH_TIMEOUT, MAX_SWITCH_TIMEOUT)
}

/// What a validated switch request amounts to.
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchPlan {
    /// Target is the current namespace: a plain config update.
    Stay,
    /// A handoff: write `payload` to the current namespace, then navigate.
    Handoff { intent: SwitchIntent, payload: Value },
}

#[derive(Debug)]
pub struct SwitchProtocol {
    timeout: Duration,
    intent: Option<SwitchIntent>,
}

impl SwitchProtocol {
    pub fn new(timeout: Duration) -> Self {
        let clamped = clamp_timeout(timeout);
        if clamped != timeout {
            warn!("switch: timeout {timeout:?} clamped to {clamped:?}");
        }
        Self {
            timeout: clamped,
            intent: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn intent(&self) -> Option<&SwitchIntent> {
        self.intent.as_ref()
    }

    pub fn intent_mut(&mut self) -> &mut Option<SwitchIntent> {
        &mut self.intent
    }

    pub fn in_flight(&self) -> bool {
        self.intent.is_some()
    }

    /// Re-arms a persisted intent after a restart, if it still has time left.
    pub fn restore(&mut self, intent: SwitchIntent, now: OffsetDateTime) -> bool {
        if intent.is_expired(now) {
            info!("switch: persisted switch to {} already expired", intent.target);
            return false;
        }
        info!("switch: resuming switch to {} (deadline {})", intent.target, intent.deadline);
        self.intent = Some(intent);
        true
    }

    /// Validates a request and, for a real handoff, sets the intent.
    ///
    /// A second request while one is in flight is refused without touching
    /// the store, whatever its target.
    pub fn begin(
        &mut self,
        current: &Namespace,
        target: &str,
        patch: ConfigPatch,
        now: OffsetDateTime,
    ) -> Result<SwitchPlan, DashboardError> {
        let target = Namespace::parse(target)?;
        if let Some(pending) = &self.intent {
            return Err(DashboardError::SwitchInProgress(pending.target.to_string()));
        }
        if &target == current {
            return Ok(SwitchPlan::Stay);
        }

        let deadline = now + self.timeout;
        let intent = SwitchIntent {
            target: target.clone(),
            deadline,
        };
        let payload = ConfigPatch {
            namespace: Some(target.to_string()),
            ..patch
        }
        .to_value();
        info!("switch: {current} -> {target}, deadline {deadline}");
        self.intent = Some(intent.clone());
        Ok(SwitchPlan::Handoff { intent, payload })
    }

    /// Drops the intent after a failed handoff write.
    pub fn abort(&mut self) -> Option<SwitchIntent> {
        self.intent.take()
    }
}

impl Default for SwitchProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_SWITCH_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use serde_json::json;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-03-01 12:00:00 UTC);

    fn current() -> Namespace {
        Namespace::parse("alpha").unwrap()
    }

    #[test]
    fn test_timeout_is_clamped() {
        assert_eq!(SwitchProtocol::new(Duration::from_secs(2)).timeout(), MIN_SWITCH_TIMEOUT);
        assert_eq!(SwitchProtocol::new(Duration::from_secs(600)).timeout(), MAX_SWITCH_TIMEOUT);
        assert_eq!(SwitchProtocol::default().timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_empty_target_is_rejected_locally() {
        let mut p = SwitchProtocol::default();
        let err = p.begin(&current(), "  ", ConfigPatch::default(), NOW).unwrap_err();
        assert!(matches!(err, DashboardError::Validation(ValidationError::EmptyNamespace)));
        assert!(!p.in_flight());
    }

    #[test]
    fn test_handoff_sets_intent_and_payload() {
        let mut p = SwitchProtocol::default();
        let patch = ConfigPatch {
            unit: Some("ppb".into()),
            ..Default::default()
        };
        match p.begin(&current(), "beta", patch, NOW).unwrap() {
            SwitchPlan::Handoff { intent, payload } => {
                assert_eq!(intent.target.as_str(), "beta");
                assert_eq!(intent.deadline, datetime!(2024-03-01 12:00:30 UTC));
                assert_eq!(payload, json!({"project_id": "beta", "conc_unit": "ppb"}));
            }
            other => panic!("expected handoff, got {other:?}"),
        }
        assert!(p.in_flight());
    }

    #[test]
    fn test_second_request_while_in_flight_is_refused() {
        let mut p = SwitchProtocol::default();
        p.begin(&current(), "beta", ConfigPatch::default(), NOW).unwrap();
        let err = p.begin(&current(), "beta", ConfigPatch::default(), NOW).unwrap_err();
        assert!(matches!(err, DashboardError::SwitchInProgress(t) if t == "beta"));
        assert!(p.abort().is_some());
        assert!(!p.in_flight());
    }

    #[test]
    fn test_same_namespace_stays() {
        let mut p = SwitchProtocol::default();
        assert_eq!(p.begin(&current(), " alpha ", ConfigPatch::default(), NOW).unwrap(), SwitchPlan::Stay);
        assert!(!p.in_flight());
    }

    #[test]
    fn test_restore_only_unexpired() {
        let mut p = SwitchProtocol::default();
        let intent = SwitchIntent {
            target: Namespace::parse("beta").unwrap(),
            deadline: NOW,
        };
        assert!(!p.restore(intent.clone(), NOW));
        assert!(p.restore(intent, NOW - time::Duration::seconds(1)));
        assert!(p.in_flight());
    }
}
