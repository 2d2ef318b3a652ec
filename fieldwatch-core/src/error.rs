use crate::settings::SettingsError;
use crate::store::StoreError;
use crate::thresholds::ThresholdError;

/// Local input rejected before any remote call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("project name cannot be empty")]
    EmptyNamespace,
    #[error("project name {0:?} contains a reserved character")]
    InvalidNamespace(String),
    #[error("nothing to update")]
    EmptyPatch,
    #[error("nothing to import")]
    EmptyImport,
}

#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error("remote write failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("a project switch to {0} is already in progress")]
    SwitchInProgress(String),
    #[error("controls are disabled while a project switch is in progress")]
    ControlsLocked,
    #[error("unknown history record {0}")]
    UnknownRecord(String),
}

impl DashboardError {
    /// Validation failures never reached the store.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            DashboardError::Validation(_)
                | DashboardError::Threshold(_)
                | DashboardError::SwitchInProgress(_)
                | DashboardError::ControlsLocked
                | DashboardError::UnknownRecord(_)
        )
    }
}
