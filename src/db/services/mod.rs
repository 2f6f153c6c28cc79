pub mod alert_service;
pub mod monitor_service;
pub mod status_service;

use thiserror::Error;

use super::error::StoreError;

#[derive(Error, Debug)]
pub enum ManagementError {
    /// Rejected at write time; never reaches the scheduler.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ManagementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => ManagementError::NotFound(msg),
            StoreError::ConditionFailed(msg) => ManagementError::Conflict(msg),
            StoreError::InvalidKey(msg) => ManagementError::Configuration(msg),
            other => ManagementError::Store(other),
        }
    }
}
