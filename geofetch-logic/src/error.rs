use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderError;

/// Errors a caller of [crate::Locator] can receive, either as an `Err` or inside a
/// [crate::FetchOutcome::Failed]. Cloneable so one failure can be handed to every caller
/// attached to the same fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocatorError {
    /// The user declined (or the OS restricted) location access
    #[error("Location authorization was denied")]
    AuthorizationDenied,

    /// Authorization may only be requested once per process
    #[error("Location authorization has already been requested")]
    AuthorizationAlreadyRequested,

    /// The location hardware can't be used right now
    #[error("Location provider is unavailable")]
    ProviderUnavailable,

    /// Any other failure reported by the provider
    #[error("Location provider error: {0}")]
    Provider(String),

    /// The coordinator shut down before the request could resolve
    #[error("Location coordinator has stopped")]
    CoordinatorStopped,
}

impl From<ProviderError> for LocatorError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable => Self::ProviderUnavailable,
            ProviderError::Denied => Self::AuthorizationDenied,
            ProviderError::Other(msg) => Self::Provider(msg),
        }
    }
}
