use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{authorization::AuthorizationMode, cache::RefreshInterval, location::Accuracy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Settings for a [crate::Locator]. Changes only apply to requests made after the change,
/// a fetch that is already running keeps the settings it started with.
pub struct LocatorSettings {
    /// How long a caller waits for a fresh fix before getting the last known one instead
    pub timeout: Duration,
    /// How long a cached fix is considered good enough to skip the hardware entirely
    pub refresh_interval: RefreshInterval,
    /// Ask the user for authorization on the first fetch if nobody has yet
    pub auto_request_authorization: bool,
    /// The kind of authorization to ask for
    pub authorization_mode: AuthorizationMode,
    /// Accuracy used by requests that don't specify one
    pub default_accuracy: Accuracy,
}

impl Default for LocatorSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(4),
            refresh_interval: RefreshInterval::AlwaysFresh,
            auto_request_authorization: true,
            authorization_mode: AuthorizationMode::Always,
            default_accuracy: Accuracy::HUNDRED_METERS,
        }
    }
}
