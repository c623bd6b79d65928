use geofetch_logic::{
    Accuracy, AuthorizationState, AuthorizationStatus, FetchOutcome, Location, LocatorError,
    LocatorSettings, ProviderError, RequestId,
};
use interprocess::local_socket::{GenericNamespaced, Name, ToNsName};
use serde::{Deserialize, Serialize};

pub mod prelude {
    pub use anyhow::{Context, anyhow, bail};
    pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
}

pub use prelude::*;

pub fn get_socket_name(base_name: String) -> Result<Name<'static>> {
    base_name
        .to_ns_name::<GenericNamespaced>()
        .context("Failed to parse socket name")
}

/// Events to inject into the daemon's simulated provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProviderRequest {
    Fix(Location),
    Error(ProviderError),
    Authorization(AuthorizationStatus),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestingRequest {
    /// Refresh at the given accuracy, or the configured default
    Refresh(Option<Accuracy>),
    /// Fire-and-forget fetch that only warms the cache
    Fetch(Option<Accuracy>),
    Cancel(RequestId),
    RequestAuthorization,
    UpdateSettings(LocatorSettings),
    Status,
    Provider(ProviderRequest),
}

impl From<ProviderRequest> for TestingRequest {
    fn from(val: ProviderRequest) -> Self {
        TestingRequest::Provider(val)
    }
}

/// Snapshot of the locator as seen from the outside
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorStatus {
    pub current_location: Option<Location>,
    pub is_fetching: bool,
    pub has_requested_authorization: bool,
    pub authorization: AuthorizationState,
    pub provider_running: bool,
    pub settings: LocatorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestingResponse {
    /// A refresh was accepted, its outcome follows later as [TestingResponse::Outcome]
    Pending(RequestId),
    Outcome(RequestId, FetchOutcome),
    Authorization(AuthorizationStatus),
    Status(LocatorStatus),
    Complete,
    Error(String),
}

impl TestingResponse {
    /// Whether the driver should keep listening after this response
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

impl From<LocatorStatus> for TestingResponse {
    fn from(val: LocatorStatus) -> Self {
        TestingResponse::Status(val)
    }
}

impl From<LocatorError> for TestingResponse {
    fn from(value: LocatorError) -> Self {
        TestingResponse::Error(value.to_string())
    }
}

impl From<anyhow::Error> for TestingResponse {
    fn from(value: anyhow::Error) -> Self {
        TestingResponse::Error(value.to_string())
    }
}
