use serde::{Deserialize, Serialize};

use crate::{
    authorization::{AuthorizationMode, AuthorizationStatus},
    location::{Accuracy, Location},
};

/// A hard failure reported by the platform location API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderError {
    /// Location hardware is off or missing
    Unavailable,
    /// The OS refused to hand out a location
    Denied,
    /// Anything else, with a message from the platform
    Other(String),
}

/// Something the platform location API told us
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProviderEvent {
    /// A new fix came in
    Location(Location),
    /// The hardware failed to produce a fix
    Error(ProviderError),
    /// The user or OS changed the authorization status
    AuthorizationChanged(AuthorizationStatus),
}

/// Adapter over a platform's location API. The coordinator is the only thing allowed to
/// call [LocationProvider::start_updates] and [LocationProvider::stop_updates].
pub trait LocationProvider: Send + Sync {
    /// Turn on hardware updates at (at least) the given accuracy. Calling this while already
    /// running should be a no-op.
    fn start_updates(&self, accuracy: Accuracy) -> impl Future<Output = ()> + Send;
    /// Turn off hardware updates, no-op if not running
    fn stop_updates(&self) -> impl Future<Output = ()> + Send;
    /// Wait for the next batch of events, in delivery order. An empty batch means the
    /// provider has shut down and won't produce anything else. Must be cancel safe, the
    /// coordinator drops this future whenever something else wakes it up.
    fn receive_events(
        &self,
    ) -> impl Future<Output = impl Iterator<Item = ProviderEvent> + Send> + Send;
    /// Current authorization status as the OS sees it
    fn authorization_status(&self) -> AuthorizationStatus;
    /// Show the OS prompt, the answer arrives later as
    /// [ProviderEvent::AuthorizationChanged]
    fn request_authorization(&self, mode: AuthorizationMode) -> impl Future<Output = ()> + Send;
}
