mod authorization;
mod cache;
mod coordinator;
mod error;
mod fetch;
mod location;
mod locator;
mod provider;
mod settings;

pub use authorization::{
    AuthorizationGate, AuthorizationMode, AuthorizationState, AuthorizationStatus,
};
pub use cache::{CachedLocation, LocationCache, RefreshInterval};
pub use coordinator::{CoordinatorState, FetchCoordinator};
pub use error::LocatorError;
pub use fetch::{CancelHandle, CompletionCallback, FetchOutcome, PendingLocation, RequestId};
pub use location::{Accuracy, Location, LocationComponent, Meters};
pub use locator::Locator;
pub use provider::{LocationProvider, ProviderError, ProviderEvent};
pub use settings::LocatorSettings;

/// Convenience alias for UTC DT
pub type UtcDT = chrono::DateTime<chrono::Utc>;

pub mod prelude {
    use anyhow::Error as AnyhowError;
    use std::result::Result as StdResult;
    pub type Result<T = (), E = AnyhowError> = StdResult<T, E>;
    pub use anyhow::Context;
}
