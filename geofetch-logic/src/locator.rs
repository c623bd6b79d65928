use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::{
    authorization::{AuthorizationMode, AuthorizationState, AuthorizationStatus},
    cache::{CachedLocation, RefreshInterval},
    coordinator::FetchCoordinator,
    error::LocatorError,
    fetch::{CancelHandle, FetchOutcome, PendingLocation},
    location::{Accuracy, Location},
    prelude::*,
    provider::LocationProvider,
    settings::LocatorSettings,
};

/// Public entry point, owns a [FetchCoordinator] and the task running its main loop.
/// Construct one per provider and share it however the host app likes. Dropping it stops
/// the coordinator, use [Locator::shutdown] to also wait for the hardware to be stopped.
pub struct Locator<P: LocationProvider + 'static> {
    coordinator: Arc<FetchCoordinator<P>>,
    worker: JoinHandle<Result>,
}

impl<P: LocationProvider + 'static> Locator<P> {
    /// Create a locator and spawn its main loop on the current tokio runtime
    pub fn spawn(provider: Arc<P>, settings: LocatorSettings) -> Self {
        let coordinator = Arc::new(FetchCoordinator::new(provider, settings));

        let worker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.main_loop().await }
        });

        Self {
            coordinator,
            worker,
        }
    }

    pub fn coordinator(&self) -> Arc<FetchCoordinator<P>> {
        self.coordinator.clone()
    }

    // == REQUESTS ==

    /// Refresh the current location at the default accuracy
    pub async fn refresh(&self) -> PendingLocation {
        let accuracy = self.coordinator.clone_settings().await.default_accuracy;
        self.coordinator.request(accuracy).await
    }

    pub async fn refresh_with_accuracy(&self, accuracy: Accuracy) -> PendingLocation {
        self.coordinator.request(accuracy).await
    }

    /// Refresh the current location and call `completion` with the outcome. The callback is
    /// called exactly once, with [FetchOutcome::Cancelled] if the returned handle is
    /// cancelled first.
    pub async fn refresh_with_completion(
        &self,
        accuracy: Accuracy,
        completion: impl FnOnce(FetchOutcome) + Send + 'static,
    ) -> CancelHandle {
        self.coordinator
            .request_with_callback(accuracy, completion)
            .await
    }

    /// Kick off a fetch without waiting on it, [Locator::current_location] will reflect
    /// the result once it arrives
    pub async fn fetch(&self, accuracy: Accuracy) {
        self.coordinator.warm(accuracy).await
    }

    /// The last fix that resolved a fetch, no matter how old
    pub async fn current_location(&self) -> Option<Location> {
        self.coordinator.current_location().await
    }

    pub async fn cached_location(&self) -> Option<CachedLocation> {
        self.coordinator.cached().await
    }

    pub async fn is_fetching(&self) -> bool {
        self.coordinator.is_fetching().await
    }

    // == AUTHORIZATION ==

    /// Ask the user for authorization using the configured mode, only allowed once
    pub async fn request_authorization(&self) -> Result<AuthorizationStatus, LocatorError> {
        let mode = self.authorization_mode().await;
        self.coordinator.request_authorization(mode).await
    }

    pub async fn has_requested_location_authorization(&self) -> bool {
        self.coordinator.has_requested_authorization().await
    }

    pub async fn authorization_state(&self) -> AuthorizationState {
        self.coordinator.authorization_state().await
    }

    /// Raw status as last reported by the provider
    pub async fn authorization_status(&self) -> AuthorizationStatus {
        self.coordinator.lock_state().await.authorization().status()
    }

    // == SETTINGS ==

    pub async fn settings(&self) -> LocatorSettings {
        self.coordinator.clone_settings().await
    }

    pub async fn update_settings(&self, new_settings: LocatorSettings) {
        *self.coordinator.lock_state().await.settings_mut() = new_settings;
    }

    pub async fn timeout(&self) -> Duration {
        self.coordinator.lock_state().await.settings().timeout
    }

    pub async fn set_timeout(&self, timeout: Duration) {
        self.coordinator.lock_state().await.settings_mut().timeout = timeout;
    }

    pub async fn refresh_interval(&self) -> RefreshInterval {
        self.coordinator.lock_state().await.settings().refresh_interval
    }

    pub async fn set_refresh_interval(&self, refresh_interval: RefreshInterval) {
        self.coordinator
            .lock_state()
            .await
            .settings_mut()
            .refresh_interval = refresh_interval;
    }

    pub async fn should_automatically_request_authorization(&self) -> bool {
        self.coordinator
            .lock_state()
            .await
            .settings()
            .auto_request_authorization
    }

    pub async fn set_should_automatically_request_authorization(&self, auto: bool) {
        self.coordinator
            .lock_state()
            .await
            .settings_mut()
            .auto_request_authorization = auto;
    }

    pub async fn authorization_mode(&self) -> AuthorizationMode {
        self.coordinator
            .lock_state()
            .await
            .settings()
            .authorization_mode
    }

    pub async fn set_authorization_mode(&self, mode: AuthorizationMode) {
        self.coordinator
            .lock_state()
            .await
            .settings_mut()
            .authorization_mode = mode;
    }

    /// Stop the coordinator, fails anything still waiting with
    /// [LocatorError::CoordinatorStopped] and waits for the main loop to exit
    pub async fn shutdown(mut self) -> Result {
        self.coordinator.stop();
        (&mut self.worker)
            .await
            .context("Coordinator task panicked")?
    }
}

impl<P: LocationProvider + 'static> Drop for Locator<P> {
    fn drop(&mut self) {
        self.coordinator.stop();
    }
}
