use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, info, warn};
use tokio::{
    sync::{Mutex, MutexGuard, Notify, mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    authorization::{AuthorizationGate, AuthorizationMode, AuthorizationState, AuthorizationStatus},
    cache::{CachedLocation, LocationCache},
    error::LocatorError,
    fetch::{CancelHandle, Completion, FetchOutcome, FetchRequest, PendingLocation, RequestId},
    location::{Accuracy, Location},
    prelude::*,
    provider::{LocationProvider, ProviderError, ProviderEvent},
    settings::LocatorSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchPhase {
    /// Waiting on the user to authorize before the hardware can start
    Starting,
    /// Hardware is running, waiting on a good enough fix
    Waiting,
}

/// The one fetch that's currently talking to the hardware
struct ActiveFetch {
    id: Uuid,
    accuracy: Accuracy,
    phase: FetchPhase,
    started_at: Instant,
    /// `None` once the deadline has fired and nobody new has joined, or if the timeout is
    /// too large to ever fire
    deadline: Option<Instant>,
    /// Set once attached requests were handed the stale fix, the fetch is now only
    /// running to update the cache
    timed_out: bool,
    /// In attachment order
    attached: Vec<FetchRequest>,
}

impl ActiveFetch {
    fn resolve_all(&mut self, outcome: FetchOutcome) {
        for request in self.attached.drain(..) {
            request.resolve(outcome.clone());
        }
    }
}

/// Everything the coordinator owns, only ever touched with the state lock held
pub struct CoordinatorState {
    settings: LocatorSettings,
    cache: LocationCache,
    auth: AuthorizationGate,
    active: Option<ActiveFetch>,
}

impl CoordinatorState {
    fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|active| active.deadline)
    }

    pub fn settings(&self) -> &LocatorSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut LocatorSettings {
        &mut self.settings
    }

    pub fn cache(&self) -> &LocationCache {
        &self.cache
    }

    pub fn authorization(&self) -> &AuthorizationGate {
        &self.auth
    }

    pub fn is_fetching(&self) -> bool {
        self.active.is_some()
    }

    /// Number of requests waiting on the active fetch
    pub fn attached_count(&self) -> usize {
        self.active
            .as_ref()
            .map(|active| active.attached.len())
            .unwrap_or_default()
    }
}

/// Multiplexes location requests onto a single hardware fetch, handles caching, timeouts
/// and the authorization handshake. Callers go through the async methods here while
/// [FetchCoordinator::main_loop] handles events coming from the [LocationProvider].
pub struct FetchCoordinator<P: LocationProvider> {
    state: Mutex<CoordinatorState>,
    provider: Arc<P>,
    cancels: mpsc::UnboundedSender<RequestId>,
    cancel_rx: Mutex<mpsc::UnboundedReceiver<RequestId>>,
    deadline_changed: Notify,
    cancel: CancellationToken,
}

impl<P: LocationProvider> FetchCoordinator<P> {
    pub fn new(provider: Arc<P>, settings: LocatorSettings) -> Self {
        let (cancels, cancel_rx) = mpsc::unbounded_channel();
        let auth = AuthorizationGate::new(provider.authorization_status());

        Self {
            state: Mutex::new(CoordinatorState {
                settings,
                cache: LocationCache::default(),
                auth,
                active: None,
            }),
            provider,
            cancels,
            cancel_rx: Mutex::new(cancel_rx),
            deadline_changed: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Request a location, the returned handle resolves once a fix arrives, the fetch
    /// fails, or the timeout fires.
    pub async fn request(&self, accuracy: Accuracy) -> PendingLocation {
        let (tx, rx) = oneshot::channel();
        let handle = self.submit(accuracy, Completion::Channel(tx)).await;
        PendingLocation::new(handle, rx)
    }

    /// Same as [FetchCoordinator::request] but calls `callback` with the outcome instead.
    /// Callbacks for requests sharing a fetch are called in the order they were made.
    pub async fn request_with_callback(
        &self,
        accuracy: Accuracy,
        callback: impl FnOnce(FetchOutcome) + Send + 'static,
    ) -> CancelHandle {
        self.submit(accuracy, Completion::Callback(Box::new(callback)))
            .await
    }

    /// Start (or join) a fetch without waiting on it, the result only lands in the cache
    pub async fn warm(&self, accuracy: Accuracy) {
        self.submit(accuracy, Completion::Detached).await;
    }

    async fn submit(&self, accuracy: Accuracy, completion: Completion) -> CancelHandle {
        let request = FetchRequest::new(completion);
        let handle = request.handle(self.cancels.clone());
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if self.cancel.is_cancelled() {
            request.resolve(FetchOutcome::Failed(LocatorError::CoordinatorStopped));
            return handle;
        }

        match state.auth.state() {
            AuthorizationState::Denied => {
                debug!("Request {} refused, authorization denied", request.id);
                request.resolve(FetchOutcome::Failed(LocatorError::AuthorizationDenied));
                return handle;
            }
            AuthorizationState::NotRequested if state.settings.auto_request_authorization => {
                self.auto_request_authorization(&mut state).await;
            }
            _ => {}
        }

        let cached = state
            .cache
            .location()
            .filter(|_| state.cache.is_fresh(state.settings.refresh_interval, now));

        if let Some(location) = cached {
            debug!("Request {} served from cache", request.id);
            request.resolve(FetchOutcome::Succeeded {
                location,
                cached: true,
            });
        } else {
            self.attach(&mut state, accuracy, request, now).await;
        }

        handle
    }

    /// Trigger the authorization prompt on behalf of a fetch. Only called when nothing has
    /// been requested yet, so it never trips the double request error.
    async fn auto_request_authorization(&self, state: &mut CoordinatorState) {
        if state.auth.begin_request().is_ok() {
            let mode = state.settings.authorization_mode;
            info!("Automatically requesting {mode:?} location authorization");
            self.provider.request_authorization(mode).await;
        }
    }

    async fn attach(
        &self,
        state: &mut CoordinatorState,
        accuracy: Accuracy,
        request: FetchRequest,
        now: Instant,
    ) {
        let timeout = state.settings.timeout;

        if let Some(active) = state.active.as_mut() {
            debug!("Request {} joining fetch {}", request.id, active.id);
            active.attached.push(request);
            if active.timed_out && active.deadline.is_none() {
                // Joined a fetch that's only running in the background, re-arm so the new
                // caller isn't left waiting forever
                active.deadline = now.checked_add(timeout);
                self.deadline_changed.notify_one();
            }
            return;
        }

        let mut active = ActiveFetch {
            id: Uuid::new_v4(),
            accuracy,
            phase: FetchPhase::Starting,
            started_at: now,
            // A timeout too large to represent never fires
            deadline: now.checked_add(timeout),
            timed_out: false,
            attached: vec![request],
        };

        info!("Starting fetch {} at {accuracy:?}", active.id);

        if state.auth.status().is_granted() {
            self.provider.start_updates(accuracy).await;
            active.phase = FetchPhase::Waiting;
        } else {
            debug!("Fetch {} waiting on authorization", active.id);
        }

        state.active = Some(active);
        self.deadline_changed.notify_one();
    }

    /// Manually ask the user for authorization. Can only be done once per coordinator,
    /// including automatic requests made by a fetch. Resolves once the user decides, or
    /// right away if they already have.
    pub async fn request_authorization(
        &self,
        mode: AuthorizationMode,
    ) -> Result<AuthorizationStatus, LocatorError> {
        let waiter = {
            let mut state = self.state.lock().await;
            state.auth.begin_request()?;

            let status = state.auth.status();
            if status.is_decided() {
                return Ok(status);
            }

            info!("Requesting {mode:?} location authorization");
            self.provider.request_authorization(mode).await;
            state.auth.wait()
        };

        waiter.await.map_err(|_| LocatorError::CoordinatorStopped)
    }

    async fn consume_event(&self, state: &mut CoordinatorState, event: ProviderEvent) {
        match event {
            ProviderEvent::Location(fix) => self.handle_fix(state, fix).await,
            ProviderEvent::Error(err) => self.handle_error(state, err).await,
            ProviderEvent::AuthorizationChanged(status) => {
                self.handle_authorization(state, status).await
            }
        }
    }

    async fn handle_fix(&self, state: &mut CoordinatorState, fix: Location) {
        let qualifies = match &state.active {
            Some(active) if active.phase == FetchPhase::Waiting => {
                let ok = active.accuracy.accepts(&fix);
                if !ok {
                    debug!(
                        "Fix with accuracy {}m doesn't meet {:?} for fetch {}",
                        fix.accuracy, active.accuracy, active.id
                    );
                }
                ok
            }
            _ => {
                debug!("Ignoring fix that arrived with no running fetch");
                false
            }
        };

        if !qualifies {
            return;
        }

        let Some(mut active) = state.active.take() else {
            return;
        };

        let now = Instant::now();
        state.cache.write(fix, now);
        self.provider.stop_updates().await;

        info!(
            "Fetch {} succeeded after {:?}, resolving {} request(s)",
            active.id,
            now.saturating_duration_since(active.started_at),
            active.attached.len()
        );

        active.resolve_all(FetchOutcome::Succeeded {
            location: fix,
            cached: false,
        });
    }

    async fn handle_error(&self, state: &mut CoordinatorState, err: ProviderError) {
        let Some(mut active) = state.active.take() else {
            warn!("Provider reported an error with no running fetch: {err:?}");
            return;
        };

        warn!("Fetch {} failed: {err:?}", active.id);

        if active.phase == FetchPhase::Waiting {
            self.provider.stop_updates().await;
        }

        active.resolve_all(FetchOutcome::Failed(err.into()));
    }

    async fn handle_authorization(&self, state: &mut CoordinatorState, status: AuthorizationStatus) {
        let previous = state.auth.update(status);
        let current = state.auth.state();

        if previous != current {
            info!("Location authorization changed from {previous:?} to {current:?}");
        }

        match current {
            AuthorizationState::Granted(_) => {
                if let Some(active) = state
                    .active
                    .as_mut()
                    .filter(|active| active.phase == FetchPhase::Starting)
                {
                    debug!("Authorization granted, starting fetch {}", active.id);
                    self.provider.start_updates(active.accuracy).await;
                    active.phase = FetchPhase::Waiting;
                }
            }
            AuthorizationState::Denied => {
                if let Some(mut active) = state.active.take() {
                    warn!("Fetch {} failed, authorization denied", active.id);
                    if active.phase == FetchPhase::Waiting {
                        self.provider.stop_updates().await;
                    }
                    active.resolve_all(FetchOutcome::Failed(LocatorError::AuthorizationDenied));
                }
            }
            AuthorizationState::NotRequested | AuthorizationState::Pending => {}
        }
    }

    fn handle_timeout(&self, state: &mut CoordinatorState, now: Instant) {
        let stale = state.cache.location();

        let Some(active) = state.active.as_mut() else {
            return;
        };

        // The deadline may have moved or been cleared since the timer was armed
        if active.deadline.is_none_or(|deadline| deadline > now) {
            return;
        }

        active.deadline = None;
        active.timed_out = true;

        info!(
            "Fetch {} timed out, handing {} request(s) the last known location, continuing in the background",
            active.id,
            active.attached.len()
        );

        active.resolve_all(FetchOutcome::TimedOut(stale));
    }

    async fn detach(&self, state: &mut CoordinatorState, id: RequestId) {
        let Some(active) = state.active.as_mut() else {
            return;
        };

        let Some(pos) = active.attached.iter().position(|request| request.id == id) else {
            // Already resolved
            return;
        };

        active.attached.remove(pos).resolve(FetchOutcome::Cancelled);
        debug!("Request {id} cancelled");

        if active.attached.is_empty() && !active.timed_out {
            if let Some(active) = state.active.take() {
                info!("Last request for fetch {} cancelled, stopping", active.id);
                if active.phase == FetchPhase::Waiting {
                    self.provider.stop_updates().await;
                }
            }
        }
    }

    async fn sleep_until(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Stop the hardware, fail whatever is still attached and refuse new requests
    async fn teardown(&self) {
        self.cancel.cancel();

        let mut state = self.state.lock().await;
        state.auth.abandon_waiters();

        if let Some(mut active) = state.active.take() {
            if active.phase == FetchPhase::Waiting {
                self.provider.stop_updates().await;
            }
            active.resolve_all(FetchOutcome::Failed(LocatorError::CoordinatorStopped));
        }
    }

    /// Main loop of the coordinator, handles provider events, cancellations and timeouts.
    /// Runs until [FetchCoordinator::stop] is called or the provider shuts down.
    pub async fn main_loop(&self) -> Result {
        let mut cancels = self.cancel_rx.lock().await;

        let res = loop {
            let deadline = self.state.lock().await.deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break Ok(());
                }

                events = self.provider.receive_events() => {
                    let mut state = self.state.lock().await;
                    let mut received = false;
                    for event in events {
                        received = true;
                        self.consume_event(&mut state, event).await;
                    }
                    if !received {
                        break Err(anyhow!("Location provider shut down"));
                    }
                }

                Some(id) = cancels.recv() => {
                    let mut state = self.state.lock().await;
                    self.detach(&mut state, id).await;
                }

                _ = Self::sleep_until(deadline) => {
                    let mut state = self.state.lock().await;
                    self.handle_timeout(&mut state, Instant::now());
                }

                _ = self.deadline_changed.notified() => {}
            }
        };

        self.teardown().await;

        res
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn current_location(&self) -> Option<Location> {
        self.state.lock().await.cache.location()
    }

    pub async fn cached(&self) -> Option<CachedLocation> {
        self.state.lock().await.cache.read()
    }

    pub async fn has_requested_authorization(&self) -> bool {
        self.state.lock().await.auth.has_requested()
    }

    pub async fn authorization_state(&self) -> AuthorizationState {
        self.state.lock().await.auth.state()
    }

    pub async fn is_fetching(&self) -> bool {
        self.state.lock().await.is_fetching()
    }

    pub async fn clone_settings(&self) -> LocatorSettings {
        self.state.lock().await.settings.clone()
    }

    pub async fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex as StdMutex},
        time::Duration,
    };

    use crate::{
        cache::RefreshInterval,
        tests::{Harness, MockProvider, ProviderCall, assert_elapsed, fix, settle},
    };

    use super::*;
    use tokio::{test, time::sleep};

    const HUNDRED: Accuracy = Accuracy::HUNDRED_METERS;

    fn mk_settings() -> LocatorSettings {
        LocatorSettings {
            timeout: Duration::from_secs(4),
            refresh_interval: RefreshInterval::Every(Duration::from_secs(10)),
            ..Default::default()
        }
    }

    fn authorized_harness() -> Harness {
        Harness::new(MockProvider::authorized(), mk_settings())
    }

    #[test]
    async fn test_fix_then_cache_hit() {
        let h = authorized_harness();
        let start = Instant::now();

        let pending = h.coordinator.request(HUNDRED).await;
        assert_eq!(h.provider.calls(), vec![ProviderCall::Start(HUNDRED)]);

        sleep(Duration::from_secs(2)).await;
        let first = fix(50.0);
        h.provider.push_fix(first);

        assert_eq!(
            pending.outcome().await,
            FetchOutcome::Succeeded {
                location: first,
                cached: false
            }
        );
        assert_elapsed(start, Duration::from_secs(2));
        assert!(!h.provider.is_running(), "Hardware left running");
        assert!(!h.coordinator.is_fetching().await);

        sleep(Duration::from_secs(3)).await;
        let mut second = h.coordinator.request(HUNDRED).await;
        assert_eq!(
            second.try_outcome(),
            Some(FetchOutcome::Succeeded {
                location: first,
                cached: true
            }),
            "Request at t=5s should be served from cache right away"
        );
        assert_eq!(h.provider.start_count(), 1, "Cache hit touched the hardware");

        // Fix stored at t=2s is stale from t=12s on
        sleep(Duration::from_secs(8)).await;
        let mut third = h.coordinator.request(HUNDRED).await;
        assert!(third.try_outcome().is_none(), "Stale cache served");
        assert_eq!(h.provider.start_count(), 2);

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_timeout_then_background_fix() {
        let h = authorized_harness();
        let start = Instant::now();

        let pending = h.coordinator.request(HUNDRED).await;
        assert_eq!(pending.outcome().await, FetchOutcome::TimedOut(None));
        assert_elapsed(start, Duration::from_secs(4));

        assert!(h.provider.is_running(), "Hardware stopped after timeout");
        assert!(h.coordinator.is_fetching().await);

        sleep(Duration::from_secs(2)).await;
        let late = fix(20.0);
        h.provider.push_fix(late);
        settle().await;

        assert_eq!(h.coordinator.current_location().await, Some(late));
        assert!(!h.provider.is_running(), "Hardware still running after late fix");
        assert!(!h.coordinator.is_fetching().await);

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_timeout_hands_out_stale_fix() {
        let mut settings = mk_settings();
        settings.refresh_interval = RefreshInterval::AlwaysFresh;
        let h = Harness::new(MockProvider::authorized(), settings);

        let pending = h.coordinator.request(HUNDRED).await;
        let old = fix(30.0);
        h.provider.push_fix(old);
        assert!(pending.outcome().await.is_success());

        let pending = h.coordinator.request(HUNDRED).await;
        assert_eq!(pending.outcome().await, FetchOutcome::TimedOut(Some(old)));

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_concurrent_requests_share_fetch() {
        let h = authorized_harness();

        let a = h.coordinator.request(HUNDRED).await;
        sleep(Duration::from_secs(1)).await;
        let b = h.coordinator.request(Accuracy::NEAREST_TEN_METERS).await;

        assert_eq!(h.provider.start_count(), 1, "Second request started hardware");
        assert_eq!(h.coordinator.lock_state().await.attached_count(), 2);

        // Joined request doesn't tighten the accuracy of the running fetch
        let shared = fix(80.0);
        h.provider.push_fix(shared);

        let expected = FetchOutcome::Succeeded {
            location: shared,
            cached: false,
        };
        assert_eq!(a.outcome().await, expected);
        assert_eq!(b.outcome().await, expected);
        assert_eq!(h.provider.start_count(), 1);

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_callbacks_in_attachment_order() {
        let h = authorized_harness();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            h.coordinator
                .request_with_callback(HUNDRED, move |outcome| {
                    order.lock().unwrap().push((i, outcome));
                })
                .await;
        }

        let shared = fix(10.0);
        h.provider.push_fix(shared);
        settle().await;

        let order = order.lock().unwrap();
        let indices = order.iter().map(|(i, _)| *i).collect::<Vec<_>>();
        assert_eq!(indices, vec![0, 1, 2]);
        for (i, outcome) in order.iter() {
            assert_eq!(
                outcome.location(),
                Some(shared),
                "Callback {i} got a different location"
            );
        }

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_cancel_one_of_many() {
        let h = authorized_harness();
        let calls = Arc::new(StdMutex::new(Vec::new()));

        let a = h.coordinator.request(HUNDRED).await;
        let b = h.coordinator.request(HUNDRED).await;
        let c = {
            let calls = calls.clone();
            h.coordinator
                .request_with_callback(HUNDRED, move |outcome| {
                    calls.lock().unwrap().push(outcome);
                })
                .await
        };

        b.cancel();
        assert_eq!(b.outcome().await, FetchOutcome::Cancelled);
        c.cancel();
        settle().await;

        assert!(h.provider.is_running(), "Cancel stopped a shared fetch");
        assert_eq!(h.coordinator.lock_state().await.attached_count(), 1);
        assert_eq!(*calls.lock().unwrap(), vec![FetchOutcome::Cancelled]);

        let shared = fix(5.0);
        h.provider.push_fix(shared);
        assert!(a.outcome().await.is_success());

        settle().await;
        assert_eq!(
            calls.lock().unwrap().len(),
            1,
            "Cancelled callback was invoked again"
        );

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_last_cancel_stops_hardware() {
        let h = authorized_harness();

        let a = h.coordinator.request(HUNDRED).await;
        let b = h.coordinator.request(HUNDRED).await;

        a.cancel();
        settle().await;
        assert!(h.provider.is_running());

        b.cancel();
        settle().await;
        assert!(!h.provider.is_running(), "Hardware left running with no callers");
        assert!(!h.coordinator.is_fetching().await);

        // A fix arriving after teardown must not land in the cache
        h.provider.push_fix(fix(5.0));
        settle().await;
        assert_eq!(h.coordinator.current_location().await, None);

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_cancel_after_timeout_keeps_background_fetch() {
        let h = authorized_harness();

        let first = h.coordinator.request(HUNDRED).await;
        assert_eq!(first.outcome().await, FetchOutcome::TimedOut(None));

        let start = Instant::now();
        let second = h.coordinator.request(HUNDRED).await;
        second.cancel();
        settle().await;

        assert!(h.provider.is_running(), "Background fetch was torn down");
        assert!(h.coordinator.is_fetching().await);

        // Joining a background fetch re-arms the deadline
        let third = h.coordinator.request(HUNDRED).await;
        assert_eq!(third.outcome().await, FetchOutcome::TimedOut(None));
        assert_elapsed(start, Duration::from_secs(4));
        assert_eq!(h.provider.start_count(), 1);

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_provider_error_fails_everyone() {
        let h = authorized_harness();

        let a = h.coordinator.request(HUNDRED).await;
        let b = h.coordinator.request(HUNDRED).await;
        h.provider.push_error(ProviderError::Unavailable);

        let expected = FetchOutcome::Failed(LocatorError::ProviderUnavailable);
        assert_eq!(a.outcome().await, expected);
        assert_eq!(b.outcome().await, expected);
        assert!(!h.provider.is_running());
        assert_eq!(h.coordinator.current_location().await, None);

        // No automatic retry
        settle().await;
        assert_eq!(h.provider.start_count(), 1);

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_inaccurate_fix_ignored() {
        let h = authorized_harness();

        let mut pending = h.coordinator.request(HUNDRED).await;
        h.provider.push_fix(fix(500.0));
        settle().await;

        assert!(pending.try_outcome().is_none(), "Resolved with a bad fix");
        assert_eq!(h.coordinator.current_location().await, None);

        let good = fix(99.0);
        h.provider.push_fix(good);
        assert_eq!(pending.outcome().await.location(), Some(good));

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_settings_change_does_not_affect_running_fetch() {
        let h = authorized_harness();
        let start = Instant::now();

        let pending = h.coordinator.request(HUNDRED).await;
        h.coordinator.lock_state().await.settings_mut().timeout = Duration::from_secs(30);

        assert_eq!(pending.outcome().await, FetchOutcome::TimedOut(None));
        assert_elapsed(start, Duration::from_secs(4));

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_auto_authorization() {
        let provider = MockProvider::new(AuthorizationStatus::NotDetermined);
        let h = Harness::new(provider, mk_settings());

        let pending = h.coordinator.request(HUNDRED).await;
        assert_eq!(
            h.provider.calls(),
            vec![ProviderCall::RequestAuthorization(AuthorizationMode::Always)],
            "Hardware started before authorization"
        );
        assert!(h.coordinator.has_requested_authorization().await);
        assert_eq!(
            h.coordinator.authorization_state().await,
            AuthorizationState::Pending
        );

        // A second fetch while pending doesn't prompt again
        let joined = h.coordinator.request(HUNDRED).await;

        h.provider
            .decide(AuthorizationStatus::Granted(AuthorizationMode::Always));
        settle().await;
        assert_eq!(h.provider.start_count(), 1);

        let location = fix(15.0);
        h.provider.push_fix(location);
        assert_eq!(pending.outcome().await.location(), Some(location));
        assert_eq!(joined.outcome().await.location(), Some(location));

        assert_eq!(
            h.coordinator
                .request_authorization(AuthorizationMode::Always)
                .await,
            Err(LocatorError::AuthorizationAlreadyRequested),
            "Manual request after an automatic one should fail"
        );

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_no_auto_authorization_waits_for_manual() {
        let mut settings = mk_settings();
        settings.auto_request_authorization = false;
        let h = Harness::new(MockProvider::new(AuthorizationStatus::NotDetermined), settings);

        let pending = h.coordinator.request(HUNDRED).await;
        assert!(h.provider.calls().is_empty(), "Provider touched without authorization");
        assert!(!h.coordinator.has_requested_authorization().await);

        assert_eq!(pending.outcome().await, FetchOutcome::TimedOut(None));

        let auth = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .request_authorization(AuthorizationMode::WhenInUse)
                    .await
            })
        };
        settle().await;

        let granted = AuthorizationStatus::Granted(AuthorizationMode::WhenInUse);
        h.provider.decide(granted);
        assert_eq!(auth.await.unwrap(), Ok(granted));

        // The timed out fetch picks up where it left off
        settle().await;
        assert_eq!(h.provider.start_count(), 1);
        let location = fix(1.0);
        h.provider.push_fix(location);
        settle().await;
        assert_eq!(h.coordinator.current_location().await, Some(location));

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_manual_authorization_twice() {
        let h = Harness::new(MockProvider::new(AuthorizationStatus::Denied), mk_settings());

        assert_eq!(
            h.coordinator
                .request_authorization(AuthorizationMode::Always)
                .await,
            Ok(AuthorizationStatus::Denied),
            "Decided status should resolve right away"
        );
        assert_eq!(
            h.coordinator
                .request_authorization(AuthorizationMode::Always)
                .await,
            Err(LocatorError::AuthorizationAlreadyRequested)
        );
        assert!(h.provider.calls().is_empty(), "Prompted for a decided status");

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_denied_fails_fetch() {
        let h = Harness::new(
            MockProvider::new(AuthorizationStatus::NotDetermined),
            mk_settings(),
        );

        let pending = h.coordinator.request(HUNDRED).await;
        h.provider.decide(AuthorizationStatus::Denied);
        assert_eq!(
            pending.outcome().await,
            FetchOutcome::Failed(LocatorError::AuthorizationDenied)
        );

        let mut refused = h.coordinator.request(HUNDRED).await;
        assert_eq!(
            refused.try_outcome(),
            Some(FetchOutcome::Failed(LocatorError::AuthorizationDenied))
        );
        assert_eq!(h.provider.start_count(), 0);

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_revocation_fails_running_fetch() {
        let h = authorized_harness();

        let pending = h.coordinator.request(HUNDRED).await;
        assert!(h.provider.is_running());

        h.provider.decide(AuthorizationStatus::Denied);
        assert_eq!(
            pending.outcome().await,
            FetchOutcome::Failed(LocatorError::AuthorizationDenied)
        );
        assert!(!h.provider.is_running());

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_stray_fix_ignored() {
        let h = authorized_harness();

        let pending = h.coordinator.request(HUNDRED).await;
        let first = fix(10.0);
        h.provider.push_fix(first);
        h.provider.push_fix(fix(1.0));
        assert_eq!(pending.outcome().await.location(), Some(first));

        settle().await;
        assert_eq!(
            h.coordinator.current_location().await,
            Some(first),
            "Fix after resolution overwrote the cache"
        );

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_warm_fills_cache() {
        let h = authorized_harness();

        h.coordinator.warm(Accuracy::Best).await;
        assert_eq!(h.provider.calls(), vec![ProviderCall::Start(Accuracy::Best)]);

        let location = fix(750.0);
        h.provider.push_fix(location);
        settle().await;

        assert_eq!(h.coordinator.current_location().await, Some(location));

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_stop_fails_attached() {
        let h = authorized_harness();

        let pending = h.coordinator.request(HUNDRED).await;
        let coordinator = h.coordinator.clone();
        let provider = h.provider.clone();
        h.stop().await.unwrap();

        assert_eq!(
            pending.outcome().await,
            FetchOutcome::Failed(LocatorError::CoordinatorStopped)
        );
        assert!(!provider.is_running());

        let mut late = coordinator.request(HUNDRED).await;
        assert_eq!(
            late.try_outcome(),
            Some(FetchOutcome::Failed(LocatorError::CoordinatorStopped))
        );
    }

    #[test]
    async fn test_huge_timeout_never_fires() {
        let mut settings = mk_settings();
        settings.timeout = Duration::MAX;
        let h = Harness::new(MockProvider::authorized(), settings);

        let mut pending = h.coordinator.request(HUNDRED).await;
        sleep(Duration::from_secs(60 * 60)).await;
        assert!(pending.try_outcome().is_none(), "Resolved without a fix");

        let joined = h.coordinator.request(HUNDRED).await;
        let location = fix(40.0);
        h.provider.push_fix(location);

        assert_eq!(pending.outcome().await.location(), Some(location));
        assert_eq!(joined.outcome().await.location(), Some(location));

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_cancel_after_cache_hit_keeps_result() {
        let h = authorized_harness();

        let first = h.coordinator.request(HUNDRED).await;
        let location = fix(25.0);
        h.provider.push_fix(location);
        assert!(first.outcome().await.is_success());

        let hit = h.coordinator.request(HUNDRED).await;
        hit.cancel();
        assert!(!hit.handle().is_cancelled());
        assert_eq!(
            hit.outcome().await,
            FetchOutcome::Succeeded {
                location,
                cached: true
            }
        );

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_fix_and_deadline_same_instant() {
        let h = authorized_harness();
        let outcomes = Arc::new(StdMutex::new(Vec::new()));

        {
            let outcomes = outcomes.clone();
            h.coordinator
                .request_with_callback(HUNDRED, move |outcome| {
                    outcomes.lock().unwrap().push(outcome);
                })
                .await;
        }

        sleep(Duration::from_secs(4)).await;
        let location = fix(60.0);
        h.provider.push_fix(location);
        settle().await;

        let outcomes = outcomes.lock().unwrap().clone();
        assert_eq!(outcomes.len(), 1, "Resolved more than once: {outcomes:?}");
        assert!(
            matches!(
                &outcomes[0],
                FetchOutcome::Succeeded { location: got, cached: false } if *got == location
            ) || outcomes[0] == FetchOutcome::TimedOut(None),
            "Unexpected outcome {:?}",
            outcomes[0]
        );

        // Either way the fix lands in the cache and the hardware goes quiet
        assert_eq!(h.coordinator.current_location().await, Some(location));
        assert!(!h.provider.is_running());
        assert!(!h.coordinator.is_fetching().await);

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_error_while_starting_fails_fetch() {
        let h = Harness::new(
            MockProvider::new(AuthorizationStatus::NotDetermined),
            mk_settings(),
        );

        let pending = h.coordinator.request(HUNDRED).await;
        h.provider.push_error(ProviderError::Other("boom".into()));

        assert_eq!(
            pending.outcome().await,
            FetchOutcome::Failed(LocatorError::Provider("boom".into()))
        );
        assert!(!h.coordinator.is_fetching().await);

        // A grant arriving afterwards has nothing to start
        h.provider
            .decide(AuthorizationStatus::Granted(AuthorizationMode::Always));
        settle().await;
        assert_eq!(h.provider.start_count(), 0);
        assert!(!h.provider.calls().contains(&ProviderCall::Stop));

        h.stop().await.unwrap();
    }

    #[test]
    async fn test_error_during_background_fetch() {
        let mut settings = mk_settings();
        settings.refresh_interval = RefreshInterval::AlwaysFresh;
        let h = Harness::new(MockProvider::authorized(), settings);

        let first = h.coordinator.request(HUNDRED).await;
        let old = fix(30.0);
        h.provider.push_fix(old);
        assert!(first.outcome().await.is_success());

        let second = h.coordinator.request(HUNDRED).await;
        assert_eq!(second.outcome().await, FetchOutcome::TimedOut(Some(old)));
        assert!(h.provider.is_running());

        h.provider.push_error(ProviderError::Unavailable);
        settle().await;

        assert!(!h.provider.is_running(), "Hardware left running after error");
        assert!(!h.coordinator.is_fetching().await);
        assert_eq!(h.coordinator.current_location().await, Some(old));

        h.stop().await.unwrap();
    }
}
