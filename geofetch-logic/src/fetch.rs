use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{error::LocatorError, location::Location};

pub type RequestId = Uuid;

/// Terminal result of a single fetch request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FetchOutcome {
    /// Got a fix, `cached` is true if it came straight from the cache without touching the
    /// hardware
    Succeeded { location: Location, cached: bool },
    /// No qualifying fix arrived in time, contains the last known fix if there is one. The
    /// hardware keeps going in the background and will update the cache when it gets a fix.
    TimedOut(Option<Location>),
    Failed(LocatorError),
    Cancelled,
}

impl FetchOutcome {
    /// The best location this outcome has to offer, stale or not
    pub fn location(&self) -> Option<Location> {
        match self {
            Self::Succeeded { location, .. } => Some(*location),
            Self::TimedOut(location) => *location,
            Self::Failed(_) | Self::Cancelled => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

pub type CompletionCallback = Box<dyn FnOnce(FetchOutcome) + Send>;

/// Where a request's outcome goes
pub(crate) enum Completion {
    Channel(oneshot::Sender<FetchOutcome>),
    Callback(CompletionCallback),
    /// Nobody is listening, the fetch only exists to warm the cache
    Detached,
}

/// A caller's pending ask, attached to the active fetch until it resolves
pub(crate) struct FetchRequest {
    pub id: RequestId,
    completion: Completion,
    token: CancellationToken,
    resolved: Arc<AtomicBool>,
}

impl FetchRequest {
    pub fn new(completion: Completion) -> Self {
        Self {
            id: Uuid::new_v4(),
            completion,
            token: CancellationToken::new(),
            resolved: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self, cancels: mpsc::UnboundedSender<RequestId>) -> CancelHandle {
        CancelHandle {
            id: self.id,
            token: self.token.clone(),
            resolved: self.resolved.clone(),
            cancels,
        }
    }

    /// Deliver the outcome, consuming the request so it can only happen once. A request
    /// whose handle was cancelled always gets [FetchOutcome::Cancelled].
    pub fn resolve(self, outcome: FetchOutcome) {
        self.resolved.store(true, Ordering::SeqCst);
        let outcome = if self.token.is_cancelled() {
            FetchOutcome::Cancelled
        } else {
            outcome
        };

        match self.completion {
            Completion::Channel(tx) => {
                tx.send(outcome).ok();
            }
            Completion::Callback(callback) => callback(outcome),
            Completion::Detached => {}
        }
    }
}

/// Lets a caller cancel their request, cloneable so it can be handed around
#[derive(Debug, Clone)]
pub struct CancelHandle {
    id: RequestId,
    token: CancellationToken,
    resolved: Arc<AtomicBool>,
    cancels: mpsc::UnboundedSender<RequestId>,
}

impl CancelHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Cancel the request. Takes effect immediately for this caller, other callers
    /// sharing the same fetch are unaffected. Does nothing once the request resolved.
    pub fn cancel(&self) {
        if !self.is_resolved() && !self.token.is_cancelled() {
            self.token.cancel();
            // Closed means the coordinator is gone, nothing left to detach from
            self.cancels.send(self.id).ok();
        }
    }
}

/// Future-style handle for a request, resolves to a [FetchOutcome]
#[derive(Debug)]
pub struct PendingLocation {
    handle: CancelHandle,
    rx: oneshot::Receiver<FetchOutcome>,
    ready: Option<FetchOutcome>,
}

impl PendingLocation {
    pub(crate) fn new(handle: CancelHandle, rx: oneshot::Receiver<FetchOutcome>) -> Self {
        Self {
            handle,
            rx,
            ready: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.handle.id
    }

    pub fn handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Get the outcome if it's already available, this is the case for cache hits
    pub fn try_outcome(&mut self) -> Option<FetchOutcome> {
        if self.ready.is_none() {
            self.ready = self.rx.try_recv().ok();
        }
        if self.ready.is_none() && self.handle.is_cancelled() {
            return Some(FetchOutcome::Cancelled);
        }
        self.ready.clone()
    }

    /// Wait for the outcome
    pub async fn outcome(self) -> FetchOutcome {
        let Self {
            handle,
            mut rx,
            ready,
        } = self;

        if let Some(outcome) = ready.or_else(|| rx.try_recv().ok()) {
            return outcome;
        }

        tokio::select! {
            _ = handle.token.cancelled() => FetchOutcome::Cancelled,

            res = rx => res.unwrap_or(FetchOutcome::Failed(LocatorError::CoordinatorStopped)),
        }
    }
}
