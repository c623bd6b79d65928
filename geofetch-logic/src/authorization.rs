use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::LocatorError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// What kind of access to ask the user for
pub enum AuthorizationMode {
    /// Location may be used while the host app is in the background
    #[default]
    Always,
    /// Location may only be used while the host app is in use
    WhenInUse,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Authorization status as reported by the platform
pub enum AuthorizationStatus {
    /// The user hasn't been asked yet, or hasn't answered
    #[default]
    NotDetermined,
    /// Access is blocked by the OS (parental controls etc), the user can't change it
    Restricted,
    /// The user said no
    Denied,
    /// The user said yes, with the given mode
    Granted(AuthorizationMode),
}

impl AuthorizationStatus {
    /// Whether the user (or OS) has made a final decision
    pub fn is_decided(&self) -> bool {
        !matches!(self, Self::NotDetermined)
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The gate's view of authorization, combining the platform status with whether we've asked
pub enum AuthorizationState {
    NotRequested,
    /// We asked and are waiting on the user
    Pending,
    Granted(AuthorizationMode),
    Denied,
}

/// Tracks the one-time authorization handshake. Only lives inside the coordinator's state
/// lock, so it has no synchronization of its own.
#[derive(Debug)]
pub struct AuthorizationGate {
    requested: bool,
    status: AuthorizationStatus,
    waiters: Vec<oneshot::Sender<AuthorizationStatus>>,
}

impl AuthorizationGate {
    pub fn new(status: AuthorizationStatus) -> Self {
        Self {
            requested: false,
            status,
            waiters: Vec::new(),
        }
    }

    pub fn has_requested(&self) -> bool {
        self.requested
    }

    pub fn status(&self) -> AuthorizationStatus {
        self.status
    }

    pub fn state(&self) -> AuthorizationState {
        match self.status {
            AuthorizationStatus::Granted(mode) => AuthorizationState::Granted(mode),
            AuthorizationStatus::Denied | AuthorizationStatus::Restricted => {
                AuthorizationState::Denied
            }
            AuthorizationStatus::NotDetermined if self.requested => AuthorizationState::Pending,
            AuthorizationStatus::NotDetermined => AuthorizationState::NotRequested,
        }
    }

    /// Mark authorization as requested. Fails if it was already requested, whether or not
    /// that request has been answered.
    pub fn begin_request(&mut self) -> Result<(), LocatorError> {
        if self.requested {
            Err(LocatorError::AuthorizationAlreadyRequested)
        } else {
            self.requested = true;
            Ok(())
        }
    }

    /// Get a receiver that resolves once the status is decided, immediately if it already is
    pub fn wait(&mut self) -> oneshot::Receiver<AuthorizationStatus> {
        let (tx, rx) = oneshot::channel();
        if self.status.is_decided() {
            tx.send(self.status).ok();
        } else {
            self.waiters.push(tx);
        }
        rx
    }

    /// Record a status reported by the platform, returns the state before the change
    pub fn update(&mut self, status: AuthorizationStatus) -> AuthorizationState {
        let previous = self.state();
        self.status = status;

        if status.is_decided() {
            for waiter in self.waiters.drain(..) {
                waiter.send(status).ok();
            }
        }

        previous
    }

    /// Drop every waiter without an answer, they will see their channel close
    pub fn abandon_waiters(&mut self) {
        self.waiters.clear();
    }
}
