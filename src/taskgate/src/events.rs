//! Event subscription registry.
//!
//! A plain observer registry: listeners subscribe against a controller and
//! receive every event it emits. Emission is synchronous relative to the
//! state transition that triggered it, but always happens outside the
//! controller's state lock, so a listener may call back into the controller
//! freely.

use std::fmt;
use std::sync::{Arc, Mutex};

use slab::Slab;

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(usize);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A registry of listeners for events of type `E`.
pub(crate) struct EventHub<E> {
    listeners: Mutex<Slab<Listener<E>>>,
}

impl<E> EventHub<E> {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(Slab::new()),
        }
    }

    pub(crate) fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let key = crate::lock(&self.listeners).insert(Arc::new(listener));
        SubscriptionId(key)
    }

    /// Remove a listener. Returns `false` if the subscription was already
    /// removed (or never existed).
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = crate::lock(&self.listeners);
        listeners.try_remove(id.0).is_some()
    }

    /// Deliver `event` to every current listener.
    ///
    /// The listener set is snapshotted first; a listener that subscribes or
    /// unsubscribes during delivery affects later emissions only.
    pub(crate) fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = {
            let listeners = crate::lock(&self.listeners);
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            listener(event);
        }
    }
}

impl<E> fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &crate::lock(&self.listeners).len())
            .finish()
    }
}

/// Stable codes identifying which user-supplied handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EventErrorCode {
    /// A waiting-timeout handler returned an error.
    WaitingTimeoutHandlerFailure,
    /// A release-timeout handler returned an error.
    ReleaseTimeoutHandlerFailure,
    /// An error handler returned an error.
    ErrorHandlerFailure,
}

impl fmt::Display for EventErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WaitingTimeoutHandlerFailure => "waiting-timeout-handler-failure",
            Self::ReleaseTimeoutHandlerFailure => "release-timeout-handler-failure",
            Self::ErrorHandlerFailure => "error-handler-failure",
        })
    }
}

/// The payload of an `Error` event: a failure of a user-supplied handler.
///
/// Handler failures never propagate to the submitter and never perturb the
/// controller's state; they are only observable here.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {error}")]
pub struct EventError {
    code: EventErrorCode,
    error: Arc<anyhow::Error>,
}

impl EventError {
    pub(crate) fn new(code: EventErrorCode, error: anyhow::Error) -> Self {
        Self {
            code,
            error: Arc::new(error),
        }
    }

    pub fn code(&self) -> EventErrorCode {
        self.code
    }

    /// The error the handler returned.
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }
}
