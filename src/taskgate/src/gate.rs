//! Counting locks.
//!
//! A [`Gate`] mediates up to `concurrency` concurrent holders. Acquisition
//! requests past the limit queue under the configured
//! [`QueueOrder`](crate::QueueOrder) and are
//! promoted one by one as permits come back. An optional release timeout
//! bounds how long a permit may be held; when it fires, the permit is taken
//! back while the holder keeps running.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slab::Slab;
use tokio::sync::oneshot;

use crate::events::{EventError, EventErrorCode, EventHub, SubscriptionId};
use crate::options::{GateHook, GateOptions};
use crate::timeout::TimerHandle;
use crate::wait::WaitQueue;

/// Identifies a single acquisition over the lifetime of a gate.
///
/// Serials are never reused, so a stale release token can always be told
/// apart from the permit currently occupying its storage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermitId(u64);

impl fmt::Display for PermitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events emitted by a [`Gate`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum GateEvent {
    /// A permit was handed to an acquirer.
    Acquired { permit: PermitId },
    /// A permit came back. `timeout_reached` is set when the release was
    /// caused by the permit's release timer rather than by the holder.
    Released {
        permit: PermitId,
        timeout_reached: bool,
    },
    /// A user-supplied handler failed.
    Error(EventError),
}

/// An admission slot handed out by [`Gate::acquire`] or
/// [`Gate::try_acquire`].
///
/// The permit is returned on [`release`](GatePermit::release) or on drop,
/// whichever happens first. Returning a permit is idempotent: a permit that
/// was already taken back by [`Gate::release_acquired`] or by a release
/// timer is silently ignored.
pub struct GatePermit {
    shared: Arc<GateShared>,
    key: usize,
    serial: u64,
}

impl GatePermit {
    pub fn id(&self) -> PermitId {
        PermitId(self.serial)
    }

    /// Return the permit, promoting the next waiter if any.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        GateShared::release_permit(&self.shared, self.key, self.serial, false);
    }
}

impl fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatePermit")
            .field("permit", &self.serial)
            .finish()
    }
}

/// A counting lock with a configurable promotion order and an optional
/// bound on how long each permit may be held.
///
/// Cloning produces another handle to the same gate.
#[derive(Clone)]
pub struct Gate {
    shared: Arc<GateShared>,
}

struct GateShared {
    state: Mutex<GateState>,
    events: EventHub<GateEvent>,
    release_timeout: Duration,
    release_timeout_handler: Option<GateHook>,
}

struct GateState {
    concurrency: usize,
    /// Permits currently held. Never exceeds `concurrency` outside a
    /// critical section.
    acquired: Slab<AcquiredPermit>,
    /// Non-empty only while `acquired` is full.
    waiting: WaitQueue<GateWaiter>,
    next_serial: u64,
}

struct AcquiredPermit {
    serial: u64,
    #[allow(dead_code)] // held for cancel-on-drop
    release_timer: Option<TimerHandle>,
}

struct GateWaiter {
    tx: oneshot::Sender<PermitGrant>,
}

/// What a promoted waiter receives over its oneshot channel.
struct PermitGrant {
    key: usize,
    serial: u64,
}

/// A promotion decided under the state lock, delivered after it is dropped.
struct PendingGrant {
    key: usize,
    serial: u64,
    tx: oneshot::Sender<PermitGrant>,
}

impl Gate {
    pub fn new() -> Self {
        Self::with_options(GateOptions::new())
    }

    pub fn with_options(options: GateOptions) -> Self {
        Self {
            shared: Arc::new(GateShared {
                state: Mutex::new(GateState {
                    concurrency: options.effective_concurrency(),
                    acquired: Slab::new(),
                    waiting: WaitQueue::new(options.queue_order),
                    next_serial: 0,
                }),
                events: EventHub::new(),
                release_timeout: options.release_timeout,
                release_timeout_handler: options.release_timeout_handler,
            }),
        }
    }

    /// Acquire a permit, queueing behind the configured discipline when the
    /// gate is at capacity. Never fails; the future completes when this
    /// request is promoted.
    pub async fn acquire(&self) -> GatePermit {
        let (tx, rx) = oneshot::channel();
        let grants = {
            let mut state = crate::lock(&self.shared.state);
            state.waiting.push(GateWaiter { tx });
            GateShared::dispatch_locked(&self.shared, &mut state)
        };
        GateShared::deliver(&self.shared, grants);

        // The sender lives in the gate state, and the gate state outlives
        // this future (it holds an `Arc` to it), so the grant always comes.
        let grant = rx.await.expect("gate state dropped while a waiter was queued");
        GatePermit {
            shared: Arc::clone(&self.shared),
            key: grant.key,
            serial: grant.serial,
        }
    }

    /// Acquire a permit only if one is free *and* nobody is queued.
    ///
    /// The second condition is deliberate: `try_acquire` refuses to barge
    /// past queued waiters even when a free slot would otherwise exist.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        let (key, serial) = {
            let mut state = crate::lock(&self.shared.state);
            if state.acquired.len() >= state.concurrency || !state.waiting.is_empty() {
                return None;
            }
            GateShared::install_permit(&self.shared, &mut state)
        };
        self.shared.events.emit(&GateEvent::Acquired {
            permit: PermitId(serial),
        });
        Some(GatePermit {
            shared: Arc::clone(&self.shared),
            key,
            serial,
        })
    }

    /// `true` while fewer than `concurrency` permits are held.
    pub fn is_available(&self) -> bool {
        let state = crate::lock(&self.shared.state);
        state.acquired.len() < state.concurrency
    }

    /// Force-release every currently held permit. The permit set is
    /// snapshotted first; waiters are then promoted as usual. Outstanding
    /// [`GatePermit`] values become stale and their later release is a
    /// no-op.
    pub fn release_acquired(&self) {
        let (released, grants) = {
            let mut state = crate::lock(&self.shared.state);
            let keys: Vec<usize> = state.acquired.iter().map(|(key, _)| key).collect();
            let mut released = Vec::with_capacity(keys.len());
            for key in keys {
                let permit = state.acquired.remove(key);
                released.push(PermitId(permit.serial));
            }
            let grants = GateShared::dispatch_locked(&self.shared, &mut state);
            (released, grants)
        };
        for permit in released {
            log::debug!("gate permit {permit} force-released");
            self.shared.events.emit(&GateEvent::Released {
                permit,
                timeout_reached: false,
            });
        }
        GateShared::deliver(&self.shared, grants);
    }

    /// Register a listener for [`GateEvent`]s.
    pub fn subscribe(&self, listener: impl Fn(&GateEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.shared.events.subscribe(listener)
    }

    /// Remove a previously registered listener.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = crate::lock(&self.shared.state);
        f.debug_struct("Gate")
            .field("concurrency", &state.concurrency)
            .field("acquired", &state.acquired.len())
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

impl GateShared {
    /// Install a fresh permit, arming its release timer when one is
    /// configured. Caller has verified there is room.
    fn install_permit(shared: &Arc<Self>, state: &mut GateState) -> (usize, u64) {
        let serial = state.next_serial;
        state.next_serial += 1;
        let key = state.acquired.insert(AcquiredPermit {
            serial,
            release_timer: None,
        });
        if !shared.release_timeout.is_zero() {
            let weak = Arc::downgrade(shared);
            let timer = TimerHandle::schedule(shared.release_timeout, move || {
                if let Some(shared) = weak.upgrade() {
                    GateShared::on_release_timeout(&shared, key, serial);
                }
            });
            state.acquired[key].release_timer = Some(timer);
        }
        (key, serial)
    }

    /// Promote waiters while a slot is free.
    fn dispatch_locked(shared: &Arc<Self>, state: &mut GateState) -> Vec<PendingGrant> {
        let mut grants = Vec::new();
        while state.acquired.len() < state.concurrency {
            let Some(waiter) = state.waiting.pop_next() else {
                break;
            };
            let (key, serial) = Self::install_permit(shared, state);
            grants.push(PendingGrant {
                key,
                serial,
                tx: waiter.tx,
            });
        }
        grants
    }

    /// Complete promotions decided under the lock: emit `Acquired` and hand
    /// the permit over. A waiter whose acquire future was dropped is
    /// skipped and its slot recycled, which may promote further waiters —
    /// processed iteratively so a long run of dropped waiters cannot grow
    /// the stack.
    fn deliver(shared: &Arc<Self>, grants: Vec<PendingGrant>) {
        let mut pending: VecDeque<PendingGrant> = grants.into();
        while let Some(grant) = pending.pop_front() {
            // A waiter that vanished while queued gets no events at all:
            // its slot is recycled before anything observable happened.
            if grant.tx.is_closed() {
                let more = {
                    let mut state = crate::lock(&shared.state);
                    match state.acquired.get(grant.key) {
                        Some(permit) if permit.serial == grant.serial => {
                            state.acquired.remove(grant.key);
                            Self::dispatch_locked(shared, &mut state)
                        }
                        _ => Vec::new(),
                    }
                };
                pending.extend(more);
                continue;
            }
            log::trace!("gate permit {} acquired", grant.serial);
            shared.events.emit(&GateEvent::Acquired {
                permit: PermitId(grant.serial),
            });
            let sent = grant.tx.send(PermitGrant {
                key: grant.key,
                serial: grant.serial,
            });
            if sent.is_err() {
                // Lost a race with a concurrently dropped acquirer after
                // `Acquired` went out; release normally so the events pair
                // up.
                Self::release_permit(shared, grant.key, grant.serial, false);
            }
        }
    }

    /// Return a permit identified by `(key, serial)`. Stale invocations
    /// (the serial no longer matches) do nothing, which is what makes
    /// every release path idempotent.
    fn release_permit(shared: &Arc<Self>, key: usize, serial: u64, timeout_reached: bool) {
        let grants = {
            let mut state = crate::lock(&shared.state);
            match state.acquired.get(key) {
                Some(permit) if permit.serial == serial => {}
                _ => return,
            }
            state.acquired.remove(key);
            Self::dispatch_locked(shared, &mut state)
        };
        log::trace!("gate permit {serial} released (timeout_reached={timeout_reached})");
        shared.events.emit(&GateEvent::Released {
            permit: PermitId(serial),
            timeout_reached,
        });
        Self::deliver(shared, grants);
    }

    fn on_release_timeout(shared: &Arc<Self>, key: usize, serial: u64) {
        {
            let state = crate::lock(&shared.state);
            match state.acquired.get(key) {
                Some(permit) if permit.serial == serial => {}
                _ => return,
            }
        }
        // The handler runs before the permit is taken back; a handler
        // failure must not prevent the release.
        if let Some(handler) = &shared.release_timeout_handler {
            if let Err(error) = handler() {
                shared.events.emit(&GateEvent::Error(EventError::new(
                    EventErrorCode::ReleaseTimeoutHandlerFailure,
                    error,
                )));
            }
        }
        Self::release_permit(shared, key, serial, true);
    }
}
