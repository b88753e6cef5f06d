//! Task scheduling and admission control.
//!
//! A [`TaskScheduler`] admits up to `concurrency` task futures at a time
//! and queues the rest under the configured [`QueueOrder`](crate::QueueOrder). Both phases can
//! be time-bounded: a waiting timeout discards a task that queued for too
//! long, and a release timeout takes an admission slot back from a task
//! that has been running too long (the task's future keeps running — the
//! scheduler only stops accounting for it).
//!
//! # Entry lifecycle
//!
//! ```text
//! waiting --dispatch--> running --future returns--> finished
//!    |                     |
//!    | waiting timer /     | release timer / releaseRunningTasks
//!    | flush / abort       v
//!    v                  expired --future returns--> finished
//! discarded
//! ```
//!
//! An entry is in exactly one phase at a time, and exactly one of
//! `TaskFinished` / `TaskDiscarded` is emitted for every submission.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::events::{EventError, EventErrorCode, EventHub, SubscriptionId};
use crate::options::sanitize_limit_change;
use crate::options::{SchedulerOptions, TaskFailureHook, TaskHook, TaskOptions};
use crate::timeout::TimerHandle;
use crate::wait::WaitQueue;

/// Identifies a submitted task. Ids are assigned sequentially in submission
/// order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a running task's admission slot was returned before its future
/// finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseBeforeFinishReason {
    /// The task's release timer fired.
    TimeoutReached,
    /// [`TaskScheduler::release_running_tasks`] was called.
    Forced,
}

impl fmt::Display for ReleaseBeforeFinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TimeoutReached => "timeoutReached",
            Self::Forced => "forced",
        })
    }
}

/// Why a waiting task was discarded without ever running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The task's waiting timer fired.
    TimeoutReached,
    /// [`TaskScheduler::flush_pending_tasks`] was called.
    Forced,
    /// The task's effective abort signal was cancelled when the task came
    /// up for dispatch.
    AbortSignal,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TimeoutReached => "timeoutReached",
            Self::Forced => "forced",
            Self::AbortSignal => "abortSignal",
        })
    }
}

/// The final disposition of a submission. The future returned by the
/// `run*` family never fails; failures and discards are folded into this
/// value instead.
#[derive(Debug)]
#[must_use]
pub enum Settled<T> {
    /// The task ran and returned a value.
    Fulfilled(T),
    /// The task failed or never ran.
    Rejected(Rejection),
}

impl<T> Settled<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn into_result(self) -> Result<T, Rejection> {
        match self {
            Self::Fulfilled(value) => Ok(value),
            Self::Rejected(rejection) => Err(rejection),
        }
    }

    pub fn fulfilled(self) -> Option<T> {
        match self {
            Self::Fulfilled(value) => Some(value),
            Self::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Fulfilled(_) => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }
}

/// The rejected arm of [`Settled`].
#[derive(Debug, Clone)]
pub enum Rejection {
    /// The task ran and returned an error.
    Failed(Arc<anyhow::Error>),
    /// The task was discarded while waiting and never ran.
    Discarded(DiscardReason),
}

/// A snapshot of a task entry, attached to events and passed to handlers.
#[derive(Debug, Clone)]
pub struct TaskRef {
    id: TaskId,
    tag: Option<Arc<str>>,
    discard_reason: Option<DiscardReason>,
    release_reason: Option<ReleaseBeforeFinishReason>,
}

impl TaskRef {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The label given via [`TaskOptions::tag`], if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Set iff the entry was discarded.
    pub fn discard_reason(&self) -> Option<DiscardReason> {
        self.discard_reason
    }

    /// Set iff the entry's slot was returned before its future finished.
    pub fn release_reason(&self) -> Option<ReleaseBeforeFinishReason> {
        self.release_reason
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "task {} ({tag})", self.id),
            None => write!(f, "task {}", self.id),
        }
    }
}

/// Events emitted by a [`TaskScheduler`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SchedulerEvent {
    /// Emitted after a task took a slot, before its future is first polled.
    TaskStarted(TaskRef),
    /// Emitted exactly once per task that ran, after its future returned.
    TaskFinished(TaskRef),
    /// Emitted when a task's future returns an error, before the
    /// corresponding `TaskFinished`.
    TaskFailure(TaskRef, Arc<anyhow::Error>),
    /// Emitted when a running task's slot is returned early; the reason is
    /// in [`TaskRef::release_reason`]. Precedes the eventual
    /// `TaskFinished`.
    TaskReleasedBeforeFinished(TaskRef),
    /// Emitted exactly once per discarded task; the reason is in
    /// [`TaskRef::discard_reason`]. A discarded task never starts.
    TaskDiscarded(TaskRef),
    /// A user-supplied handler failed; see [`EventError`].
    Error(TaskRef, EventError),
}

/// The result of [`TaskScheduler::try_run`].
#[must_use]
pub enum TryRun<R> {
    /// A slot is free and nobody is queued; awaiting the contained future
    /// schedules the task.
    Available(R),
    /// The scheduler is at capacity or has queued waiters.
    Unavailable,
}

impl<R> TryRun<R> {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    pub fn available(self) -> Option<R> {
        match self {
            Self::Available(run) => Some(run),
            Self::Unavailable => None,
        }
    }
}

/// A submission bundled with its per-task overrides, for
/// [`TaskScheduler::run_many`].
pub struct TaskRequest<F> {
    task: F,
    options: Option<TaskOptions>,
}

impl<F> TaskRequest<F> {
    pub fn new(task: F) -> Self {
        Self {
            task,
            options: None,
        }
    }

    pub fn with_options(task: F, options: TaskOptions) -> Self {
        Self {
            task,
            options: Some(options),
        }
    }
}

/// A snapshot of the scheduler's phase counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerCounters {
    pub waiting: usize,
    pub running: usize,
    pub expired: usize,
}

/// Option values resolved at submission time: per-task override if given,
/// controller default otherwise. Snapshotting here is what makes later
/// mutation of the caller's options invisible to a submitted task.
struct EffectiveOptions {
    tag: Option<Arc<str>>,
    waiting_timeout: Duration,
    waiting_timeout_handler: Option<TaskHook>,
    release_timeout: Duration,
    release_timeout_handler: Option<TaskHook>,
    error_handler: Option<TaskFailureHook>,
    signal: Option<CancellationToken>,
}

impl EffectiveOptions {
    fn resolve(defaults: &SchedulerOptions, overrides: TaskOptions) -> Self {
        Self {
            tag: overrides.tag,
            waiting_timeout: overrides
                .waiting_timeout
                .unwrap_or(defaults.waiting_timeout),
            waiting_timeout_handler: overrides
                .waiting_timeout_handler
                .or_else(|| defaults.waiting_timeout_handler.clone()),
            release_timeout: overrides
                .release_timeout
                .unwrap_or(defaults.release_timeout),
            release_timeout_handler: overrides
                .release_timeout_handler
                .or_else(|| defaults.release_timeout_handler.clone()),
            error_handler: overrides
                .error_handler
                .or_else(|| defaults.error_handler.clone()),
            signal: overrides.signal.or_else(|| defaults.signal.clone()),
        }
    }

    fn aborted(&self) -> bool {
        self.signal
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

struct WaitingEntry {
    id: TaskId,
    eff: EffectiveOptions,
    tx: oneshot::Sender<WaitOutcome>,
    #[allow(dead_code)] // held for cancel-on-drop
    waiting_timer: Option<TimerHandle>,
}

struct RunningEntry {
    eff: EffectiveOptions,
    #[allow(dead_code)] // held for cancel-on-drop
    release_timer: Option<TimerHandle>,
}

struct ExpiredEntry {
    eff: EffectiveOptions,
    reason: ReleaseBeforeFinishReason,
}

/// What the submission wrapper receives when its waiting phase ends.
enum WaitOutcome {
    Granted,
    Discarded(DiscardReason),
}

struct SchedState {
    concurrency: usize,
    waiting: WaitQueue<WaitingEntry>,
    /// Running entries, keyed by id. Never exceeds `concurrency`.
    running: HashMap<TaskId, RunningEntry>,
    /// Entries whose slot was returned while their future is still
    /// executing. They leave this set when the future finally returns.
    expired: HashMap<TaskId, ExpiredEntry>,
    next_id: u64,
}

struct SchedShared {
    state: Mutex<SchedState>,
    events: EventHub<SchedulerEvent>,
    defaults: SchedulerOptions,
}

/// A promotion or discard decided under the state lock, carried out after
/// it is dropped.
enum Dispatched {
    Started {
        entry: TaskRef,
        tx: oneshot::Sender<WaitOutcome>,
    },
    Discarded {
        entry: TaskRef,
        reason: DiscardReason,
        tx: oneshot::Sender<WaitOutcome>,
    },
}

/// An in-process asynchronous task scheduler.
///
/// Cloning produces another handle to the same scheduler. All operations
/// require a tokio runtime context (timers are tokio tasks).
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<SchedShared>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::with_options(SchedulerOptions::new())
    }

    pub fn with_options(options: SchedulerOptions) -> Self {
        Self {
            shared: Arc::new(SchedShared {
                state: Mutex::new(SchedState {
                    concurrency: options.effective_concurrency(),
                    waiting: WaitQueue::new(options.queue_order),
                    running: HashMap::new(),
                    expired: HashMap::new(),
                    next_id: 0,
                }),
                events: EventHub::new(),
                defaults: options,
            }),
        }
    }

    /// Run `task` under the scheduler's admission control.
    ///
    /// The returned future resolves once the task has finished (or was
    /// discarded while waiting) and never fails; see [`Settled`].
    pub async fn run<T, F, Fut>(&self, task: F) -> Settled<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_with_options(TaskOptions::new(), task).await
    }

    /// As [`run`](Self::run), with per-task overrides.
    pub async fn run_with_options<T, F, Fut>(&self, options: TaskOptions, task: F) -> Settled<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let (id, rx) = SchedShared::submit(&self.shared, options);
        // Armed before the waiting phase: if this future is dropped after
        // the slot was granted but before the task ran (or mid task), the
        // guard closes the running entry. While the entry is still queued
        // the guard finds nothing to close and the entry is skipped at
        // promotion instead.
        let mut guard = CompletionGuard {
            shared: Arc::clone(&self.shared),
            id,
            armed: true,
        };
        match rx.await {
            Ok(WaitOutcome::Granted) => {}
            Ok(WaitOutcome::Discarded(reason)) => {
                guard.disarm();
                return Settled::Rejected(Rejection::Discarded(reason));
            }
            // The scheduler state cannot drop a queued sender while this
            // future is alive; treat the impossible as a forced discard
            // rather than panicking in a wrapper that promises not to.
            Err(_) => {
                guard.disarm();
                return Settled::Rejected(Rejection::Discarded(DiscardReason::Forced));
            }
        }

        match task().await {
            Ok(value) => {
                guard.finish(None);
                Settled::Fulfilled(value)
            }
            Err(error) => {
                let error = Arc::new(error);
                guard.finish(Some(Arc::clone(&error)));
                Settled::Rejected(Rejection::Failed(error))
            }
        }
    }

    /// Submit several tasks at once. Results come back in submission order;
    /// execution order is whatever the discipline dictates.
    pub async fn run_many<T, F, Fut>(
        &self,
        requests: impl IntoIterator<Item = TaskRequest<F>>,
    ) -> Vec<Settled<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        join_all(requests.into_iter().map(|request| {
            self.run_with_options(request.options.unwrap_or_default(), request.task)
        }))
        .await
    }

    /// Submit one task per argument value. `task` is invoked with each
    /// element; results come back in argument order.
    pub async fn run_for_each_args<A, T, F, Fut>(
        &self,
        args: impl IntoIterator<Item = A>,
        options: Option<TaskOptions>,
        task: F,
    ) -> Vec<Settled<T>>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let task = &task;
        join_all(args.into_iter().map(move |arg| {
            let options = options.clone().unwrap_or_default();
            self.run_with_options(options, move || task(arg))
        }))
        .await
    }

    /// Submit one task per entity. Equivalent to
    /// [`run_for_each_args`](Self::run_for_each_args) with the entity as
    /// the sole argument.
    pub async fn run_for_each<E, T, F, Fut>(
        &self,
        entities: impl IntoIterator<Item = E>,
        options: Option<TaskOptions>,
        task: F,
    ) -> Vec<Settled<T>>
    where
        F: Fn(E) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_for_each_args(entities, options, task).await
    }

    /// Report availability without scheduling anything.
    ///
    /// `Available` is returned only when a slot is free *and* the waiting
    /// queue is empty — mirroring [`Gate::try_acquire`](crate::Gate::try_acquire),
    /// this refuses to barge past queued tasks. The contained future
    /// schedules the task normally when awaited (and may queue if the
    /// situation changed in between).
    pub fn try_run<'a, T, F, Fut>(&'a self, task: F) -> TryRun<impl Future<Output = Settled<T>> + 'a>
    where
        T: 'a,
        F: FnOnce() -> Fut + 'a,
        Fut: Future<Output = anyhow::Result<T>> + 'a,
    {
        let available = {
            let state = crate::lock(&self.shared.state);
            state.running.len() < state.concurrency && state.waiting.is_empty()
        };
        if available {
            TryRun::Available(self.run(task))
        } else {
            TryRun::Unavailable
        }
    }

    /// Force-release the admission slot of every running task. The tasks'
    /// futures keep executing; each entry moves to the expired set and
    /// finishes normally when its future returns. A no-op when nothing is
    /// running.
    pub fn release_running_tasks(&self) {
        let (released, dispatched) = {
            let mut state = crate::lock(&self.shared.state);
            let ids: Vec<TaskId> = state.running.keys().copied().collect();
            let mut released = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(running) = state.running.remove(&id) else {
                    continue;
                };
                let entry = TaskRef {
                    id,
                    tag: running.eff.tag.clone(),
                    discard_reason: None,
                    release_reason: Some(ReleaseBeforeFinishReason::Forced),
                };
                state.expired.insert(
                    id,
                    ExpiredEntry {
                        eff: running.eff,
                        reason: ReleaseBeforeFinishReason::Forced,
                    },
                );
                released.push(entry);
            }
            let dispatched = SchedShared::dispatch_locked(&self.shared, &mut state);
            (released, dispatched)
        };
        for entry in released {
            log::debug!("{entry} released before finishing (forced)");
            self.shared
                .events
                .emit(&SchedulerEvent::TaskReleasedBeforeFinished(entry));
        }
        SchedShared::perform(&self.shared, dispatched);
    }

    /// Discard every waiting task. Each discarded entry emits
    /// `TaskDiscarded` with [`DiscardReason::Forced`]; running tasks are
    /// untouched. Calling this twice in a row emits nothing the second
    /// time.
    pub fn flush_pending_tasks(&self) {
        let drained = {
            let mut state = crate::lock(&self.shared.state);
            state.waiting.drain_all()
        };
        for entry in drained {
            let WaitingEntry {
                id,
                eff,
                tx,
                waiting_timer,
            } = entry;
            drop(waiting_timer);
            let entry = TaskRef {
                id,
                tag: eff.tag.clone(),
                discard_reason: Some(DiscardReason::Forced),
                release_reason: None,
            };
            log::debug!("{entry} discarded: pending queue flushed");
            self.shared.events.emit(&SchedulerEvent::TaskDiscarded(entry));
            let _ = tx.send(WaitOutcome::Discarded(DiscardReason::Forced));
        }
    }

    /// `true` while fewer than `concurrency` tasks hold a slot.
    pub fn is_available(&self) -> bool {
        let state = crate::lock(&self.shared.state);
        state.running.len() < state.concurrency
    }

    /// Change the concurrency limit of a live scheduler.
    ///
    /// Unusable values (non-finite, fractional, below one) are ignored.
    /// Raising the limit immediately admits newly allowed waiters;
    /// lowering it evicts nothing — the running set drains naturally.
    pub fn change_concurrent_limit(&self, new_limit: f64) {
        let Some(limit) = sanitize_limit_change(new_limit) else {
            log::debug!("ignoring concurrency change to {new_limit}");
            return;
        };
        let dispatched = {
            let mut state = crate::lock(&self.shared.state);
            let previous = state.concurrency;
            state.concurrency = limit;
            log::trace!("concurrency limit changed: {previous} -> {limit}");
            if limit > previous {
                SchedShared::dispatch_locked(&self.shared, &mut state)
            } else {
                Vec::new()
            }
        };
        SchedShared::perform(&self.shared, dispatched);
    }

    /// Number of tasks currently queued.
    pub fn waiting_tasks(&self) -> usize {
        crate::lock(&self.shared.state).waiting.len()
    }

    /// Number of tasks currently holding a slot.
    pub fn running_tasks(&self) -> usize {
        crate::lock(&self.shared.state).running.len()
    }

    /// Number of tasks whose slot was returned while their future is still
    /// executing.
    pub fn expired_tasks(&self) -> usize {
        crate::lock(&self.shared.state).expired.len()
    }

    /// All three phase counters in one consistent snapshot.
    pub fn counters(&self) -> SchedulerCounters {
        let state = crate::lock(&self.shared.state);
        SchedulerCounters {
            waiting: state.waiting.len(),
            running: state.running.len(),
            expired: state.expired.len(),
        }
    }

    /// Register a listener for [`SchedulerEvent`]s.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SchedulerEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.events.subscribe(listener)
    }

    /// Remove a previously registered listener.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = crate::lock(&self.shared.state);
        f.debug_struct("TaskScheduler")
            .field("concurrency", &state.concurrency)
            .field("waiting", &state.waiting.len())
            .field("running", &state.running.len())
            .field("expired", &state.expired.len())
            .finish()
    }
}

/// Ensures a granted slot is always returned, even when the submission
/// wrapper is dropped in the middle of the user future.
struct CompletionGuard {
    shared: Arc<SchedShared>,
    id: TaskId,
    armed: bool,
}

impl CompletionGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }

    fn finish(mut self, failure: Option<Arc<anyhow::Error>>) {
        self.armed = false;
        SchedShared::complete(&self.shared, self.id, failure);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.armed {
            SchedShared::complete(&self.shared, self.id, None);
        }
    }
}

impl SchedShared {
    /// Append a waiting entry (arming its waiting timer when configured)
    /// and dispatch.
    fn submit(shared: &Arc<Self>, overrides: TaskOptions) -> (TaskId, oneshot::Receiver<WaitOutcome>) {
        let (tx, rx) = oneshot::channel();
        let (id, dispatched) = {
            let mut state = crate::lock(&shared.state);
            let id = TaskId(state.next_id);
            state.next_id += 1;
            let eff = EffectiveOptions::resolve(&shared.defaults, overrides);
            let waiting_timer = (!eff.waiting_timeout.is_zero()).then(|| {
                let weak = Arc::downgrade(shared);
                TimerHandle::schedule(eff.waiting_timeout, move || {
                    if let Some(shared) = weak.upgrade() {
                        SchedShared::on_waiting_timeout(&shared, id);
                    }
                })
            });
            log::trace!("task {id} queued");
            state.waiting.push(WaitingEntry {
                id,
                eff,
                tx,
                waiting_timer,
            });
            let dispatched = Self::dispatch_locked(shared, &mut state);
            (id, dispatched)
        };
        Self::perform(shared, dispatched);
        (id, rx)
    }

    /// Promote waiters while a slot is free, skipping (and discarding)
    /// entries whose effective signal is cancelled.
    ///
    /// Iterative on purpose: a long run of pre-aborted waiters must not
    /// grow the stack.
    fn dispatch_locked(shared: &Arc<Self>, state: &mut SchedState) -> Vec<Dispatched> {
        let mut out = Vec::new();
        while state.running.len() < state.concurrency {
            let Some(next) = state.waiting.pop_next() else {
                break;
            };
            let WaitingEntry {
                id,
                eff,
                tx,
                waiting_timer,
            } = next;
            drop(waiting_timer);

            if eff.aborted() {
                out.push(Dispatched::Discarded {
                    entry: TaskRef {
                        id,
                        tag: eff.tag.clone(),
                        discard_reason: Some(DiscardReason::AbortSignal),
                        release_reason: None,
                    },
                    reason: DiscardReason::AbortSignal,
                    tx,
                });
                continue;
            }

            let release_timer = (!eff.release_timeout.is_zero()).then(|| {
                let weak = Arc::downgrade(shared);
                TimerHandle::schedule(eff.release_timeout, move || {
                    if let Some(shared) = weak.upgrade() {
                        SchedShared::on_release_timeout(&shared, id);
                    }
                })
            });
            let entry = TaskRef {
                id,
                tag: eff.tag.clone(),
                discard_reason: None,
                release_reason: None,
            };
            state.running.insert(id, RunningEntry { eff, release_timer });
            out.push(Dispatched::Started { entry, tx });
        }
        out
    }

    /// Carry out promotions and discards decided under the lock. Promoted
    /// entries whose submission future has vanished return their slot,
    /// which may admit further waiters — processed iteratively.
    fn perform(shared: &Arc<Self>, dispatched: Vec<Dispatched>) {
        let mut pending: VecDeque<Dispatched> = dispatched.into();
        while let Some(next) = pending.pop_front() {
            match next {
                Dispatched::Started { entry, tx } => {
                    // A submitter that vanished while queued gets no events
                    // at all: its slot is recycled before anything
                    // observable happened.
                    if tx.is_closed() {
                        let more = {
                            let mut state = crate::lock(&shared.state);
                            if state.running.remove(&entry.id).is_some() {
                                Self::dispatch_locked(shared, &mut state)
                            } else {
                                Vec::new()
                            }
                        };
                        pending.extend(more);
                        continue;
                    }
                    log::trace!("{entry} started");
                    shared.events.emit(&SchedulerEvent::TaskStarted(entry.clone()));
                    if tx.send(WaitOutcome::Granted).is_err() {
                        // Lost a race with a concurrently dropped
                        // submitter after `TaskStarted` went out; close the
                        // entry so it still gets its terminal event.
                        Self::complete(shared, entry.id, None);
                    }
                }
                Dispatched::Discarded { entry, reason, tx } => {
                    log::debug!("{entry} discarded: {reason}");
                    shared.events.emit(&SchedulerEvent::TaskDiscarded(entry));
                    let _ = tx.send(WaitOutcome::Discarded(reason));
                }
            }
        }
    }

    /// Waiting-timer callback. Idempotent with respect to dispatch: if the
    /// entry was already promoted (or discarded), the fire is ignored.
    fn on_waiting_timeout(shared: &Arc<Self>, id: TaskId) {
        let removed = {
            let mut state = crate::lock(&shared.state);
            state.waiting.remove_by(|entry| entry.id == id)
        };
        let Some(entry) = removed else {
            return;
        };
        let WaitingEntry { eff, tx, .. } = entry;
        let entry = TaskRef {
            id,
            tag: eff.tag.clone(),
            discard_reason: Some(DiscardReason::TimeoutReached),
            release_reason: None,
        };
        log::debug!("{entry} discarded: waiting timeout reached");
        shared.events.emit(&SchedulerEvent::TaskDiscarded(entry.clone()));
        if let Some(handler) = &eff.waiting_timeout_handler {
            if let Err(error) = handler(&entry) {
                shared.events.emit(&SchedulerEvent::Error(
                    entry.clone(),
                    EventError::new(EventErrorCode::WaitingTimeoutHandlerFailure, error),
                ));
            }
        }
        let _ = tx.send(WaitOutcome::Discarded(DiscardReason::TimeoutReached));
    }

    /// Release-timer callback: the slot is freed (and the next waiter
    /// dispatched) *before* the handler runs, so the handler already
    /// observes `running_tasks()` without this entry.
    fn on_release_timeout(shared: &Arc<Self>, id: TaskId) {
        let (entry, handler, dispatched) = {
            let mut state = crate::lock(&shared.state);
            let Some(running) = state.running.remove(&id) else {
                // Finished or force-released in the meantime.
                return;
            };
            let entry = TaskRef {
                id,
                tag: running.eff.tag.clone(),
                discard_reason: None,
                release_reason: Some(ReleaseBeforeFinishReason::TimeoutReached),
            };
            let handler = running.eff.release_timeout_handler.clone();
            state.expired.insert(
                id,
                ExpiredEntry {
                    eff: running.eff,
                    reason: ReleaseBeforeFinishReason::TimeoutReached,
                },
            );
            let dispatched = Self::dispatch_locked(shared, &mut state);
            (entry, handler, dispatched)
        };
        log::debug!("{entry} released before finishing: release timeout reached");
        shared
            .events
            .emit(&SchedulerEvent::TaskReleasedBeforeFinished(entry.clone()));
        if let Some(handler) = handler {
            if let Err(error) = handler(&entry) {
                shared.events.emit(&SchedulerEvent::Error(
                    entry.clone(),
                    EventError::new(EventErrorCode::ReleaseTimeoutHandlerFailure, error),
                ));
            }
        }
        Self::perform(shared, dispatched);
    }

    /// The user future returned. Closes out a running or expired entry;
    /// stale ids (already closed by a dropped wrapper) are ignored.
    fn complete(shared: &Arc<Self>, id: TaskId, failure: Option<Arc<anyhow::Error>>) {
        let (entry, error_handler, dispatched) = {
            let mut state = crate::lock(&shared.state);
            if let Some(running) = state.running.remove(&id) {
                let entry = TaskRef {
                    id,
                    tag: running.eff.tag.clone(),
                    discard_reason: None,
                    release_reason: None,
                };
                let handler = running.eff.error_handler.clone();
                let dispatched = Self::dispatch_locked(shared, &mut state);
                (entry, handler, dispatched)
            } else if let Some(expired) = state.expired.remove(&id) {
                let entry = TaskRef {
                    id,
                    tag: expired.eff.tag.clone(),
                    discard_reason: None,
                    release_reason: Some(expired.reason),
                };
                // The slot was already returned when the entry expired.
                (entry, expired.eff.error_handler.clone(), Vec::new())
            } else {
                return;
            }
        };
        if let Some(error) = failure {
            log::debug!("{entry} failed: {error:#}");
            shared.events.emit(&SchedulerEvent::TaskFailure(
                entry.clone(),
                Arc::clone(&error),
            ));
            if let Some(handler) = error_handler {
                if let Err(handler_error) = handler(&entry, &error) {
                    shared.events.emit(&SchedulerEvent::Error(
                        entry.clone(),
                        EventError::new(EventErrorCode::ErrorHandlerFailure, handler_error),
                    ));
                }
            }
        }
        log::trace!("{entry} finished");
        shared.events.emit(&SchedulerEvent::TaskFinished(entry));
        Self::perform(shared, dispatched);
    }
}
