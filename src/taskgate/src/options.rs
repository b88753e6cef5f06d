//! Controller configuration and per-task overrides.
//!
//! Configuration never fails: constructors accept whatever they are given
//! and coerce invalid values to defaults (construction) or ignore them
//! (live changes). Controllers must never refuse to start over an option
//! mistake.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::scheduler::TaskRef;
use crate::wait::QueueOrder;

/// The concurrency limit used when none (or an invalid one) is configured.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// A handler invoked with the affected task entry.
///
/// Returning `Err` is the handler-failure plane: the failure is emitted on
/// the controller's `Error` event and goes no further.
pub type TaskHook = Arc<dyn Fn(&TaskRef) -> anyhow::Result<()> + Send + Sync>;

/// A handler invoked with a failed task entry and the error it returned.
pub type TaskFailureHook = Arc<dyn Fn(&TaskRef, &anyhow::Error) -> anyhow::Result<()> + Send + Sync>;

/// A handler invoked when a gate permit's release timer fires.
pub type GateHook = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Coerce a dynamically supplied concurrency value to a usable limit.
///
/// Non-finite, non-positive, and otherwise unusable values fall back to
/// [`DEFAULT_CONCURRENCY`]; fractional values round to the nearest integer
/// with ties going up.
pub(crate) fn sanitize_concurrency(raw: f64) -> usize {
    if !raw.is_finite() || raw <= 0.0 {
        return DEFAULT_CONCURRENCY;
    }
    let rounded = raw.round();
    if rounded < 1.0 {
        DEFAULT_CONCURRENCY
    } else {
        rounded as usize
    }
}

/// Validate a live concurrency-limit change. Unlike construction, a live
/// change with an unusable value is ignored rather than coerced.
pub(crate) fn sanitize_limit_change(raw: f64) -> Option<usize> {
    if raw.is_finite() && raw >= 1.0 && raw.fract() == 0.0 {
        Some(raw as usize)
    } else {
        None
    }
}

/// Configuration for a [`Gate`](crate::Gate).
#[derive(Clone, Default)]
pub struct GateOptions {
    pub(crate) concurrency: Option<usize>,
    pub(crate) queue_order: QueueOrder,
    pub(crate) release_timeout: Duration,
    pub(crate) release_timeout_handler: Option<GateHook>,
}

impl GateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of permits that may be held concurrently. Accepts a dynamic
    /// number (config sources commonly hand these through as JSON values);
    /// see [`DEFAULT_CONCURRENCY`] for the fallback rules.
    pub fn concurrency(mut self, limit: f64) -> Self {
        self.concurrency = Some(sanitize_concurrency(limit));
        self
    }

    /// Promotion order for queued acquirers. Defaults to FIFO.
    pub fn queue_order(mut self, order: QueueOrder) -> Self {
        self.queue_order = order;
        self
    }

    /// Upper bound on how long a permit may be held. Zero (the default)
    /// disables the bound.
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// Called when a permit's release timer fires, before the permit is
    /// force-released. A failure here never prevents the release.
    pub fn release_timeout_handler(
        mut self,
        handler: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.release_timeout_handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY)
    }
}

/// Configuration for a [`TaskScheduler`](crate::TaskScheduler).
///
/// A superset of [`GateOptions`]: the scheduler adds a bound on the waiting
/// phase, an error handler for failed tasks, and an abort signal checked at
/// dispatch time.
#[derive(Clone, Default)]
pub struct SchedulerOptions {
    pub(crate) concurrency: Option<usize>,
    pub(crate) queue_order: QueueOrder,
    pub(crate) waiting_timeout: Duration,
    pub(crate) waiting_timeout_handler: Option<TaskHook>,
    pub(crate) release_timeout: Duration,
    pub(crate) release_timeout_handler: Option<TaskHook>,
    pub(crate) error_handler: Option<TaskFailureHook>,
    pub(crate) signal: Option<CancellationToken>,
}

impl SchedulerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks that may run concurrently. Coercion rules as for
    /// [`GateOptions::concurrency`].
    pub fn concurrency(mut self, limit: f64) -> Self {
        self.concurrency = Some(sanitize_concurrency(limit));
        self
    }

    /// Promotion order for queued tasks. Defaults to FIFO.
    pub fn queue_order(mut self, order: QueueOrder) -> Self {
        self.queue_order = order;
        self
    }

    /// Upper bound on how long a task may stay queued before it is
    /// discarded. Zero (the default) disables the bound.
    pub fn waiting_timeout(mut self, timeout: Duration) -> Self {
        self.waiting_timeout = timeout;
        self
    }

    /// Called with the discarded entry when a waiting timer fires.
    pub fn waiting_timeout_handler(
        mut self,
        handler: impl Fn(&TaskRef) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.waiting_timeout_handler = Some(Arc::new(handler));
        self
    }

    /// Upper bound on how long a task may hold its admission slot. When
    /// the timer fires the slot is returned but the task's future keeps
    /// running. Zero (the default) disables the bound.
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// Called with the affected entry after a release timer fires (the
    /// slot is already free by then).
    pub fn release_timeout_handler(
        mut self,
        handler: impl Fn(&TaskRef) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.release_timeout_handler = Some(Arc::new(handler));
        self
    }

    /// Called with the entry and the error whenever a task fails.
    pub fn error_handler(
        mut self,
        handler: impl Fn(&TaskRef, &anyhow::Error) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Abort signal consulted at dispatch time. A queued task whose
    /// effective signal is cancelled is discarded instead of started;
    /// running tasks are unaffected.
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY)
    }
}

/// Per-submission overrides.
///
/// Any field set here replaces the controller-wide default for that task
/// only. The overrides are snapshotted at submission; mutating the caller's
/// copy afterwards has no effect on a task already submitted.
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub(crate) tag: Option<Arc<str>>,
    pub(crate) waiting_timeout: Option<Duration>,
    pub(crate) waiting_timeout_handler: Option<TaskHook>,
    pub(crate) release_timeout: Option<Duration>,
    pub(crate) release_timeout_handler: Option<TaskHook>,
    pub(crate) error_handler: Option<TaskFailureHook>,
    pub(crate) signal: Option<CancellationToken>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label the task in events and log lines.
    pub fn tag(mut self, tag: impl Into<Arc<str>>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn waiting_timeout(mut self, timeout: Duration) -> Self {
        self.waiting_timeout = Some(timeout);
        self
    }

    pub fn waiting_timeout_handler(
        mut self,
        handler: impl Fn(&TaskRef) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.waiting_timeout_handler = Some(Arc::new(handler));
        self
    }

    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = Some(timeout);
        self
    }

    pub fn release_timeout_handler(
        mut self,
        handler: impl Fn(&TaskRef) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.release_timeout_handler = Some(Arc::new(handler));
        self
    }

    pub fn error_handler(
        mut self,
        handler: impl Fn(&TaskRef, &anyhow::Error) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}
