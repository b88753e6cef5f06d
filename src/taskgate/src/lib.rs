//! An in-process asynchronous task scheduler and its underlying counting
//! lock.
//!
//! Three components, leaves first:
//!
//! - [`Gate`] — a counting lock handing out up to `concurrency` permits,
//!   queueing the rest under a FIFO or LIFO discipline, with an optional
//!   bound on how long a permit may be held.
//! - [`TaskScheduler`] — admission control for task futures on top of the
//!   same slot accounting: waiting and running timeouts, forced release,
//!   abort signals, lifecycle events, and live reconfiguration.
//! - [`MultiStepGate`] — a fixed-length tuple of independent gates so each
//!   stage of a pipeline gets its own concurrency cap.
//!
//! All controllers are cheap to clone (handles to shared state), require a
//! tokio runtime context, and never fail to construct — invalid
//! configuration coerces to defaults instead.
//!
//! ```
//! use taskgate::{SchedulerOptions, TaskScheduler};
//!
//! # async fn example() {
//! let scheduler = TaskScheduler::with_options(SchedulerOptions::new().concurrency(4.0));
//! let settled = scheduler.run(|| async { Ok::<_, anyhow::Error>(2 + 2) }).await;
//! assert_eq!(settled.fulfilled(), Some(4));
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::sync::{Mutex, MutexGuard, PoisonError};

mod events;
mod gate;
mod multistep;
mod options;
mod scheduler;
mod timeout;
mod wait;

pub use events::{EventError, EventErrorCode, SubscriptionId};
pub use gate::{Gate, GateEvent, GatePermit, PermitId};
pub use multistep::{MultiStepGate, StepGates};
pub use options::{
    GateHook, GateOptions, SchedulerOptions, TaskFailureHook, TaskHook, TaskOptions,
    DEFAULT_CONCURRENCY,
};
pub use scheduler::{
    DiscardReason, Rejection, ReleaseBeforeFinishReason, SchedulerCounters, SchedulerEvent,
    Settled, TaskId, TaskRef, TaskRequest, TaskScheduler, TryRun,
};
pub use wait::QueueOrder;

// The abort-signal type consulted at dispatch time.
pub use tokio_util::sync::CancellationToken;

/// Lock a mutex, recovering from poisoning. Controller state stays
/// consistent across a panicking listener because every transition is
/// completed before the lock is dropped.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
