//! One-shot timer handles.
//!
//! A [`TimerHandle`] is armed the moment a permit is acquired or a task
//! entry starts waiting, and cancelled when the guarded phase ends first.
//! Firing and cancellation may race; the callback side is responsible for
//! ignoring a fire that lost the race (all callers re-validate membership
//! under the state lock before acting).

use std::time::Duration;

use tokio::task::JoinHandle;

/// A cancellable one-shot timer running on the ambient tokio runtime.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Run `f` after `delay`. Requires a tokio runtime context.
    pub(crate) fn schedule(delay: Duration, f: impl FnOnce() + Send + 'static) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Self { handle }
    }

    pub(crate) fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        // Dropping the owning entry cancels the pending timer. Aborting a
        // task that already ran is a no-op.
        self.handle.abort();
    }
}
