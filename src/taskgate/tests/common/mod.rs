#![allow(dead_code)] // each test binary uses a subset of these helpers

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use taskgate::{Gate, GateEvent, SchedulerEvent, TaskRef, TaskScheduler};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Shared recording sink, the test-side view of execution order and event
/// sequences.
#[derive(Clone, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count_of(&self, entry: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == entry)
            .count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count_of(entry) > 0
    }
}

fn name(entry: &TaskRef) -> String {
    match entry.tag() {
        Some(tag) => tag.to_owned(),
        None => entry.id().to_string(),
    }
}

pub fn summarize(event: &SchedulerEvent) -> String {
    match event {
        SchedulerEvent::TaskStarted(entry) => format!("started:{}", name(entry)),
        SchedulerEvent::TaskFinished(entry) => format!("finished:{}", name(entry)),
        SchedulerEvent::TaskFailure(entry, _) => format!("failure:{}", name(entry)),
        SchedulerEvent::TaskReleasedBeforeFinished(entry) => format!(
            "released-before-finished:{}:{}",
            name(entry),
            entry.release_reason().expect("reason must be set")
        ),
        SchedulerEvent::TaskDiscarded(entry) => format!(
            "discarded:{}:{}",
            name(entry),
            entry.discard_reason().expect("reason must be set")
        ),
        SchedulerEvent::Error(entry, error) => {
            format!("error:{}:{}", name(entry), error.code())
        }
        _ => "other".to_owned(),
    }
}

/// Subscribe a recorder to every scheduler event.
pub fn watch_scheduler(scheduler: &TaskScheduler) -> Recorder {
    let recorder = Recorder::new();
    scheduler.subscribe({
        let recorder = recorder.clone();
        move |event| recorder.record(summarize(event))
    });
    recorder
}

/// Subscribe a recorder to every gate event.
pub fn watch_gate(gate: &Gate) -> Recorder {
    let recorder = Recorder::new();
    gate.subscribe({
        let recorder = recorder.clone();
        move |event| {
            recorder.record(match event {
                GateEvent::Acquired { permit } => format!("acquired:{permit}"),
                GateEvent::Released {
                    permit,
                    timeout_reached,
                } => format!("released:{permit}:{timeout_reached}"),
                GateEvent::Error(error) => format!("error:{}", error.code()),
                _ => "other".to_owned(),
            })
        }
    });
    recorder
}

/// A task that sleeps for `ms` of virtual time, then appends its label.
pub fn sleeper(
    recorder: &Recorder,
    label: &'static str,
    ms: u64,
) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<()>> {
    let recorder = recorder.clone();
    move || {
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            recorder.record(label);
            Ok(())
        }
        .boxed()
    }
}
