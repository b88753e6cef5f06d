//! Start order under each queue discipline and concurrency limit.
//!
//! Every test submits the same batch through `run_many`: a recording task
//! sleeps for its virtual duration and then appends its label, so the
//! recorded sequence is the completion order.

mod common;

use common::{sleeper, Recorder};
use taskgate::{QueueOrder, SchedulerOptions, TaskRequest, TaskScheduler};

const BATCH: [(&str, u64); 3] = [("A", 120), ("B", 60), ("C", 10)];

async fn run_batch(scheduler: &TaskScheduler, recorder: &Recorder) {
    let results = scheduler
        .run_many(
            BATCH
                .iter()
                .map(|&(label, ms)| TaskRequest::new(sleeper(recorder, label, ms))),
        )
        .await;
    assert!(results.iter().all(|settled| settled.is_fulfilled()));
}

/// FIFO, concurrency 1.
///
/// 1. (0 ms) `A` starts; `B` and `C` queue behind it.
/// 2. (120 ms) `A` finishes; FIFO promotes `B`.
/// 3. (180 ms) `B` finishes; `C` starts.
/// 4. (190 ms) `C` finishes.
#[tokio::test(start_paused = true)]
async fn fifo_default_concurrency_one() {
    common::init_logging();
    let scheduler = TaskScheduler::new();
    let recorder = Recorder::new();
    run_batch(&scheduler, &recorder).await;
    assert_eq!(recorder.entries(), ["A", "B", "C"]);
}

/// LIFO, concurrency 1.
///
/// `A` is admitted immediately and never queues, so the discipline only
/// affects `B` and `C`: when `A` finishes, the *last* waiter (`C`) is
/// promoted first.
#[tokio::test(start_paused = true)]
async fn lifo_concurrency_one() {
    let scheduler =
        TaskScheduler::with_options(SchedulerOptions::new().queue_order(QueueOrder::Lifo));
    let recorder = Recorder::new();
    run_batch(&scheduler, &recorder).await;
    assert_eq!(recorder.entries(), ["A", "C", "B"]);
}

/// Concurrency 2.
///
/// 1. (0 ms) `A` and `B` start together; `C` queues.
/// 2. (60 ms) `B` finishes; `C` starts.
/// 3. (70 ms) `C` finishes.
/// 4. (120 ms) `A` finishes.
#[tokio::test(start_paused = true)]
async fn concurrency_two_interleaves() {
    let scheduler = TaskScheduler::with_options(SchedulerOptions::new().concurrency(2.0));
    let recorder = Recorder::new();
    run_batch(&scheduler, &recorder).await;
    assert_eq!(recorder.entries(), ["B", "C", "A"]);
}

/// With enough slots nothing queues, so LIFO has nothing to reorder and
/// completion order is by duration alone.
#[tokio::test(start_paused = true)]
async fn lifo_affects_only_queued_tasks() {
    let scheduler = TaskScheduler::with_options(
        SchedulerOptions::new()
            .concurrency(3.0)
            .queue_order(QueueOrder::Lifo),
    );
    let recorder = Recorder::new();
    run_batch(&scheduler, &recorder).await;
    assert_eq!(recorder.entries(), ["C", "B", "A"]);
}

/// Submission order equals result order regardless of execution order.
#[tokio::test(start_paused = true)]
async fn run_many_results_follow_submission_order() {
    let scheduler = TaskScheduler::with_options(SchedulerOptions::new().concurrency(2.0));
    let results: Vec<_> = scheduler
        .run_many([("A", 120u64), ("B", 60), ("C", 10)].map(|(label, ms)| {
            TaskRequest::new(move || async move {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                Ok::<_, anyhow::Error>(label)
            })
        }))
        .await;
    let labels: Vec<_> = results
        .into_iter()
        .map(|settled| settled.fulfilled().unwrap())
        .collect();
    assert_eq!(labels, ["A", "B", "C"]);
}
