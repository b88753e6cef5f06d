//! Multi-step coordination: one gate per pipeline stage.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskgate::MultiStepGate;

/// Tracks the peak number of concurrent holders of a section.
#[derive(Clone, Default)]
struct PeakCounter {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl PeakCounter {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Each stage honors its own cap while the callable walks the steps in
/// order.
#[tokio::test(start_paused = true)]
async fn each_step_honors_its_own_cap() {
    common::init_logging();
    let pipeline = MultiStepGate::new(&[2.0, 1.0]);
    assert_eq!(pipeline.step_count(), 2);

    let stage0 = PeakCounter::default();
    let stage1 = PeakCounter::default();

    let results = pipeline
        .run_for_each_args(0..6u32, {
            let stage0 = stage0.clone();
            let stage1 = stage1.clone();
            move |steps, n| {
                let stage0 = stage0.clone();
                let stage1 = stage1.clone();
                async move {
                    let permit = steps[0].acquire().await;
                    stage0.enter();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    stage0.leave();
                    permit.release();

                    let permit = steps[1].acquire().await;
                    stage1.enter();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    stage1.leave();
                    permit.release();
                    n
                }
            }
        })
        .await;

    assert_eq!(results, (0..6).collect::<Vec<_>>());
    assert!(stage0.peak() <= 2, "stage 0 peak was {}", stage0.peak());
    assert_eq!(stage1.peak(), 1);
}

/// The coordinator imposes no step order; the callable may acquire the
/// gates in any order it likes.
#[tokio::test(start_paused = true)]
async fn step_order_is_up_to_the_callable() {
    let pipeline = MultiStepGate::new(&[1.0, 1.0]);
    let value = pipeline
        .run(|steps| async move {
            let second = steps[1].acquire().await;
            let first = steps[0].acquire().await;
            drop(first);
            drop(second);
            "backwards"
        })
        .await;
    assert_eq!(value, "backwards");
}

#[tokio::test(start_paused = true)]
async fn run_many_keeps_submission_order() {
    let pipeline = MultiStepGate::new(&[1.0]);
    let results = pipeline
        .run_many([3u32, 1, 2].map(|n| {
            move |steps: taskgate::StepGates| async move {
                let _permit = steps[0].acquire().await;
                tokio::time::sleep(Duration::from_millis(u64::from(n))).await;
                n * 10
            }
        }))
        .await;
    assert_eq!(results, [30, 10, 20]);
}

/// `release_all` reclaims every step's permits at once.
#[tokio::test(start_paused = true)]
async fn release_all_frees_every_step() {
    let pipeline = MultiStepGate::new(&[1.0, 1.0]);
    let step0 = pipeline.step(0).unwrap().clone();
    let step1 = pipeline.step(1).unwrap().clone();

    let first = step0.acquire().await;
    let second = step1.acquire().await;
    assert!(pipeline.is_step_lock_limit_reached(0));
    assert!(pipeline.is_step_lock_limit_reached(1));

    pipeline.release_all();
    assert!(!pipeline.is_step_lock_limit_reached(0));
    assert!(!pipeline.is_step_lock_limit_reached(1));

    // Stale permits from before the forced release are ignored.
    first.release();
    second.release();
    assert!(step0.is_available());
    assert!(step1.is_available());
}

/// Out-of-range step indexes report `false` rather than failing.
#[tokio::test(start_paused = true)]
async fn limit_check_is_false_out_of_range() {
    let pipeline = MultiStepGate::new(&[1.0]);
    assert!(!pipeline.is_step_lock_limit_reached(0));
    assert!(!pipeline.is_step_lock_limit_reached(1));
    assert!(!pipeline.is_step_lock_limit_reached(usize::MAX));

    let _permit = pipeline.step(0).unwrap().acquire().await;
    assert!(pipeline.is_step_lock_limit_reached(0));
    assert!(!pipeline.is_step_lock_limit_reached(1));
}
