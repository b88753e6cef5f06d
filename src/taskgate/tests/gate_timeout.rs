//! Gate release timeouts.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{watch_gate, Recorder};
use taskgate::{Gate, GateOptions};

/// A permit held past the release timeout is taken back.
///
/// 1. (0 ms) a permit is acquired; its release timer is armed.
/// 2. (50 ms) the timer fires: the handler runs first, then the permit is
///    released with `timeout_reached = true` and the gate is available
///    again.
/// 3. The stale permit's later release is a no-op.
#[tokio::test(start_paused = true)]
async fn release_timeout_reclaims_held_permit() {
    common::init_logging();
    let recorder = Recorder::new();
    let gate = Gate::with_options(
        GateOptions::new()
            .release_timeout(Duration::from_millis(50))
            .release_timeout_handler({
                let recorder = recorder.clone();
                move || {
                    recorder.record("handler");
                    Ok(())
                }
            }),
    );
    gate.subscribe({
        let recorder = recorder.clone();
        move |event| {
            if let taskgate::GateEvent::Released {
                timeout_reached, ..
            } = event
            {
                recorder.record(format!("released:{timeout_reached}"));
            }
        }
    });

    let permit = gate.acquire().await;
    assert!(!gate.is_available());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gate.is_available());
    // The handler ran before the permit was taken back.
    assert_eq!(recorder.entries(), ["handler", "released:true"]);

    permit.release();
    assert_eq!(recorder.entries(), ["handler", "released:true"]);
}

/// The reclaimed slot goes to the next waiter.
#[tokio::test(start_paused = true)]
async fn release_timeout_promotes_waiter() {
    let gate =
        Gate::with_options(GateOptions::new().release_timeout(Duration::from_millis(20)));
    let recorder = Recorder::new();

    let _held = gate.acquire().await;
    let waiter = tokio::spawn({
        let gate = gate.clone();
        let recorder = recorder.clone();
        async move {
            let _permit = gate.acquire().await;
            recorder.record("promoted");
        }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(recorder.entries().is_empty());

    tokio::time::sleep(Duration::from_millis(30)).await;
    waiter.await.unwrap();
    assert_eq!(recorder.entries(), ["promoted"]);
}

/// A permit released in time never sees its timer fire.
#[tokio::test(start_paused = true)]
async fn timely_release_cancels_the_timer() {
    let fired = Arc::new(AtomicUsize::new(0));
    let gate = Gate::with_options(
        GateOptions::new()
            .release_timeout(Duration::from_millis(50))
            .release_timeout_handler({
                let fired = Arc::clone(&fired);
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
    );
    let events = watch_gate(&gate);

    gate.acquire().await.release();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(events.count_of("released:0:false"), 1);
    assert_eq!(events.count_of("released:0:true"), 0);
}

/// A failing handler is reported on the `error` event and never blocks
/// the release itself.
#[tokio::test(start_paused = true)]
async fn handler_failure_does_not_prevent_release() {
    let gate = Gate::with_options(
        GateOptions::new()
            .release_timeout(Duration::from_millis(20))
            .release_timeout_handler(|| Err(anyhow::anyhow!("handler exploded"))),
    );
    let events = watch_gate(&gate);

    let _permit = gate.acquire().await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(gate.is_available());
    assert_eq!(events.count_of("error:release-timeout-handler-failure"), 1);
    assert_eq!(events.count_of("released:0:true"), 1);
}
