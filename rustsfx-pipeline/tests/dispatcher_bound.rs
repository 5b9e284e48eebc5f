#![allow(clippy::cast_possible_truncation)]
use proptest::prelude::*;
use rustsfx_core::{DetectorLayout, Frame};
use rustsfx_pipeline::{EventDispatcher, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Concurrency {
    running: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

fn run_pool(max_in_flight: usize, n_frames: u64, work_us: u64) -> (Arc<Concurrency>, usize) {
    let seen = Arc::new(Concurrency::default());
    let tracker = Arc::clone(&seen);
    let dispatcher = EventDispatcher::new(
        move |_frame: Frame, _seq: u64| -> Result<()> {
            let now = tracker.running.fetch_add(1, Ordering::SeqCst) + 1;
            tracker.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_micros(work_us));
            tracker.running.fetch_sub(1, Ordering::SeqCst);
            tracker.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        max_in_flight,
    );

    let layout = DetectorLayout::new(1, 1, 1);
    for tag in 0..n_frames {
        dispatcher.submit(Frame::new(tag, layout)).unwrap();
        assert!(dispatcher.in_flight() <= max_in_flight);
    }
    dispatcher.drain();
    (seen, dispatcher.stats().peak_in_flight)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_never_more_than_k_in_flight(
        k in 1usize..6,
        n_frames in 1u64..40,
        work_us in 0u64..400,
    ) {
        let (seen, peak) = run_pool(k, n_frames, work_us);
        prop_assert!(seen.peak.load(Ordering::SeqCst) <= k);
        prop_assert!(peak <= k);
        prop_assert_eq!(seen.done.load(Ordering::SeqCst), n_frames as usize);
        prop_assert_eq!(seen.running.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn test_pool_saturates_under_load() {
    let (seen, peak) = run_pool(3, 30, 2_000);
    assert_eq!(peak, 3);
    assert!(seen.peak.load(Ordering::SeqCst) <= 3);
}
