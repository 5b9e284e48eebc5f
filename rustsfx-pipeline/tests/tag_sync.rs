#![allow(clippy::cast_precision_loss, clippy::uninlined_format_args)]
use rustsfx_core::{DetectorLayout, Frame, PipelineConfig};
use rustsfx_pipeline::{
    Error, FrameSource, MemorySource, SyncReport, TagPlan, TagSynchronizer,
};
use std::time::Duration;

const LAYOUT: DetectorLayout = DetectorLayout::new(4, 8, 4);

fn source(tags: impl Iterator<Item = u64>) -> MemorySource {
    let frames = tags
        .map(|tag| {
            let pixels = (0..LAYOUT.len())
                .map(|i| (tag * 1000 + i as u64) as f32)
                .collect();
            Frame::from_pixels(tag, LAYOUT, pixels).unwrap()
        })
        .collect();
    MemorySource::from_frames(LAYOUT, frames).unwrap().with_run_id(7)
}

fn relaxed() -> PipelineConfig {
    PipelineConfig::default()
        .with_lateness_window(64)
        .with_retry_budget(10_000)
}

fn collect(sync: &TagSynchronizer, source: &MemorySource) -> (Vec<Frame>, SyncReport) {
    let mut frames = Vec::new();
    let report = sync
        .run(source, |frame| {
            frames.push(frame);
            Ok(())
        })
        .unwrap();
    (frames, report)
}

#[test]
fn test_frames_arrive_in_tag_order_and_intact() {
    let source = source((100..160).step_by(3));
    let plan = TagPlan::new(100, 157, 3).unwrap();
    let sync = TagSynchronizer::new(LAYOUT, plan, &relaxed());
    let (frames, report) = collect(&sync, &source);

    let tags: Vec<u64> = frames.iter().map(|f| f.tag).collect();
    assert_eq!(tags, plan.tags().collect::<Vec<_>>());
    for frame in &frames {
        let original = &source.frames()[((frame.tag - 100) / 3) as usize];
        assert_eq!(frame.pixels, original.pixels, "tag {}", frame.tag);
        assert_eq!(frame.run_id, 7);
    }
    assert_eq!(report.delivered, 20);
    assert_eq!(report.resolved(), 20);
    assert_eq!(sync.pending_len(), 0);
}

#[test]
fn test_failed_panel_never_delivered() {
    let source = source(0..30)
        .with_failing_read(2, 11)
        .with_failing_read(0, 17)
        .with_failing_read(3, 29);
    let plan = TagPlan::new(0, 29, 1).unwrap();
    let sync = TagSynchronizer::new(LAYOUT, plan, &relaxed());
    let (frames, report) = collect(&sync, &source);

    let tags: Vec<u64> = frames.iter().map(|f| f.tag).collect();
    for bad in [11, 17, 29] {
        assert!(!tags.contains(&bad), "tag {} delivered", bad);
    }
    assert!(tags.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(report.delivered, 27);
    assert_eq!(report.errored, 3);
    assert_eq!(sync.pending_len(), 0);
}

#[test]
fn test_stuck_panel_evicted_as_stale() {
    let mut source = source(0..20).with_delay(1, 5, Duration::from_millis(300));
    // Keep the primary slower than the healthy secondaries.
    for tag in 0..20 {
        source = source.with_delay(0, tag, Duration::from_millis(2));
    }
    let config = PipelineConfig::default()
        .with_lateness_window(2)
        .with_retry_budget(10_000);
    let plan = TagPlan::new(0, 19, 1).unwrap();
    let sync = TagSynchronizer::new(source.layout(), plan, &config);
    let (frames, report) = collect(&sync, &source);

    let tags: Vec<u64> = frames.iter().map(|f| f.tag).collect();
    assert_eq!(&tags[..5], &[0, 1, 2, 3, 4]);
    assert!(!tags.contains(&5));
    assert!(report.stale >= 1);
    assert!(report.late_panels >= 1);
    assert_eq!(report.resolved(), 20);
    assert_eq!(sync.pending_len(), 0);
}

#[test]
fn test_table_empty_after_run_with_gaps() {
    // Tags 6 and 7 are missing from the source entirely.
    let source = source((0..6).chain(8..12));
    let plan = TagPlan::new(0, 11, 1).unwrap();
    let sync = TagSynchronizer::new(LAYOUT, plan, &relaxed());
    let (frames, report) = collect(&sync, &source);

    assert_eq!(frames.len(), 10);
    assert_eq!(report.errored, 2);
    assert_eq!(sync.pending_len(), 0);
}

#[test]
fn test_mismatched_tag_marks_entry_failed() {
    let source = source(0..10).with_wrong_tag(2, 5, 6);
    let plan = TagPlan::new(0, 9, 1).unwrap();
    let sync = TagSynchronizer::new(LAYOUT, plan, &relaxed());
    let (frames, report) = collect(&sync, &source);

    let tags: Vec<u64> = frames.iter().map(|f| f.tag).collect();
    assert!(!tags.contains(&5));
    assert_eq!(tags.len(), 9);
    assert_eq!(report.errored, 1);
    assert_eq!(sync.pending_len(), 0);
}

#[test]
fn test_mismatched_first_tag_is_fatal() {
    let source = source(0..5).with_wrong_tag(1, 0, 1);
    let plan = TagPlan::new(0, 4, 1).unwrap();
    let sync = TagSynchronizer::new(LAYOUT, plan, &relaxed());
    let result = sync.run(&source, |_frame| Ok(()));
    assert!(matches!(result, Err(Error::FirstFrame(_))));
}

#[test]
fn test_starved_secondaries_skip_tags() {
    // The primary stalls on tag 3, so the secondaries run out of retries
    // waiting for tag 4 to be allocated.
    let source = source(0..10).with_delay(0, 3, Duration::from_millis(500));
    let config = PipelineConfig::default()
        .with_lateness_window(64)
        .with_retry_budget(20);
    let plan = TagPlan::new(0, 9, 1).unwrap();
    let sync = TagSynchronizer::new(LAYOUT, plan, &config);
    let (frames, report) = collect(&sync, &source);

    let tags: Vec<u64> = frames.iter().map(|f| f.tag).collect();
    assert_eq!(&tags[..4], &[0, 1, 2, 3]);
    assert!(!tags.contains(&4));
    assert!(report.starved >= 1);
    assert_eq!(report.delivered, tags.len() as u64);
    assert_eq!(report.resolved(), 10);
    assert_eq!(sync.pending_len(), 0);
}

#[test]
fn test_complete_frames_survive_slow_consumer() {
    // A slow consumer lets the primary run more than the lateness window
    // ahead; entries whose panels all reported are still delivered.
    let mut source = source(0..12);
    // Keep the primary slower than the secondaries.
    for tag in 0..12 {
        source = source.with_delay(0, tag, Duration::from_millis(2));
    }
    let config = PipelineConfig::default()
        .with_lateness_window(2)
        .with_retry_budget(10_000);
    let plan = TagPlan::new(0, 11, 1).unwrap();
    let sync = TagSynchronizer::new(LAYOUT, plan, &config);
    let mut tags = Vec::new();
    let report = sync
        .run(&source, |frame| {
            std::thread::sleep(Duration::from_millis(5));
            tags.push(frame.tag);
            Ok(())
        })
        .unwrap();

    assert_eq!(tags, (0..12).collect::<Vec<u64>>());
    assert_eq!(report.delivered, 12);
    assert_eq!(report.stale, 0);
    assert_eq!(sync.pending_len(), 0);
}
