#![allow(clippy::cast_precision_loss, clippy::uninlined_format_args)]
use rustsfx_core::{
    Calibration, DetectorGeometry, DetectorLayout, HitfinderAlgorithm, RunConfig, RunState,
};
use rustsfx_io::{FileSink, RawFrameFile, RawFrameWriter, StatusFile, EVENT_LOG_HEADER};
use rustsfx_pipeline::{Pipeline, Sink};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const LAYOUT: DetectorLayout = DetectorLayout::new(2, 8, 4);

// Twelve frames at tags 100, 102, ..; every fourth carries eight bright pixels.
fn write_run(path: &Path) {
    let mut writer = RawFrameWriter::create(path, LAYOUT, 100, 2, 321, &[1.0, 1.0]).unwrap();
    for i in 0..12 {
        let mut pixels = vec![2.0f32; LAYOUT.len()];
        if i % 4 == 0 {
            for p in 0..8 {
                pixels[p * 7] = 400.0;
            }
        }
        writer.write_frame(9_000.0, &pixels).unwrap();
    }
    writer.finish().unwrap();
}

fn config(multi_producer: bool) -> RunConfig {
    let mut config = RunConfig::default();
    config.hitfinder.algorithm = HitfinderAlgorithm::PixelCount;
    config.hitfinder.adc_threshold = 100.0;
    config.hitfinder.min_pix_count = 8;
    config.correction.gain_correction = false;
    config.pipeline.max_in_flight = 3;
    config.pipeline.tag_stride = 2;
    config.pipeline.lateness_window = 64;
    config.pipeline.retry_budget = 10_000;
    config.pipeline.multi_producer = multi_producer;
    config
}

fn run(dir: &TempDir, multi_producer: bool) -> rustsfx_pipeline::RunReport {
    let input = dir.path().join("run.raw");
    write_run(&input);
    let source = RawFrameFile::open(&input).unwrap();
    let calibration = Calibration::new(DetectorGeometry::stacked(LAYOUT, 0.1, 75e-6).unwrap());
    let pipeline = Pipeline::new(config(multi_producer), calibration).unwrap();
    let sink = Arc::new(FileSink::create(dir.path().join("out")).unwrap());
    pipeline.run(&source, sink as Arc<dyn Sink>).unwrap()
}

#[test]
fn test_file_run_writes_outputs() {
    let dir = TempDir::new().unwrap();
    let report = run(&dir, true);
    assert_eq!(report.run_id, 321);
    assert_eq!(report.counters.processed, 12);
    assert_eq!(report.counters.hits, 3);

    let out = dir.path().join("out");
    let status = StatusFile::new(out.join("status.txt")).read().unwrap();
    assert_eq!(status.state, RunState::Finished);
    assert_eq!(status.total, 12);
    assert_eq!(status.hits, 3);

    let log = fs::read_to_string(out.join("events.csv")).unwrap();
    let mut lines = log.lines();
    assert_eq!(lines.next(), Some(EVENT_LOG_HEADER));
    let mut rows: Vec<(u64, bool)> = lines
        .map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            (fields[0].parse().unwrap(), fields[8] == "1")
        })
        .collect();
    rows.sort_unstable();
    assert_eq!(rows.len(), 12);
    for (i, (tag, hit)) in rows.iter().enumerate() {
        assert_eq!(*tag, 100 + 2 * i as u64);
        assert_eq!(*hit, i % 4 == 0, "tag {}", tag);
    }

    let powder = fs::read(out.join("powder_hit.bin")).unwrap();
    assert_eq!(powder.len(), LAYOUT.len() * 8);
    let first = f64::from_le_bytes(powder[0..8].try_into().unwrap());
    assert!((first - 1200.0).abs() < 1e-9);

    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["run_id"], 321);
    assert_eq!(summary["frames"]["hit"], 3);
    assert_eq!(summary["frames"]["blank"], 9);
    assert_eq!(summary["status_line"], "Total=12,Processed=12,Hits=3,Status=Finished");
}

#[test]
fn test_sequential_file_run() {
    let dir = TempDir::new().unwrap();
    let report = run(&dir, false);
    assert_eq!(report.sync.delivered, 12);
    assert_eq!(report.counters.hits, 3);
}
