use rustsfx_core::{DetectorLayout, RunState};
use rustsfx_io::{RawFrameWriter, StatusFile};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const LAYOUT: DetectorLayout = DetectorLayout::new(1, 4, 4);

fn write_input(dir: &Path) -> PathBuf {
    let path = dir.join("run.raw");
    let mut writer = RawFrameWriter::create(&path, LAYOUT, 0, 2, 7, &[1.0]).unwrap();
    for _ in 0..3 {
        writer.write_frame(9_000.0, &[1.0; 16]).unwrap();
    }
    writer.finish().unwrap();
    path
}

fn process(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_rustsfx"))
        .arg("process")
        .args(args)
        .output()
        .unwrap()
}

fn status_state(out: &Path) -> RunState {
    StatusFile::new(out.join("status.txt")).read().unwrap().state
}

#[test]
fn test_unknown_hitfinder_writes_error_status() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path());
    let out = dir.path().join("out");
    let output = process(&[
        input.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
        "--hitfinder",
        "5",
    ]);
    assert!(!output.status.success());
    assert_eq!(status_state(&out), RunState::Error("Config".to_string()));
}

#[test]
fn test_missing_calibration_writes_error_status() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path());
    let config = dir.path().join("config.json");
    fs::write(&config, r#"{"photon":{"mode":"significance"}}"#).unwrap();
    let out = dir.path().join("out");
    let output = process(&[
        input.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
        "--config",
        config.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    assert_eq!(status_state(&out), RunState::Error("Config".to_string()));
}

#[test]
fn test_unreadable_input_writes_error_status() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let missing = dir.path().join("missing.raw");
    let output = process(&[missing.to_str().unwrap(), "-o", out.to_str().unwrap()]);
    assert!(!output.status.success());
    assert_eq!(status_state(&out), RunState::Error("Input".to_string()));
}

#[test]
fn test_successful_run_finishes() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path());
    let out = dir.path().join("out");
    let output = process(&[input.to_str().unwrap(), "-o", out.to_str().unwrap()]);
    assert!(output.status.success());
    assert_eq!(status_state(&out), RunState::Finished);
}
