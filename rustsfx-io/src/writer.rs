//! File writers: raw frame containers, status file, event log and the
//! directory sink built from them.

use crate::reader::RawFrameHeader;
use crate::{Error, Result};
use log::{debug, info};
use parking_lot::Mutex;
use rustsfx_core::{DetectorLayout, EventRecord, EventSummary, PowderClass, RunStatus, RunSummary};
use rustsfx_pipeline::Sink;
use serde_json::json;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Column header of the event log.
pub const EVENT_LOG_HEADER: &str =
    "tag,n_peaks,peak_npix,peak_total,resolution,resolution_A,density,total_photons,hit";

/// Writer for raw frame containers.
///
/// The frame count in the header is patched in by [`RawFrameWriter::finish`].
pub struct RawFrameWriter {
    writer: BufWriter<File>,
    header: RawFrameHeader,
}

impl RawFrameWriter {
    /// Creates a container and writes its header.
    ///
    /// # Errors
    /// Returns `CoreError` unless there is one gain per panel, or an I/O
    /// error.
    pub fn create<P: AsRef<Path>>(
        path: P,
        layout: DetectorLayout,
        first_tag: u64,
        stride: u64,
        run_id: u32,
        gains: &[f32],
    ) -> Result<Self> {
        if gains.len() != layout.n_panels {
            return Err(rustsfx_core::Error::DimensionMismatch {
                what: "panel gains",
                expected: layout.n_panels,
                actual: gains.len(),
            }
            .into());
        }
        if stride == 0 {
            return Err(Error::InvalidFormat("tag stride is zero".to_string()));
        }
        let header = RawFrameHeader {
            layout,
            run_id,
            n_frames: 0,
            first_tag,
            stride,
        };
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&header.encode())?;
        for gain in gains {
            writer.write_all(&gain.to_le_bytes())?;
        }
        Ok(Self { writer, header })
    }

    /// Appends one frame record.
    ///
    /// # Errors
    /// Returns `CoreError` if `pixels` does not cover the layout.
    pub fn write_frame(&mut self, photon_energy_ev: f64, pixels: &[f32]) -> Result<()> {
        self.header.layout.check_len("frame pixels", pixels.len())?;
        self.writer.write_all(&photon_energy_ev.to_le_bytes())?;
        for v in pixels {
            self.writer.write_all(&v.to_le_bytes())?;
        }
        self.header.n_frames += 1;
        Ok(())
    }

    /// Flushes the frames and records their count in the header.
    ///
    /// # Errors
    /// Returns an error if the file cannot be flushed or patched.
    pub fn finish(self) -> Result<RawFrameHeader> {
        let mut file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(24))?;
        file.write_all(&self.header.n_frames.to_le_bytes())?;
        file.sync_all()?;
        Ok(self.header)
    }
}

/// Single-line run status, rewritten on every update.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the file contents with `status`.
    ///
    /// Written to a sibling file first and renamed, so readers never see a
    /// partial line.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be written.
    pub fn write(&self, status: &RunStatus) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{status}\n"))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Reads the last written status.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be read and `InvalidFormat`
    /// if it does not hold a status line.
    pub fn read(&self) -> Result<RunStatus> {
        let line = fs::read_to_string(&self.path)?;
        RunStatus::parse_line(&line)
            .ok_or_else(|| Error::InvalidFormat(format!("bad status line: {}", line.trim())))
    }
}

/// CSV log with one row per processed event.
pub struct EventLog {
    writer: BufWriter<File>,
}

impl EventLog {
    /// Creates the log and writes its header.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{EVENT_LOG_HEADER}")?;
        Ok(Self { writer })
    }

    /// Appends one event row.
    ///
    /// # Errors
    /// Returns an I/O error if the row cannot be written.
    pub fn append(&mut self, tag: u64, summary: &EventSummary) -> Result<()> {
        writeln!(
            self.writer,
            "{},{},{},{},{},{},{},{},{}",
            tag,
            summary.n_peaks,
            summary.peak_npix,
            summary.peak_total,
            summary.peak_resolution,
            summary.peak_resolution_a,
            summary.peak_density,
            summary.total_photons,
            u8::from(summary.hit)
        )?;
        Ok(())
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an I/O error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn write_f64_le(path: &Path, values: &[f64]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

fn write_i64_le(path: &Path, values: &[i64]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes a run into an output directory.
///
/// Layout:
/// - `status.txt`: the latest status line
/// - `events.csv`: one row per processed event, in completion order
/// - `powder_{hit,blank}.bin`, `powder_{hit,blank}_assembled.bin`: f64 sums
/// - `photon_map.bin`: i64 cumulative photon counts
/// - `spectrum.bin`, `spectrum_energy.bin`: run spectrum, when recorded
/// - `summary.json`: counters and shapes
pub struct FileSink {
    dir: PathBuf,
    status: Mutex<StatusFile>,
    events: Mutex<EventLog>,
}

impl FileSink {
    /// Creates `dir` if needed and opens the status file and event log.
    ///
    /// # Errors
    /// Returns an I/O error if the directory or files cannot be created.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let events = EventLog::create(dir.join("events.csv"))?;
        info!("Writing run output to {}", dir.display());
        Ok(Self {
            status: Mutex::new(StatusFile::new(dir.join("status.txt"))),
            events: Mutex::new(events),
            dir,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        self.events.lock().flush()?;

        let acc = &summary.accumulators;
        for (class, name) in [(PowderClass::Hit, "hit"), (PowderClass::Blank, "blank")] {
            let (raw, assembled, frames) = acc.powder(class);
            if frames == 0 {
                continue;
            }
            write_f64_le(&self.dir.join(format!("powder_{name}.bin")), raw)?;
            write_f64_le(
                &self.dir.join(format!("powder_{name}_assembled.bin")),
                assembled,
            )?;
        }
        write_i64_le(&self.dir.join("photon_map.bin"), &acc.photon_map)?;
        if let Some(spectrum) = &summary.spectrum {
            write_f64_le(&self.dir.join("spectrum.bin"), &spectrum.sum)?;
            write_f64_le(
                &self.dir.join("spectrum_energy.bin"),
                &spectrum.energy_scale_ev,
            )?;
        }

        let document = json!({
            "run_id": summary.run_id,
            "status": summary.status,
            "status_line": summary.status.to_string(),
            "frames": {
                "hit": acc.powder_frames[1],
                "blank": acc.powder_frames[0],
            },
            "raw_shape": [summary.raw_shape.0, summary.raw_shape.1, summary.raw_shape.2],
            "assembled_shape": [summary.assembled_shape.0, summary.assembled_shape.1],
            "spectrum": summary.spectrum.as_ref().map(|s| json!({
                "hits": s.hits,
                "peak_index": s.peak_index,
                "peak_energy_ev": s.energy_scale_ev.get(s.peak_index),
            })),
        });
        let mut writer = BufWriter::new(File::create(self.dir.join("summary.json"))?);
        serde_json::to_writer_pretty(&mut writer, &document)?;
        writeln!(writer)?;
        writer.flush()?;
        debug!("Run summary written to {}", self.dir.display());
        Ok(())
    }
}

impl Sink for FileSink {
    fn write_event(&self, tag: u64, event: &EventRecord) -> rustsfx_pipeline::Result<()> {
        self.events
            .lock()
            .append(tag, &event.summary)
            .map_err(Error::into_sink)
    }

    fn flush_status(&self, status: &RunStatus) -> rustsfx_pipeline::Result<()> {
        // One writer at a time: every update goes through the same tmp file.
        let status_file = self.status.lock();
        self.events.lock().flush().map_err(Error::into_sink)?;
        status_file.write(status).map_err(Error::into_sink)
    }

    fn write_run_summary(&self, summary: &RunSummary) -> rustsfx_pipeline::Result<()> {
        self.write_summary(summary).map_err(Error::into_sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustsfx_core::RunState;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_status_file() {
        let dir = TempDir::new().unwrap();
        let file = StatusFile::new(dir.path().join("status.txt"));
        let status = RunStatus {
            total: 10,
            processed: 5,
            hits: 2,
            state: RunState::Hitfinding,
        };
        file.write(&status).unwrap();
        let content = fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "Total=10,Processed=5,Hits=2,Status=Hitfinding\n");
        assert_eq!(file.read().unwrap(), status);
    }

    #[test]
    fn test_event_log_rows() {
        let file = NamedTempFile::new().unwrap();
        let mut log = EventLog::create(file.path()).unwrap();
        let summary = EventSummary {
            hit: true,
            n_peaks: 25,
            peak_npix: 120,
            total_photons: 42.5,
            ..EventSummary::default()
        };
        log.append(36, &summary).unwrap();
        log.flush().unwrap();

        let content = fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], EVENT_LOG_HEADER);
        assert_eq!(lines[1], "36,25,120,0,0,0,0,42.5,1");
    }

    #[test]
    fn test_raw_writer_rejects_bad_input() {
        let file = NamedTempFile::new().unwrap();
        let layout = DetectorLayout::new(2, 2, 2);
        assert!(RawFrameWriter::create(file.path(), layout, 0, 1, 0, &[1.0]).is_err());
        assert!(RawFrameWriter::create(file.path(), layout, 0, 0, 0, &[1.0, 1.0]).is_err());

        let mut writer =
            RawFrameWriter::create(file.path(), layout, 0, 1, 0, &[1.0, 1.0]).unwrap();
        assert!(writer.write_frame(7000.0, &[0.0; 7]).is_err());
        writer.write_frame(7000.0, &[0.0; 8]).unwrap();
        assert_eq!(writer.finish().unwrap().n_frames, 1);
    }

    #[test]
    fn test_concurrent_status_flushes() {
        let dir = TempDir::new().unwrap();
        let sink = FileSink::create(dir.path()).unwrap();
        std::thread::scope(|scope| {
            for worker in 0..8u64 {
                let sink = &sink;
                scope.spawn(move || {
                    for i in 0..200u64 {
                        let status = RunStatus {
                            total: 1600,
                            processed: worker * 200 + i,
                            hits: 0,
                            state: RunState::Hitfinding,
                        };
                        sink.flush_status(&status).unwrap();
                    }
                });
            }
        });

        let status = StatusFile::new(dir.path().join("status.txt")).read().unwrap();
        assert_eq!(status.total, 1600);
        assert_eq!(status.state, RunState::Hitfinding);
        assert!(!dir.path().join("status.tmp").exists());
    }
}
