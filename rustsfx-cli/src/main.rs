//! rustsfx command-line interface.
//!
//! Runs hit finding over a raw frame container and writes the results to an
//! output directory.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use rustsfx_core::{
    Calibration, DetectorGeometry, HitfinderAlgorithm, RunConfig, RunState, RunStatus,
};
use rustsfx_io::{read_f32_map, read_mask_map, FileSink, RawFrameFile};
use rustsfx_pipeline::{MultiSink, Pipeline, Sink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    RustsfxIo(#[from] rustsfx_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] rustsfx_core::Error),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] rustsfx_pipeline::Error),

    #[cfg(not(feature = "hdf5"))]
    #[error("HDF5 output requested but rustsfx was built without the `hdf5` feature")]
    Hdf5Disabled,
}

impl CliError {
    /// Short reason written into an `Error-<reason>` status line.
    fn reason(&self) -> &'static str {
        match self {
            Self::RustsfxIo(_) => "Input",
            Self::Core(_) => "Config",
            Self::Pipeline(e) => e.reason(),
            #[cfg(not(feature = "hdf5"))]
            Self::Hdf5Disabled => "Config",
        }
    }
}

/// Real-time hit finding for serial femtosecond crystallography.
#[derive(Parser)]
#[command(name = "rustsfx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run hit finding over a raw frame container
    Process(ProcessArgs),

    /// Show information about a raw frame container
    Info {
        /// Input raw frame container
        input: PathBuf,
    },
}

#[derive(Args)]
struct ProcessArgs {
    /// Input raw frame container
    input: PathBuf,

    /// Run configuration (JSON); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory receiving status, event log and run summary
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Hitfinder id, overriding the configuration
    #[arg(long)]
    hitfinder: Option<u32>,

    /// Maximum number of events processed concurrently
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Read panels on independent producer threads
    #[arg(long)]
    multi_producer: bool,

    /// Detector distance (metres)
    #[arg(long, default_value = "0.1")]
    distance_m: f64,

    /// Pixel size (metres)
    #[arg(long, default_value = "75e-6")]
    pixel_size_m: f64,

    /// Per-pixel dark noise map (f32, little endian)
    #[arg(long)]
    dark_sigma: Option<PathBuf>,

    /// Per-pixel threshold map (f32, little endian)
    #[arg(long)]
    threshold_map: Option<PathBuf>,

    /// Pixel mask (u16 flag words, little endian)
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Also write hit images to this HDF5 file
    #[arg(long)]
    hdf5: Option<PathBuf>,
}

struct CalibrationFiles<'a> {
    dark_sigma: Option<&'a Path>,
    threshold_map: Option<&'a Path>,
    mask: Option<&'a Path>,
}

fn load_calibration(
    geometry: DetectorGeometry,
    files: &CalibrationFiles<'_>,
) -> Result<Calibration> {
    let n_pixels = geometry.layout.len();
    let mut calibration = Calibration::new(geometry);
    if let Some(path) = files.mask {
        calibration = calibration.try_with_pixel_mask(read_mask_map(path, n_pixels)?)?;
    }
    if let Some(path) = files.dark_sigma {
        calibration = calibration.try_with_dark_sigma(read_f32_map(path, n_pixels)?)?;
    }
    if let Some(path) = files.threshold_map {
        calibration = calibration.try_with_threshold_map(read_f32_map(path, n_pixels)?)?;
    }
    Ok(calibration)
}

#[cfg(feature = "hdf5")]
fn hdf5_sink(path: &Path) -> Result<Arc<dyn Sink>> {
    let sink = rustsfx_io::Hdf5Sink::create(path, rustsfx_io::Hdf5WriteOptions::default())?;
    Ok(Arc::new(sink))
}

#[cfg(not(feature = "hdf5"))]
fn hdf5_sink(_path: &Path) -> Result<Arc<dyn Sink>> {
    Err(CliError::Hdf5Disabled)
}

/// Opens the container and builds the pipeline and the sinks it writes to.
fn prepare_run(
    args: &ProcessArgs,
    file_sink: Arc<dyn Sink>,
) -> Result<(RawFrameFile, Pipeline, Arc<dyn Sink>)> {
    let source = RawFrameFile::open(&args.input)?;
    let header = *source.header();

    let mut run_config = match &args.config {
        Some(path) => RunConfig::from_json_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(id) = args.hitfinder {
        run_config.hitfinder.algorithm = HitfinderAlgorithm::from_id(id)?;
    }
    if let Some(k) = args.max_in_flight {
        run_config.pipeline.max_in_flight = k;
    }
    if args.multi_producer {
        run_config.pipeline.multi_producer = true;
    }
    if run_config.pipeline.tag_stride != header.stride {
        warn!(
            "Configured tag stride {} overridden by the container's stride {}",
            run_config.pipeline.tag_stride, header.stride
        );
        run_config.pipeline.tag_stride = header.stride;
    }

    let geometry = DetectorGeometry::stacked(header.layout, args.distance_m, args.pixel_size_m)?;
    let calibration = load_calibration(
        geometry,
        &CalibrationFiles {
            dark_sigma: args.dark_sigma.as_deref(),
            threshold_map: args.threshold_map.as_deref(),
            mask: args.mask.as_deref(),
        },
    )?;
    let pipeline = Pipeline::new(run_config, calibration)?;

    let sink: Arc<dyn Sink> = match &args.hdf5 {
        Some(path) => Arc::new(
            MultiSink::new()
                .with_sink(file_sink)
                .with_sink(hdf5_sink(path)?),
        ),
        None => file_sink,
    };
    Ok((source, pipeline, sink))
}

fn process(args: &ProcessArgs) -> Result<()> {
    let file_sink: Arc<dyn Sink> = Arc::new(FileSink::create(&args.output_dir)?);
    let (source, pipeline, sink) = match prepare_run(args, Arc::clone(&file_sink)) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("Run setup failed: {e}");
            let status = RunStatus {
                total: 0,
                processed: 0,
                hits: 0,
                state: RunState::Error(e.reason().to_string()),
            };
            if let Err(flush) = file_sink.flush_status(&status) {
                error!("Could not flush error status: {flush}");
            }
            return Err(e);
        }
    };

    let start = Instant::now();
    let report = pipeline.run(&source, sink)?;
    let elapsed = start.elapsed();

    info!(
        "Processed {} frames in {:.2}s",
        report.counters.processed,
        elapsed.as_secs_f64()
    );
    println!("Run: {}", report.run_id);
    println!("Status: {}", report.status);
    println!(
        "Hit rate: {:.2}%",
        if report.counters.processed == 0 {
            0.0
        } else {
            100.0 * report.counters.hits as f64 / report.counters.processed as f64
        }
    );
    println!(
        "Skipped: {} errored, {} stale, {} beam off, {} without metadata",
        report.sync.errored, report.sync.stale, report.beam_off, report.metadata_errors
    );
    println!("Peak in flight: {}", report.dispatcher.peak_in_flight);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Process(args) => process(&args)?,

        Commands::Info { input } => {
            let source = RawFrameFile::open(&input)?;
            let header = source.header();
            let layout = header.layout;

            println!("File: {}", input.display());
            println!("Run: {}", header.run_id);
            println!(
                "Layout: {} panels of {} x {} pixels",
                layout.n_panels, layout.panel_nx, layout.panel_ny
            );
            println!("Frames: {}", header.n_frames);
            match header.last_tag() {
                Some(last) => println!(
                    "Tags: {} - {} (stride {})",
                    header.first_tag, last, header.stride
                ),
                None => println!("Tags: none"),
            }
            println!("Panel gains: {:?}", source.gains());
            if let Some(last) = header.last_tag() {
                let first_ev = source.photon_energy(header.first_tag)?;
                let last_ev = source.photon_energy(last)?;
                println!("Photon energy: {:.1} - {:.1} eV", first_ev, last_ev);
            }
        }
    }

    Ok(())
}
