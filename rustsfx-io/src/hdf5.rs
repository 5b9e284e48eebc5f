//! HDF5 event and run-summary output.
//!
//! Each written event becomes a `tag-<tag>` group holding the corrected
//! image clamped to i16 (`data`, shape `(panels, ny, nx)`) and the beam
//! scalars `photon_energy_ev` and `photon_wavelength_A`. The run summary
//! lands in `summary`.

use crate::{Error, Result};
use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, File, Group};
use log::debug;
use ndarray::{ArrayView, ArrayView1};
use parking_lot::Mutex;
use rustsfx_core::{EventRecord, PowderClass, RunStatus, RunSummary};
use rustsfx_pipeline::Sink;
use std::path::Path;
use std::str::FromStr;

/// HDF5 write configuration.
#[derive(Clone, Debug)]
pub struct Hdf5WriteOptions {
    /// Store only events classified as hits.
    pub hits_only: bool,
    pub compression: Option<u8>,
    pub shuffle: bool,
}

impl Default for Hdf5WriteOptions {
    fn default() -> Self {
        Self {
            hits_only: true,
            compression: Some(1),
            shuffle: true,
        }
    }
}

/// Sink writing events and the run summary into one HDF5 file.
pub struct Hdf5Sink {
    file: Mutex<File>,
    options: Hdf5WriteOptions,
}

impl Hdf5Sink {
    /// Creates the output file.
    ///
    /// # Errors
    /// Returns an error if the HDF5 file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, options: Hdf5WriteOptions) -> Result<Self> {
        let file = File::create(path)?;
        set_attr_str_file(&file, "rustsfx_format_version", "0.1")?;
        Ok(Self {
            file: Mutex::new(file),
            options,
        })
    }

    /// Writes one event group. Blank events are skipped when `hits_only`
    /// is set.
    ///
    /// # Errors
    /// Returns an error if HDF5 I/O fails or the event does not match its
    /// layout.
    pub fn write_tag(&self, tag: u64, event: &EventRecord) -> Result<()> {
        if self.options.hits_only && !event.summary.hit {
            return Ok(());
        }
        let layout = event.layout;
        let shape = (layout.n_panels, layout.panel_ny, layout.panel_nx);
        let data: Vec<i16> = event.corrected.iter().map(|&v| clamp_i16(v)).collect();
        let view = ArrayView::from_shape(shape, data.as_slice())
            .map_err(|e| Error::InvalidFormat(format!("event data shape mismatch: {e}")))?;

        let file = self.file.lock();
        let group = file.create_group(&format!("tag-{tag}"))?;
        create_fixed_dataset::<i16, _>(&group, "data", shape, &self.options)?.write(view)?;
        write_scalar(&group, "photon_energy_ev", event.photon_energy_ev)?;
        write_scalar(&group, "photon_wavelength_A", event.wavelength_a)?;
        group
            .new_attr::<u64>()
            .create("n_peaks")?
            .write_scalar(&(event.summary.n_peaks as u64))?;
        debug!("Tag {tag} written to HDF5");
        Ok(())
    }

    /// Writes the `summary` group: powder sums per class, the photon map
    /// and the run spectrum.
    ///
    /// # Errors
    /// Returns an error if HDF5 I/O fails or an array does not match the
    /// summary shapes.
    pub fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        let file = self.file.lock();
        let group = file.create_group("summary")?;
        group
            .new_attr::<u32>()
            .create("run_id")?
            .write_scalar(&summary.run_id)?;
        set_attr_str_group(&group, "status", &summary.status.to_string())?;

        let acc = &summary.accumulators;
        let raw_shape = summary.raw_shape;
        let assembled_shape = summary.assembled_shape;
        for (class, name) in [(PowderClass::Hit, "hit"), (PowderClass::Blank, "blank")] {
            let (raw, assembled, frames) = acc.powder(class);
            if frames == 0 {
                continue;
            }
            let ds = write_raw_array(
                &group,
                &format!("powder_{name}"),
                raw_shape,
                raw,
                &self.options,
            )?;
            ds.new_attr::<u64>().create("frames")?.write_scalar(&frames)?;
            write_image(
                &group,
                &format!("powder_{name}_assembled"),
                assembled_shape,
                assembled,
                &self.options,
            )?;
        }
        write_raw_array(&group, "photon_map", raw_shape, &acc.photon_map, &self.options)?;

        if let Some(spectrum) = &summary.spectrum {
            let ds = group
                .new_dataset::<f64>()
                .shape((spectrum.sum.len(),))
                .create("spectrum")?;
            ds.write(ArrayView1::from(spectrum.sum.as_slice()))?;
            ds.new_attr::<u64>()
                .create("hits")?
                .write_scalar(&spectrum.hits)?;
            group
                .new_dataset::<f64>()
                .shape((spectrum.energy_scale_ev.len(),))
                .create("spectrum_energy_ev")?
                .write(ArrayView1::from(spectrum.energy_scale_ev.as_slice()))?;
        }
        file.flush()?;
        Ok(())
    }
}

impl Sink for Hdf5Sink {
    fn write_event(&self, tag: u64, event: &EventRecord) -> rustsfx_pipeline::Result<()> {
        self.write_tag(tag, event).map_err(Error::into_sink)
    }

    fn flush_status(&self, _status: &RunStatus) -> rustsfx_pipeline::Result<()> {
        self.file
            .lock()
            .flush()
            .map_err(|e| Error::from(e).into_sink())
    }

    fn write_run_summary(&self, summary: &RunSummary) -> rustsfx_pipeline::Result<()> {
        self.write_summary(summary).map_err(Error::into_sink)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn clamp_i16(v: f32) -> i16 {
    v.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

fn create_fixed_dataset<T: H5Type, S>(
    group: &Group,
    name: &str,
    shape: S,
    options: &Hdf5WriteOptions,
) -> Result<Dataset>
where
    S: Into<hdf5::Extents>,
{
    let mut builder = group.new_dataset::<T>().shape(shape);

    if let Some(level) = options.compression {
        builder = builder.deflate(level);
    }

    if options.shuffle {
        builder = builder.shuffle();
    }

    Ok(builder.create(name)?)
}

fn write_raw_array<T: H5Type>(
    group: &Group,
    name: &str,
    shape: (usize, usize, usize),
    values: &[T],
    options: &Hdf5WriteOptions,
) -> Result<Dataset> {
    let view = ArrayView::from_shape(shape, values)
        .map_err(|e| Error::InvalidFormat(format!("{name} shape mismatch: {e}")))?;
    let ds = create_fixed_dataset::<T, _>(group, name, shape, options)?;
    ds.write(view)?;
    Ok(ds)
}

fn write_image<T: H5Type>(
    group: &Group,
    name: &str,
    shape: (usize, usize),
    values: &[T],
    options: &Hdf5WriteOptions,
) -> Result<Dataset> {
    let view = ArrayView::from_shape(shape, values)
        .map_err(|e| Error::InvalidFormat(format!("{name} shape mismatch: {e}")))?;
    let ds = create_fixed_dataset::<T, _>(group, name, shape, options)?;
    ds.write(view)?;
    Ok(ds)
}

fn write_scalar(group: &Group, name: &str, value: f64) -> Result<()> {
    group
        .new_dataset::<f64>()
        .shape(())
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn set_attr_str_file(file: &File, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    file.new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn set_attr_str_group(group: &Group, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::InvalidFormat(format!("invalid utf-8 attribute: {e}")))
}
