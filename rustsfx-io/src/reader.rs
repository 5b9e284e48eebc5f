//! Memory-mapped file readers.
//!
//! The raw frame container is little-endian:
//!
//! | offset | type | field |
//! |---|---|---|
//! | 0 | `[u8; 8]` | magic `RSFXRAW1` |
//! | 8 | u32 | panel count |
//! | 12 | u32 | panel fast-scan size |
//! | 16 | u32 | panel slow-scan size |
//! | 20 | u32 | run id |
//! | 24 | u64 | frame count |
//! | 32 | u64 | first tag |
//! | 40 | u64 | tag stride |
//! | 48 | `f32 * panels` | panel gains |
//!
//! followed by one record per frame: photon energy (f64, eV) then every
//! panel's samples (f32), panel after panel.

use crate::{Error, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use rustsfx_core::{DetectorLayout, Frame, PixelFlags};
use rustsfx_pipeline::{FrameSource, PanelRead};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes opening a raw frame container.
pub const RAW_MAGIC: [u8; 8] = *b"RSFXRAW1";
/// Size of the fixed part of the header.
pub const RAW_HEADER_LEN: usize = 48;

/// A memory-mapped file reader.
///
/// Uses memmap2 to access file contents without loading the entire file
/// into memory.
pub struct MappedFileReader {
    mmap: Arc<Mmap>,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            Error::MmapError(format!("{}: {e}", path.as_ref().display()))
        })?;
        Ok(Self {
            mmap: Arc::new(mmap),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

/// Fixed header of a raw frame container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrameHeader {
    pub layout: DetectorLayout,
    pub run_id: u32,
    pub n_frames: u64,
    pub first_tag: u64,
    pub stride: u64,
}

impl RawFrameHeader {
    /// Bytes of one frame record.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        8 + 4 * self.layout.len()
    }

    /// Offset of the first frame record.
    #[must_use]
    pub fn data_offset(&self) -> usize {
        RAW_HEADER_LEN + 4 * self.layout.n_panels
    }

    /// Tag of the last frame, `None` for an empty container.
    #[must_use]
    pub fn last_tag(&self) -> Option<u64> {
        let n = self.n_frames.checked_sub(1)?;
        n.checked_mul(self.stride)?.checked_add(self.first_tag)
    }

    /// Index of the frame holding `tag`.
    #[must_use]
    pub fn index_of(&self, tag: u64) -> Option<usize> {
        let offset = tag.checked_sub(self.first_tag)?;
        if offset % self.stride != 0 {
            return None;
        }
        let index = offset / self.stride;
        if index < self.n_frames {
            usize::try_from(index).ok()
        } else {
            None
        }
    }

    pub(crate) fn encode(&self) -> [u8; RAW_HEADER_LEN] {
        let mut out = [0u8; RAW_HEADER_LEN];
        out[0..8].copy_from_slice(&RAW_MAGIC);
        put_u32(&mut out[8..12], self.layout.n_panels);
        put_u32(&mut out[12..16], self.layout.panel_nx);
        put_u32(&mut out[16..20], self.layout.panel_ny);
        out[20..24].copy_from_slice(&self.run_id.to_le_bytes());
        out[24..32].copy_from_slice(&self.n_frames.to_le_bytes());
        out[32..40].copy_from_slice(&self.first_tag.to_le_bytes());
        out[40..48].copy_from_slice(&self.stride.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RAW_HEADER_LEN {
            return Err(Error::InvalidFormat(format!(
                "file too short for a header: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0..8] != RAW_MAGIC {
            return Err(Error::InvalidFormat("bad magic".to_string()));
        }
        let header = Self {
            layout: DetectorLayout::new(
                read_u32(bytes, 8) as usize,
                read_u32(bytes, 12) as usize,
                read_u32(bytes, 16) as usize,
            ),
            run_id: read_u32(bytes, 20),
            n_frames: read_u64(bytes, 24),
            first_tag: read_u64(bytes, 32),
            stride: read_u64(bytes, 40),
        };
        if header.stride == 0 {
            return Err(Error::InvalidFormat("tag stride is zero".to_string()));
        }
        let layout = header.layout;
        let samples = layout
            .n_panels
            .checked_mul(layout.panel_nx)
            .and_then(|n| n.checked_mul(layout.panel_ny))
            .and_then(|n| n.checked_mul(4));
        match samples {
            None => Err(Error::InvalidFormat("detector layout overflows".to_string())),
            Some(0) => Err(Error::InvalidFormat("detector layout is empty".to_string())),
            Some(_) => Ok(header),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn put_u32(out: &mut [u8], value: usize) {
    out.copy_from_slice(&(value as u32).to_le_bytes());
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn read_f64(bytes: &[u8], offset: usize) -> f64 {
    f64::from_bits(read_u64(bytes, offset))
}

fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .par_chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Memory-mapped raw frame container.
pub struct RawFrameFile {
    reader: MappedFileReader,
    header: RawFrameHeader,
    gains: Vec<f32>,
}

impl RawFrameFile {
    /// Opens and validates a container.
    ///
    /// # Errors
    /// Returns `InvalidFormat` for a bad header or a file shorter than the
    /// header says.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = MappedFileReader::open(path)?;
        let bytes = reader.as_bytes();
        let header = RawFrameHeader::decode(bytes)?;

        let expected = usize::try_from(header.n_frames)
            .ok()
            .and_then(|n| n.checked_mul(header.frame_len()))
            .and_then(|n| n.checked_add(header.data_offset()))
            .ok_or_else(|| Error::InvalidFormat("frame count overflows".to_string()))?;
        if bytes.len() < expected {
            return Err(Error::InvalidFormat(format!(
                "{} holds {} bytes, header describes {expected}",
                reader.path().display(),
                bytes.len()
            )));
        }

        let gains = decode_f32(&bytes[RAW_HEADER_LEN..header.data_offset()]);
        Ok(Self {
            reader,
            header,
            gains,
        })
    }

    #[must_use]
    pub fn header(&self) -> &RawFrameHeader {
        &self.header
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    #[must_use]
    pub fn gains(&self) -> &[f32] {
        &self.gains
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        usize::try_from(self.header.n_frames).unwrap_or(usize::MAX)
    }

    fn record(&self, index: usize) -> &[u8] {
        let len = self.header.frame_len();
        let start = self.header.data_offset() + index * len;
        &self.reader.as_bytes()[start..start + len]
    }

    fn checked_index(&self, tag: u64) -> Result<usize> {
        self.header
            .index_of(tag)
            .ok_or_else(|| Error::InvalidFormat(format!("tag {tag} is not in the file")))
    }

    /// Photon energy of the frame holding `tag`.
    ///
    /// # Errors
    /// Returns `InvalidFormat` if no frame holds `tag`.
    pub fn photon_energy(&self, tag: u64) -> Result<f64> {
        let index = self.checked_index(tag)?;
        Ok(read_f64(self.record(index), 0))
    }

    /// Samples of one panel of the frame holding `tag`.
    ///
    /// # Errors
    /// Returns `InvalidFormat` if no frame holds `tag`, `CoreError` for a bad
    /// panel index.
    pub fn panel(&self, tag: u64, panel: usize) -> Result<Vec<f32>> {
        self.header.layout.check_panel(panel)?;
        let index = self.checked_index(tag)?;
        let panel_bytes = 4 * self.header.layout.panel_len();
        let start = 8 + panel * panel_bytes;
        Ok(decode_f32(&self.record(index)[start..start + panel_bytes]))
    }

    /// Whole frame holding `tag`, with its photon energy.
    ///
    /// # Errors
    /// Returns `InvalidFormat` if no frame holds `tag`.
    pub fn read_frame(&self, tag: u64) -> Result<Frame> {
        let index = self.checked_index(tag)?;
        let record = self.record(index);
        let pixels = decode_f32(&record[8..]);
        Ok(Frame::from_pixels(tag, self.header.layout, pixels)?
            .with_run_id(self.header.run_id)
            .with_photon_energy(read_f64(record, 0)))
    }
}

impl FrameSource for RawFrameFile {
    fn layout(&self) -> DetectorLayout {
        self.header.layout
    }

    fn next_panel_tag(
        &self,
        panel: usize,
        requested_tag: u64,
    ) -> rustsfx_pipeline::Result<PanelRead> {
        let pixels = self
            .panel(requested_tag, panel)
            .map_err(|e| rustsfx_pipeline::Error::source(panel, requested_tag, e))?;
        Ok(PanelRead {
            tag: requested_tag,
            pixels,
            run_id: self.header.run_id,
        })
    }

    fn read_run_number(&self) -> rustsfx_pipeline::Result<u32> {
        Ok(self.header.run_id)
    }

    fn read_gain(&self, panel: usize) -> rustsfx_pipeline::Result<f32> {
        self.gains
            .get(panel)
            .copied()
            .ok_or_else(|| rustsfx_pipeline::Error::Source(format!("no gain for panel {panel}")))
    }

    fn read_photon_energy(&self, tag: u64) -> rustsfx_pipeline::Result<f64> {
        self.photon_energy(tag).map_err(Error::into_source)
    }

    fn tag_range(&self) -> rustsfx_pipeline::Result<(u64, u64)> {
        self.header
            .last_tag()
            .map(|last| (self.header.first_tag, last))
            .ok_or_else(|| {
                rustsfx_pipeline::Error::Source(format!(
                    "{} holds no frames",
                    self.path().display()
                ))
            })
    }
}

/// Reads a per-pixel f32 calibration map stored as raw little-endian floats.
///
/// # Errors
/// Returns `InvalidFormat` unless the file holds exactly `expected` values.
pub fn read_f32_map<P: AsRef<Path>>(path: P, expected: usize) -> Result<Vec<f32>> {
    let reader = MappedFileReader::open(path)?;
    if reader.len() != 4 * expected {
        return Err(Error::InvalidFormat(format!(
            "{}: expected {expected} f32 values, found {} bytes",
            reader.path().display(),
            reader.len()
        )));
    }
    Ok(decode_f32(reader.as_bytes()))
}

/// Reads a pixel mask stored as little-endian u16 flag words.
///
/// # Errors
/// Returns `InvalidFormat` unless the file holds exactly `expected` words.
pub fn read_mask_map<P: AsRef<Path>>(path: P, expected: usize) -> Result<Vec<PixelFlags>> {
    let reader = MappedFileReader::open(path)?;
    if reader.len() != 2 * expected {
        return Err(Error::InvalidFormat(format!(
            "{}: expected {expected} mask words, found {} bytes",
            reader.path().display(),
            reader.len()
        )));
    }
    Ok(reader
        .as_bytes()
        .par_chunks_exact(2)
        .map(|c| PixelFlags::from_bits(u16::from_le_bytes([c[0], c[1]])))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::RawFrameWriter;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_container(file: &NamedTempFile) -> DetectorLayout {
        let layout = DetectorLayout::new(2, 3, 2);
        let mut writer =
            RawFrameWriter::create(file.path(), layout, 10, 2, 77, &[1.5, 2.5]).unwrap();
        for i in 0..3u8 {
            let pixels: Vec<f32> = (0..12).map(|p| f32::from(i * 100 + p)).collect();
            writer
                .write_frame(7000.0 + f64::from(i), &pixels)
                .unwrap();
        }
        writer.finish().unwrap();
        layout
    }

    #[test]
    fn test_header_and_frames() {
        let file = NamedTempFile::new().unwrap();
        let layout = write_container(&file);
        let raw = RawFrameFile::open(file.path()).unwrap();

        assert_eq!(raw.header().layout, layout);
        assert_eq!(raw.header().n_frames, 3);
        assert_eq!(raw.tag_range().unwrap(), (10, 14));
        assert_eq!(raw.gains(), &[1.5, 2.5]);
        assert_eq!(raw.read_run_number().unwrap(), 77);

        let read = raw.next_panel_tag(1, 12).unwrap();
        assert_eq!(read.pixels, vec![106.0, 107.0, 108.0, 109.0, 110.0, 111.0]);
        assert!((raw.read_photon_energy(14).unwrap() - 7002.0).abs() < 1e-9);

        let frame = raw.read_frame(10).unwrap();
        assert_eq!(frame.pixels.len(), 12);
        assert_eq!(frame.run_id, 77);
    }

    #[test]
    fn test_unknown_tags_rejected() {
        let file = NamedTempFile::new().unwrap();
        write_container(&file);
        let raw = RawFrameFile::open(file.path()).unwrap();
        assert!(raw.next_panel_tag(0, 11).is_err());
        assert!(raw.next_panel_tag(0, 16).is_err());
        assert!(raw.next_panel_tag(0, 8).is_err());
        assert!(raw.next_panel_tag(2, 10).is_err());
    }

    #[test]
    fn test_truncated_file_rejected() {
        let file = NamedTempFile::new().unwrap();
        write_container(&file);
        let bytes = std::fs::read(file.path()).unwrap();
        let short = NamedTempFile::new().unwrap();
        short
            .as_file()
            .write_all(&bytes[..bytes.len() - 4])
            .unwrap();
        assert!(matches!(
            RawFrameFile::open(short.path()),
            Err(Error::InvalidFormat(_))
        ));

        let garbage = NamedTempFile::new().unwrap();
        garbage.as_file().write_all(&[0u8; 64]).unwrap();
        assert!(matches!(
            RawFrameFile::open(garbage.path()),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_calibration_maps() {
        let file = NamedTempFile::new().unwrap();
        let values: Vec<u8> = [1.0f32, -2.0, 3.5]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        file.as_file().write_all(&values).unwrap();
        assert_eq!(read_f32_map(file.path(), 3).unwrap(), vec![1.0, -2.0, 3.5]);
        assert!(read_f32_map(file.path(), 4).is_err());

        let mask = NamedTempFile::new().unwrap();
        mask.as_file().write_all(&[0, 0, 4, 0]).unwrap();
        let flags = read_mask_map(mask.path(), 2).unwrap();
        assert!(flags[0].is_empty());
        assert!(flags[1].contains(PixelFlags::HOT));
    }
}
