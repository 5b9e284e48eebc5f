//! Bragg peak finding and peak resolution statistics.
//!
//! Peaks are 8-connected regions of bright, trusted pixels within one panel.
//! Regions are labelled with a union-find pass over each panel.

use rustsfx_core::{Calibration, DetectorGeometry, EventRecord, HitfinderConfig, Peak, PixelFlags};

/// Pixels never allowed to take part in a peak.
pub const PEAK_EXCLUDE: PixelFlags = PixelFlags::INVALID
    .union(PixelFlags::HOT)
    .union(PixelFlags::BAD)
    .union(PixelFlags::SATURATED)
    .union(PixelFlags::MISSING)
    .union(PixelFlags::OUT_OF_RESOLUTION);

/// Fraction of peaks inside the reported resolution ring.
pub const RESOLUTION_CUTOFF: f64 = 0.95;

/// Finds Bragg peaks in one event.
pub trait PeakFinder: Send + Sync {
    /// Returns the peaks found in `event`'s corrected data.
    fn find_peaks(
        &self,
        event: &EventRecord,
        calibration: &Calibration,
        config: &HitfinderConfig,
    ) -> Vec<Peak>;

    /// Returns the name of the finder.
    fn name(&self) -> &'static str;
}

/// Connected-component peak finder.
#[derive(Debug, Clone, Default)]
pub struct ConnectedPeakFinder;

impl ConnectedPeakFinder {
    pub fn new() -> Self {
        Self
    }
}

/// Union-Find data structure for connected component detection.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, x: usize, y: usize) {
        let px = self.find(x);
        let py = self.find(y);

        if px == py {
            return;
        }

        match self.rank[px].cmp(&self.rank[py]) {
            std::cmp::Ordering::Less => self.parent[px] = py,
            std::cmp::Ordering::Greater => self.parent[py] = px,
            std::cmp::Ordering::Equal => {
                self.parent[py] = px;
                self.rank[px] += 1;
            }
        }
    }
}

#[derive(Default)]
struct Region {
    npix: usize,
    total: f64,
    max: f32,
    sum_fs: f64,
    sum_ss: f64,
}

impl PeakFinder for ConnectedPeakFinder {
    fn find_peaks(
        &self,
        event: &EventRecord,
        calibration: &Calibration,
        config: &HitfinderConfig,
    ) -> Vec<Peak> {
        let layout = event.layout;
        let (nx, ny) = (layout.panel_nx, layout.panel_ny);
        let geometry = &calibration.geometry;
        let mut peaks = Vec::new();

        for panel in 0..layout.n_panels {
            let offset = layout.panel_offset(panel);
            let data = &event.corrected[offset..offset + layout.panel_len()];
            let mask = &event.mask[offset..offset + layout.panel_len()];
            let bright: Vec<bool> = data
                .iter()
                .zip(mask)
                .map(|(v, m)| *v > config.adc_threshold && m.is_clear_of(PEAK_EXCLUDE))
                .collect();
            if !bright.iter().any(|b| *b) {
                continue;
            }

            let mut uf = UnionFind::new(bright.len());
            for ss in 0..ny {
                for fs in 0..nx {
                    let i = ss * nx + fs;
                    if !bright[i] {
                        continue;
                    }
                    // Neighbours already visited in raster order
                    if fs > 0 && bright[i - 1] {
                        uf.union(i, i - 1);
                    }
                    if ss > 0 {
                        let up = i - nx;
                        if bright[up] {
                            uf.union(i, up);
                        }
                        if fs > 0 && bright[up - 1] {
                            uf.union(i, up - 1);
                        }
                        if fs + 1 < nx && bright[up + 1] {
                            uf.union(i, up + 1);
                        }
                    }
                }
            }

            // Regions in order of first pixel, so output is deterministic
            let mut region_of_root = vec![usize::MAX; bright.len()];
            let mut regions: Vec<Region> = Vec::new();
            for (i, &is_bright) in bright.iter().enumerate() {
                if !is_bright {
                    continue;
                }
                let root = uf.find(i);
                if region_of_root[root] == usize::MAX {
                    region_of_root[root] = regions.len();
                    regions.push(Region::default());
                }
                let region = &mut regions[region_of_root[root]];
                let v = data[i];
                region.npix += 1;
                region.total += f64::from(v);
                region.max = region.max.max(v);
                region.sum_fs += f64::from(v) * (i % nx) as f64;
                region.sum_ss += f64::from(v) * (i / nx) as f64;
            }

            let origin_x = geometry.pixel_x()[offset];
            let origin_y = geometry.pixel_y()[offset];
            peaks.extend(
                regions
                    .into_iter()
                    .filter(|r| (config.peak_min_pix..=config.peak_max_pix).contains(&r.npix))
                    .filter(|r| r.total > 0.0)
                    .map(|r| {
                        let fs = (r.sum_fs / r.total) as f32;
                        let ss = (r.sum_ss / r.total) as f32;
                        Peak {
                            panel,
                            fs,
                            ss,
                            npix: r.npix,
                            total: r.total as f32,
                            max: r.max,
                            radius: (origin_x + fs).hypot(origin_y + ss),
                        }
                    }),
            );
        }

        peaks
    }

    fn name(&self) -> &'static str {
        "connected"
    }
}

/// Resolution statistics of a peak list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionStats {
    /// Radius, in pixels, enclosing the cutoff fraction of peaks.
    pub resolution: f64,
    /// Same radius as a real-space resolution in Angstrom.
    pub resolution_a: f64,
    /// Peaks per panel area inside the resolution ring.
    pub density: f64,
}

/// Computes resolution statistics from the first `min(len, npeaks_max)` peaks.
///
/// Returns `None` with fewer than two peaks.
#[must_use]
pub fn resolution_stats(
    peaks: &[Peak],
    npeaks_max: usize,
    geometry: &DetectorGeometry,
    wavelength_a: f64,
) -> Option<ResolutionStats> {
    if peaks.len() < 2 {
        return None;
    }
    let np = peaks.len().min(npeaks_max);
    if np == 0 {
        return None;
    }
    let kk = (RESOLUTION_CUTOFF * np as f64).floor() as usize;
    let mut radii: Vec<f32> = peaks[..np].iter().map(|p| p.radius).collect();
    let (_, kth, _) = radii.select_nth_unstable_by(kk.min(np - 1), f32::total_cmp);
    let resolution = f64::from(*kth);

    let z = geometry.distance_m;
    let dx = geometry.pixel_size_m;
    let r = (z * z + dx * dx * resolution * resolution).sqrt();
    let sin_theta = dx * resolution / r;
    let resolution_a = if sin_theta > 0.0 {
        wavelength_a / sin_theta
    } else {
        0.0
    };

    let density = if resolution > 0.0 {
        let layout = geometry.layout;
        let area = std::f64::consts::PI * resolution * resolution
            / (layout.panel_nx * layout.panel_ny) as f64;
        RESOLUTION_CUTOFF * np as f64 / area
    } else {
        0.0
    };

    Some(ResolutionStats {
        resolution,
        resolution_a,
        density,
    })
}
