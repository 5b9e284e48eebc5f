//! Run-wide aggregates shared by every worker.
//!
//! Each aggregate has its own lock so that a worker updating the powder sum
//! never waits on one that is only bumping the hit counter. The cumulative
//! photon map is lock-free: one atomic per pixel.

use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicI64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Hit bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HitCounters {
    pub processed: u64,
    pub hits: u64,
    /// Hits since the last status update.
    pub recent_hits: u64,
}

/// Class a powder contribution is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowderClass {
    Blank,
    Hit,
}

impl PowderClass {
    #[must_use]
    pub const fn from_hit(hit: bool) -> Self {
        if hit {
            Self::Hit
        } else {
            Self::Blank
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Blank => 0,
            Self::Hit => 1,
        }
    }
}

#[derive(Debug, Default)]
struct PowderSums {
    raw: [Vec<f64>; 2],
    assembled: [Vec<f64>; 2],
    frames: [u64; 2],
}

#[derive(Debug, Default)]
struct SpectrumSum {
    sum: Vec<f64>,
    hits: u64,
}

/// Copy of every aggregate, taken at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct AccumulatorSnapshot {
    pub counters: HitCounters,
    /// Raw powder sums indexed by [`PowderClass`] (blank, hit).
    pub powder_raw: [Vec<f64>; 2],
    pub powder_assembled: [Vec<f64>; 2],
    pub powder_frames: [u64; 2],
    pub photon_map: Vec<i64>,
    pub spectrum: Vec<f64>,
    pub spectrum_hits: u64,
}

impl AccumulatorSnapshot {
    #[must_use]
    pub fn powder(&self, class: PowderClass) -> (&[f64], &[f64], u64) {
        let i = class.index();
        (
            &self.powder_raw[i],
            &self.powder_assembled[i],
            self.powder_frames[i],
        )
    }
}

/// Process-wide aggregates.
#[derive(Debug)]
pub struct SharedAccumulators {
    counters: Mutex<HitCounters>,
    powder: Mutex<PowderSums>,
    spectrum: Mutex<SpectrumSum>,
    photon_map: Vec<AtomicI64>,
    assembled_len: usize,
}

impl SharedAccumulators {
    /// Creates empty aggregates for a detector of `n_pixels` raw pixels
    /// whose assembled image has `assembled_len` pixels.
    #[must_use]
    pub fn new(n_pixels: usize, assembled_len: usize) -> Self {
        Self {
            counters: Mutex::new(HitCounters::default()),
            powder: Mutex::new(PowderSums::default()),
            spectrum: Mutex::new(SpectrumSum::default()),
            photon_map: (0..n_pixels).map(|_| AtomicI64::new(0)).collect(),
            assembled_len,
        }
    }

    #[must_use]
    pub fn n_pixels(&self) -> usize {
        self.photon_map.len()
    }

    /// Counts one hit. Returns the new total.
    pub fn record_hit(&self) -> u64 {
        let mut counters = self.counters.lock();
        counters.hits += 1;
        counters.recent_hits += 1;
        counters.hits
    }

    /// Counts one finished event. Returns the new total.
    pub fn record_processed(&self) -> u64 {
        let mut counters = self.counters.lock();
        counters.processed += 1;
        counters.processed
    }

    #[must_use]
    pub fn counters(&self) -> HitCounters {
        *self.counters.lock()
    }

    /// Returns the hits since the previous call and restarts the count.
    pub fn take_recent_hits(&self) -> u64 {
        std::mem::take(&mut self.counters.lock().recent_hits)
    }

    /// Adds `photons` to one cell of the cumulative photon map.
    pub fn add_photons(&self, pixel: usize, photons: i64) {
        self.photon_map[pixel].fetch_add(photons, Ordering::Relaxed);
    }

    /// Current value of one photon map cell.
    #[must_use]
    pub fn photon_count(&self, pixel: usize) -> i64 {
        self.photon_map[pixel].load(Ordering::Relaxed)
    }

    /// Adds one frame to the powder sums of its class.
    ///
    /// `assembled_index` maps each raw pixel to its assembled-image cell.
    pub fn add_powder(&self, class: PowderClass, values: &[f32], assembled_index: &[u32]) {
        let n = self.photon_map.len();
        let mut powder = self.powder.lock();
        let i = class.index();

        let raw = &mut powder.raw[i];
        if raw.is_empty() {
            raw.resize(n, 0.0);
        }
        for (acc, v) in raw.iter_mut().zip(values) {
            *acc += f64::from(*v);
        }

        let assembled_len = self.assembled_len;
        let assembled = &mut powder.assembled[i];
        if assembled.is_empty() {
            assembled.resize(assembled_len, 0.0);
        }
        for (&cell, v) in assembled_index.iter().zip(values) {
            if let Some(acc) = assembled.get_mut(cell as usize) {
                *acc += f64::from(*v);
            }
        }

        powder.frames[i] += 1;
    }

    /// Adds one integrated spectrum to the run spectrum. Returns the number
    /// of spectra summed so far.
    pub fn add_spectrum(&self, spectrum: &[f64]) -> u64 {
        let mut sum = self.spectrum.lock();
        if sum.sum.len() < spectrum.len() {
            sum.sum.resize(spectrum.len(), 0.0);
        }
        for (acc, v) in sum.sum.iter_mut().zip(spectrum) {
            *acc += v;
        }
        sum.hits += 1;
        sum.hits
    }

    /// Copies every aggregate.
    #[must_use]
    pub fn snapshot(&self) -> AccumulatorSnapshot {
        let photon_map = self
            .photon_map
            .par_iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect();
        let counters = self.counters();
        let (powder_raw, powder_assembled, powder_frames) = {
            let powder = self.powder.lock();
            (
                powder.raw.clone(),
                powder.assembled.clone(),
                powder.frames,
            )
        };
        let (spectrum, spectrum_hits) = {
            let spectrum = self.spectrum.lock();
            (spectrum.sum.clone(), spectrum.hits)
        };
        AccumulatorSnapshot {
            counters,
            powder_raw,
            powder_assembled,
            powder_frames,
            photon_map,
            spectrum,
            spectrum_hits,
        }
    }

    /// Clears every aggregate for a new run.
    pub fn reset(&self) {
        *self.counters.lock() = HitCounters::default();
        *self.powder.lock() = PowderSums::default();
        *self.spectrum.lock() = SpectrumSum::default();
        self.photon_map
            .par_iter()
            .for_each(|cell| cell.store(0, Ordering::Relaxed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_hit_counters() {
        let acc = SharedAccumulators::new(4, 4);
        assert_eq!(acc.record_hit(), 1);
        assert_eq!(acc.record_hit(), 2);
        acc.record_processed();
        assert_eq!(acc.take_recent_hits(), 2);
        acc.record_hit();

        let counters = acc.counters();
        assert_eq!(counters.hits, 3);
        assert_eq!(counters.recent_hits, 1);
        assert_eq!(counters.processed, 1);
    }

    #[test]
    fn test_powder_split_by_class() {
        let acc = SharedAccumulators::new(3, 4);
        acc.add_powder(PowderClass::Hit, &[1.0, 2.0, 3.0], &[3, 2, 1]);
        acc.add_powder(PowderClass::Hit, &[1.0, 1.0, 1.0], &[3, 2, 1]);
        acc.add_powder(PowderClass::Blank, &[5.0, 5.0, 5.0], &[3, 2, 1]);

        let snapshot = acc.snapshot();
        let (raw, assembled, frames) = snapshot.powder(PowderClass::Hit);
        assert_eq!(raw, &[2.0, 3.0, 4.0]);
        assert_eq!(assembled, &[0.0, 4.0, 3.0, 2.0]);
        assert_eq!(frames, 2);
        assert_eq!(snapshot.powder(PowderClass::Blank).2, 1);
    }

    #[test]
    fn test_spectrum_sum() {
        let acc = SharedAccumulators::new(1, 1);
        assert_eq!(acc.add_spectrum(&[1.0, 2.0]), 1);
        assert_eq!(acc.add_spectrum(&[1.0, 2.0, 3.0]), 2);
        let snapshot = acc.snapshot();
        assert_eq!(snapshot.spectrum, vec![2.0, 4.0, 3.0]);
        assert_eq!(snapshot.spectrum_hits, 2);
    }

    #[test]
    fn test_photon_map_concurrent_adds_are_exact() {
        let acc = Arc::new(SharedAccumulators::new(64, 64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let acc = Arc::clone(&acc);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        for pixel in 0..64 {
                            acc.add_photons(pixel, t + 1);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // 1000 * (1 + 2 + ... + 8)
        assert!((0..64).all(|p| acc.photon_count(p) == 36_000));
    }

    #[test]
    fn test_reset() {
        let acc = SharedAccumulators::new(2, 2);
        acc.record_hit();
        acc.add_photons(1, 5);
        acc.add_powder(PowderClass::Blank, &[1.0, 1.0], &[0, 1]);
        acc.reset();

        let snapshot = acc.snapshot();
        assert_eq!(snapshot.counters, HitCounters::default());
        assert_eq!(snapshot.photon_map, vec![0, 0]);
        assert!(snapshot.powder_raw[0].is_empty());
    }
}
