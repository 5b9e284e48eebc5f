//! Single-shot spectrometer integration.

use rustsfx_core::{SpectrumConfig, SpectrumImage, SpectrumSummary};

/// Projects a spectrometer image onto its (possibly tilted) dispersion axis.
///
/// Row `i`, column `j` lands in bin `i + ceil(j * tan(tilt))`; samples falling
/// outside `0..ny` are dropped. The dark image is subtracted sample by sample
/// when enabled and the same size as the image.
#[must_use]
pub fn integrate_spectrum(
    image: &SpectrumImage,
    dark: Option<&[f32]>,
    config: &SpectrumConfig,
) -> Vec<f64> {
    let tan_tilt = config.tilt_deg.to_radians().tan();
    let dark = dark.filter(|d| config.subtract_dark && d.len() == image.data.len());
    let mut spectrum = vec![0.0; image.ny];

    for i in 0..image.ny {
        for j in 0..image.nx {
            let bin = i as i64 + (j as f64 * tan_tilt).ceil() as i64;
            let Ok(bin) = usize::try_from(bin) else {
                continue;
            };
            if bin >= image.ny {
                continue;
            }
            let index = i * image.nx + j;
            let mut value = f64::from(image.data[index]);
            if let Some(dark) = dark {
                value -= f64::from(dark[index]);
            }
            spectrum[bin] += value;
        }
    }
    spectrum
}

/// Locates the run spectrum's peak and assigns an energy to each bin.
///
/// The peak bin is pinned to the run's mean photon energy and bins are
/// `ev_spread / len` apart.
#[must_use]
pub fn summarize_spectrum(
    sum: &[f64],
    hits: u64,
    mean_photon_energy_ev: f64,
    ev_spread: f64,
) -> SpectrumSummary {
    let peak_index = sum
        .iter()
        .enumerate()
        .fold(0, |best, (i, v)| if *v > sum[best] { i } else { best });
    let increment = if sum.is_empty() {
        0.0
    } else {
        ev_spread / sum.len() as f64
    };
    let offset = mean_photon_energy_ev - peak_index as f64 * increment;
    SpectrumSummary {
        sum: sum.to_vec(),
        hits,
        peak_index,
        energy_scale_ev: (0..sum.len())
            .map(|i| i as f64 * increment + offset)
            .collect(),
    }
}
