//! Raw-to-corrected conversion.

use rayon::prelude::*;
use rustsfx_core::{CorrectionConfig, EventRecord, PixelFlags};

/// Flags saturated pixels and applies per-panel gain in place.
///
/// Saturation is judged on the raw values, before any scaling.
pub fn apply_corrections(event: &mut EventRecord, config: &CorrectionConfig) {
    if let Some(level) = config.saturation_adu {
        event
            .corrected
            .par_iter()
            .zip(event.mask.par_iter_mut())
            .filter(|(v, _)| **v >= level)
            .for_each(|(_, m)| m.insert(PixelFlags::SATURATED));
    }

    let Some(gains) = event.panel_gains.as_deref() else {
        return;
    };
    let panel_len = event.layout.panel_len();
    if panel_len == 0 {
        return;
    }
    let photon_energy_ev = event.photon_energy_ev;
    event
        .corrected
        .par_chunks_mut(panel_len)
        .zip(gains.par_iter())
        .for_each(|(panel, &gain)| {
            let scale = config.panel_scale(gain, photon_energy_ev);
            for v in panel {
                *v *= scale;
            }
        });
}
