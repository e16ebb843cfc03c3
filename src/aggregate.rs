//! Frequency aggregation: the sweep workflow's native tensor, per-band
//! reduction of a locking sweep, and stacking of per-band results.

use ndarray::{stack, Array3, Array4, ArrayD, ArrayView3, Axis};

use crate::bands::{frequency_sweep, Band, FrequencyAxis};
use crate::synchrony::{self, phase_entropy, phase_locking, SweepSpec, SynchronyMethod};
use crate::{EpochsData, Result, SyncError};

/// Mean of `con` (E, C, C, F) over the frequencies of `freqs` inside `band`.
pub fn band_average(con: &Array4<f64>, freqs: &[f64], band: &Band) -> Result<Array3<f64>> {
    if con.dim().3 != freqs.len() {
        return Err(SyncError::InvalidInput(format!(
            "{} frequencies for a tensor with {} frequency bins",
            freqs.len(),
            con.dim().3
        )));
    }
    let idx = FrequencyAxis::Bins(freqs.to_vec()).band_indices(band);
    if idx.is_empty() {
        return Err(SyncError::InvalidInput(format!(
            "no sweep frequency falls inside {band}"
        )));
    }
    let selected = con.select(Axis(3), &idx);
    selected
        .mean_axis(Axis(3))
        .ok_or_else(|| SyncError::InvalidInput(format!("empty selection for {band}")))
}

/// One band's `(E, C, C)` result from epochs already filtered to that band.
///
/// Entropy is computed directly; a locking measure runs a 0.5 Hz sweep across
/// the band edges and averages over it.
pub fn band_connectivity(
    epochs: &EpochsData,
    band: &Band,
    method: SynchronyMethod,
    cycles_numerator: f64,
) -> Result<Array3<f64>> {
    match method {
        SynchronyMethod::Entropy(polarity) => phase_entropy(epochs, polarity),
        SynchronyMethod::Locking(measure) => {
            let freqs = frequency_sweep(band.low, band.high)?;
            let sweep = SweepSpec::new(freqs, cycles_numerator)?;
            let con = phase_locking(epochs, &sweep, measure)?;
            band_average(&con, &sweep.freqs, band)
        }
    }
}

/// Stack per-band `(E, C, C)` results along a trailing axis, in the order
/// given: `(E, C, C, B)`.
///
/// A band without epochs fails with [`SyncError::EmptyBand`]; a band whose
/// shape differs from the first fails with [`SyncError::BandShapeMismatch`].
pub fn stack_bands(per_band: &[(Band, Array3<f64>)]) -> Result<Array4<f64>> {
    let Some((_, first)) = per_band.first() else {
        return Err(SyncError::InvalidInput("no bands to stack".to_string()));
    };
    let expected = first.shape().to_vec();

    for (band, con) in per_band {
        if con.dim().0 == 0 {
            return Err(SyncError::EmptyBand { band: band.name });
        }
        if con.shape() != expected.as_slice() {
            return Err(SyncError::BandShapeMismatch {
                band: band.name,
                got: con.shape().to_vec(),
                expected,
            });
        }
    }

    let views: Vec<ArrayView3<'_, f64>> = per_band.iter().map(|(_, con)| con.view()).collect();
    Ok(stack(Axis(3), &views)?)
}

/// Final tensor for persistence, optionally averaged over epochs
pub fn finalize(con: Array4<f64>, average: bool) -> Result<ArrayD<f64>> {
    if average {
        Ok(synchrony::average_epochs(&con)?.into_dyn())
    } else {
        Ok(con.into_dyn())
    }
}
