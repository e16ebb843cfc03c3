//! Pairwise phase-synchrony estimators.
//!
//! Two strategies share one entry point per shape of output:
//!
//! - [`phase_locking`]: Morlet time-frequency coefficients per channel, then a
//!   locking measure over time within each epoch, for every sweep frequency.
//!   Output `(epoch, channel, channel, frequency)`.
//! - [`phase_entropy`]: Hilbert phase per channel, 50-bin histogram of the
//!   wrapped phase difference per pair, normalized Shannon entropy.
//!   Output `(epoch, channel, channel)`.
//!
//! Matrices are symmetric with a zero diagonal. A pair involving a channel
//! marked flat for the epoch ([`EpochsData::flat`]) yields `NaN`.

use std::f64::consts::PI;
use std::fmt;

use ndarray::{Array2, Array3, Array4, ArrayView1, Axis};
use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::signal::{HilbertTransform, MorletBank};
use crate::{EpochsData, Result, SyncError};

/// Histogram resolution of the phase-difference distribution
pub const ENTROPY_BINS: usize = 50;

/// Locking measure computed from the cross-spectrum over time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingMeasure {
    /// Phase-locking value
    #[default]
    Plv,
    /// Corrected imaginary PLV
    Ciplv,
    /// Phase lag index
    Pli,
    /// Weighted phase lag index
    Wpli,
}

impl LockingMeasure {
    pub fn name(&self) -> &'static str {
        match self {
            LockingMeasure::Plv => "plv",
            LockingMeasure::Ciplv => "ciplv",
            LockingMeasure::Pli => "pli",
            LockingMeasure::Wpli => "wpli",
        }
    }

    /// Value for one pair from its time-frequency rows at a single frequency
    pub fn compute(&self, x: ArrayView1<'_, Complex<f64>>, y: ArrayView1<'_, Complex<f64>>) -> f64 {
        let n = x.len() as f64;
        if n == 0.0 {
            return f64::NAN;
        }
        let csd = x.iter().zip(y.iter()).map(|(a, b)| a * b.conj());

        match self {
            LockingMeasure::Plv | LockingMeasure::Ciplv => {
                let mut acc = Complex::new(0.0, 0.0);
                for c in csd {
                    let norm = c.norm();
                    if norm > 0.0 {
                        acc += c / norm;
                    }
                }
                let mean = acc / n;
                if *self == LockingMeasure::Plv {
                    mean.norm()
                } else {
                    let denom = (1.0 - mean.re * mean.re).max(0.0).sqrt();
                    if denom <= f64::EPSILON {
                        0.0
                    } else {
                        mean.im.abs() / denom
                    }
                }
            }
            LockingMeasure::Pli => (csd.map(|c| sign(c.im)).sum::<f64>() / n).abs(),
            LockingMeasure::Wpli => {
                let (num, den) = csd.fold((0.0f64, 0.0f64), |(num, den), c| {
                    (num + c.im, den + c.im.abs())
                });
                // no imaginary coupling at all
                if den == 0.0 {
                    0.0
                } else {
                    num.abs() / den
                }
            }
        }
    }
}

impl fmt::Display for LockingMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which way the entropy estimator reports its value.
///
/// `Synchrony` stores `1 - H` so that, like the locking measures, higher
/// means more synchronized. `Entropy` stores the normalized entropy `H`
/// itself (higher means less synchronized).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntropyPolarity {
    #[default]
    Synchrony,
    Entropy,
}

impl EntropyPolarity {
    pub fn apply(&self, entropy: f64) -> f64 {
        match self {
            EntropyPolarity::Synchrony => 1.0 - entropy,
            EntropyPolarity::Entropy => entropy,
        }
    }
}

/// Estimator selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronyMethod {
    Locking(LockingMeasure),
    Entropy(EntropyPolarity),
}

impl SynchronyMethod {
    pub fn name(&self) -> &'static str {
        match self {
            SynchronyMethod::Locking(m) => m.name(),
            SynchronyMethod::Entropy(_) => "entropy",
        }
    }
}

impl fmt::Display for SynchronyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynchronyMethod::Locking(m) => write!(f, "{m}"),
            SynchronyMethod::Entropy(p) => write!(f, "entropy ({p:?})"),
        }
    }
}

/// Frequencies and wavelet cycle counts for the locking estimator
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSpec {
    pub freqs: Vec<f64>,
    pub n_cycles: Vec<f64>,
}

impl SweepSpec {
    /// `n_cycles = freq / cycles_numerator` for every frequency
    pub fn new(freqs: Vec<f64>, cycles_numerator: f64) -> Result<Self> {
        if freqs.is_empty() {
            return Err(SyncError::InvalidInput("empty frequency sweep".to_string()));
        }
        if !(cycles_numerator.is_finite() && cycles_numerator > 0.0) {
            return Err(SyncError::InvalidInput(format!(
                "cycles numerator must be positive, got {cycles_numerator}"
            )));
        }
        let n_cycles = freqs.iter().map(|f| f / cycles_numerator).collect();
        Ok(Self { freqs, n_cycles })
    }

    pub fn len(&self) -> usize {
        self.freqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.freqs.is_empty()
    }
}

/// Unordered channel pairs `(i, j)`, `i < j`, in lexicographic order
pub fn channel_pairs(n_channels: usize) -> Vec<(usize, usize)> {
    (0..n_channels)
        .flat_map(|i| ((i + 1)..n_channels).map(move |j| (i, j)))
        .collect()
}

fn check_batch(epochs: &EpochsData) -> Result<()> {
    if epochs.n_channels() < 2 {
        return Err(SyncError::InvalidInput(format!(
            "need at least 2 channels to pair, got {}",
            epochs.n_channels()
        )));
    }
    if epochs.n_times() == 0 {
        return Err(SyncError::InvalidInput("epochs contain no samples".to_string()));
    }
    Ok(())
}

fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Locking measure per epoch, pair and sweep frequency: `(E, C, C, F)`.
pub fn phase_locking(
    epochs: &EpochsData,
    sweep: &SweepSpec,
    measure: LockingMeasure,
) -> Result<Array4<f64>> {
    check_batch(epochs)?;
    let (n_epochs, n_ch, n_times) = epochs.epochs.dim();
    let bank = MorletBank::new(&sweep.freqs, &sweep.n_cycles, epochs.sfreq, n_times)?;
    let n_freqs = bank.n_freqs();
    let pairs = channel_pairs(n_ch);

    log::debug!(
        "{measure}: {n_epochs} epochs x {} pairs x {n_freqs} frequencies",
        pairs.len()
    );

    let per_epoch: Vec<Array3<f64>> = (0..n_epochs)
        .into_par_iter()
        .map(|e| {
            let epoch = epochs.epochs.index_axis(Axis(0), e);
            let flat = epochs.flat.row(e);
            let tfr: Vec<Array2<Complex<f64>>> =
                epoch.outer_iter().map(|ch| bank.transform(ch)).collect();

            let mut con = Array3::<f64>::zeros((n_ch, n_ch, n_freqs));
            for &(i, j) in &pairs {
                for f in 0..n_freqs {
                    let value = if flat[i] || flat[j] {
                        f64::NAN
                    } else {
                        measure.compute(tfr[i].row(f), tfr[j].row(f))
                    };
                    con[[i, j, f]] = value;
                    con[[j, i, f]] = value;
                }
            }
            con
        })
        .collect();

    let mut out = Array4::<f64>::zeros((n_epochs, n_ch, n_ch, n_freqs));
    for (mut slot, con) in out.outer_iter_mut().zip(per_epoch) {
        slot.assign(&con);
    }
    Ok(out)
}

/// Mean over the leading (epoch) axis. NaN entries propagate.
pub fn average_epochs(con: &Array4<f64>) -> Result<Array3<f64>> {
    con.mean_axis(Axis(0))
        .ok_or_else(|| SyncError::InvalidInput("cannot average zero epochs".to_string()))
}

/// Wrap a phase into (-pi, pi]
pub fn wrap_phase(x: f64) -> f64 {
    let w = x.sin().atan2(x.cos());
    if w <= -PI {
        PI
    } else {
        w
    }
}

/// Histogram bin of a wrapped phase over `ENTROPY_BINS` equal bins of [-pi, pi]
pub fn bin_index(phase: f64) -> usize {
    let b = ((phase + PI) / (2.0 * PI) * ENTROPY_BINS as f64).floor();
    (b.max(0.0) as usize).min(ENTROPY_BINS - 1)
}

/// Shannon entropy of a histogram normalized by `ln(bins)`, in [0, 1]
pub fn normalized_entropy(counts: &[u32]) -> f64 {
    let total: u64 = counts.iter().map(|&c| u64::from(c)).sum();
    let denom = total as f64 + f64::EPSILON;
    let h: f64 = counts
        .iter()
        .map(|&c| {
            let d = f64::from(c) / denom;
            -d * (d + f64::EPSILON).ln()
        })
        .sum();
    (h / (counts.len() as f64).ln()).clamp(0.0, 1.0)
}

/// Phase-difference entropy per epoch and pair: `(E, C, C)`.
///
/// Each pair's histogram is filled in one pass over the epoch's samples into
/// a flat `(pairs x bins)` count buffer.
pub fn phase_entropy(epochs: &EpochsData, polarity: EntropyPolarity) -> Result<Array3<f64>> {
    check_batch(epochs)?;
    let (n_epochs, n_ch, n_times) = epochs.epochs.dim();
    let hilbert = HilbertTransform::new(n_times);
    let pairs = channel_pairs(n_ch);

    log::debug!("entropy: {n_epochs} epochs x {} pairs", pairs.len());

    let per_epoch: Vec<Array2<f64>> = (0..n_epochs)
        .into_par_iter()
        .map(|e| {
            let epoch = epochs.epochs.index_axis(Axis(0), e);
            let flat = epochs.flat.row(e);
            let phases: Vec<Vec<f64>> = epoch.outer_iter().map(|ch| hilbert.phase(ch)).collect();

            let mut counts = vec![0u32; pairs.len() * ENTROPY_BINS];
            for (hist, &(i, j)) in counts.chunks_exact_mut(ENTROPY_BINS).zip(&pairs) {
                for (a, b) in phases[i].iter().zip(&phases[j]) {
                    hist[bin_index(wrap_phase(a - b))] += 1;
                }
            }

            let mut s = Array2::<f64>::zeros((n_ch, n_ch));
            for (hist, &(i, j)) in counts.chunks_exact(ENTROPY_BINS).zip(&pairs) {
                let value = if flat[i] || flat[j] {
                    f64::NAN
                } else {
                    polarity.apply(normalized_entropy(hist))
                };
                s[[i, j]] = value;
                s[[j, i]] = value;
            }
            s
        })
        .collect();

    let mut out = Array3::<f64>::zeros((n_epochs, n_ch, n_ch));
    for (mut slot, s) in out.outer_iter_mut().zip(per_epoch) {
        slot.assign(&s);
    }
    Ok(out)
}
