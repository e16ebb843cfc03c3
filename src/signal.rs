//! Signal transforms shared by the estimators: zero-phase band-pass
//! filtering, FFT Hilbert analytic signal and complex Morlet wavelets.

use std::f64::consts::PI;
use std::iter::Sum;
use std::sync::Arc;

use ndarray::{Array2, ArrayView1};
use num_traits::{Float, Zero};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use sci_rs::na::RealField;
use sci_rs::signal::filter::{design::*, sosfiltfilt_dyn};

use crate::bands::Band;
use crate::{ContinuousSignal, Result, SyncError};

/// Butterworth order used for band isolation
pub const BANDPASS_ORDER: usize = 4;

// Helper functions
pub fn vec_to_ndarray<T: Clone>(v: Vec<Vec<T>>) -> Result<Array2<T>> {
    if v.is_empty() {
        return Ok(Array2::from_shape_vec((0, 0), Vec::new())?);
    }
    let nrows = v.len();
    let ncols = v[0].len();
    let mut data = Vec::with_capacity(nrows * ncols);
    for row in &v {
        if row.len() != ncols {
            return Err(SyncError::InvalidInput(format!(
                "ragged rows: {} vs {} samples",
                row.len(),
                ncols
            )));
        }
        data.extend_from_slice(row);
    }
    Ok(Array2::from_shape_vec((nrows, ncols), data)?)
}

/// True when every sample equals the first (zero variance)
pub fn is_flat(x: ArrayView1<'_, f64>) -> bool {
    match x.first() {
        Some(&first) => x.iter().all(|&v| v == first),
        None => true,
    }
}

pub fn design_butter_bp<F>(order: usize, lowcut: F, highcut: F, fs: F) -> Result<Vec<Sos<F>>>
where
    F: Float + RealField + Sum,
{
    // Design Second Order Section (SOS) filter
    let filter = butter_dyn(
        order,
        [lowcut, highcut].to_vec(),
        Some(FilterBandType::Bandpass),
        Some(false),
        Some(FilterOutputType::Sos),
        Some(fs),
    );
    let DigitalFilter::Sos(SosFormatFilter { sos }) = filter else {
        return Err(SyncError::Filter(
            "Butterworth design did not return second-order sections".to_string(),
        ));
    };
    Ok(sos)
}

/// Zero-phase Butterworth band-pass of every channel of `signal`.
pub fn bandpass_filter(signal: &ContinuousSignal, band: &Band) -> Result<ContinuousSignal> {
    let sfreq = signal.sfreq();
    let nyquist = sfreq / 2.0;
    if band.low <= 0.0 || band.low >= band.high || band.high >= nyquist {
        return Err(SyncError::InvalidInput(format!(
            "band {band} is not realisable at {sfreq} Hz sampling"
        )));
    }

    let sos = design_butter_bp(BANDPASS_ORDER, band.low, band.high, sfreq)?;
    // filtfilt pads 3 * ntaps samples on both ends
    let min_len = 3 * (2 * sos.len() + 1);
    if signal.n_samples() <= min_len {
        return Err(SyncError::InvalidInput(format!(
            "{} samples are too few to filter (need more than {min_len})",
            signal.n_samples()
        )));
    }

    log::debug!(
        "Band-pass filtering {} channels to {band}",
        signal.ch_names().len()
    );

    let data = signal.data();
    let data_vec_vec: Vec<Vec<f64>> = (0..data.nrows())
        .into_par_iter()
        .map(|ch_idx| sosfiltfilt_dyn(data.row(ch_idx).iter().copied(), &sos))
        .collect();

    signal.with_data(vec_to_ndarray(data_vec_vec)?)
}

/// FFT-based analytic signal for a fixed input length.
///
/// Plans are built once and shared; `Fft` implementations are `Send + Sync`
/// so one transform serves every rayon worker.
pub struct HilbertTransform {
    n: usize,
    fft: Arc<dyn Fft<f64>>,
    ifft: Arc<dyn Fft<f64>>,
}

impl HilbertTransform {
    pub fn new(n: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Self {
            n,
            fft: planner.plan_fft_forward(n),
            ifft: planner.plan_fft_inverse(n),
        }
    }

    /// Analytic signal of `x` (must have the planned length)
    pub fn analytic(&self, x: ArrayView1<'_, f64>) -> Vec<Complex<f64>> {
        debug_assert_eq!(x.len(), self.n);
        let n = self.n;
        let mut buf: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(v, 0.0)).collect();
        self.fft.process(&mut buf);

        // DC and Nyquist kept, positive frequencies doubled, negative zeroed;
        // the 1/n inverse scaling is folded in
        let scale = 1.0 / n as f64;
        for (i, c) in buf.iter_mut().enumerate() {
            let h = if i == 0 || (n % 2 == 0 && i == n / 2) {
                1.0
            } else if i < (n + 1) / 2 {
                2.0
            } else {
                0.0
            };
            *c *= h * scale;
        }

        self.ifft.process(&mut buf);
        buf
    }

    /// Instantaneous phase in (-pi, pi]
    pub fn phase(&self, x: ArrayView1<'_, f64>) -> Vec<f64> {
        self.analytic(x).iter().map(|c| c.arg()).collect()
    }
}

/// Complex Morlet wavelet with `n_cycles` cycles at `freq`, supported on
/// +/- 5 standard deviations of its Gaussian envelope, unit energy.
pub fn morlet(sfreq: f64, freq: f64, n_cycles: f64) -> Vec<Complex<f64>> {
    let sigma_t = n_cycles / (2.0 * PI * freq);
    let half = ((5.0 * sigma_t * sfreq).ceil() as usize).max(1);
    let len = 2 * half - 1;

    let mut w: Vec<Complex<f64>> = (0..len)
        .map(|i| {
            let t = (i as f64 - (half - 1) as f64) / sfreq;
            let envelope = (-t * t / (2.0 * sigma_t * sigma_t)).exp();
            Complex::from_polar(envelope, 2.0 * PI * freq * t)
        })
        .collect();

    let norm = w.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if norm > 0.0 {
        let scale = 1.0 / (0.5f64.sqrt() * norm);
        w.iter_mut().for_each(|c| *c *= scale);
    }
    w
}

/// A bank of Morlet wavelets applied by FFT convolution to fixed-length
/// epochs ("same" alignment: output sample t is centred on input sample t).
pub struct MorletBank {
    n_times: usize,
    nfft: usize,
    offsets: Vec<usize>,
    kernels: Vec<Vec<Complex<f64>>>,
    fft: Arc<dyn Fft<f64>>,
    ifft: Arc<dyn Fft<f64>>,
}

impl MorletBank {
    pub fn new(freqs: &[f64], n_cycles: &[f64], sfreq: f64, n_times: usize) -> Result<Self> {
        if freqs.is_empty() || freqs.len() != n_cycles.len() {
            return Err(SyncError::InvalidInput(format!(
                "{} frequencies for {} cycle counts",
                freqs.len(),
                n_cycles.len()
            )));
        }
        if let Some((&f, &nc)) = freqs
            .iter()
            .zip(n_cycles)
            .find(|&(&f, &nc)| f <= 0.0 || nc <= 0.0 || f >= sfreq / 2.0)
        {
            return Err(SyncError::InvalidInput(format!(
                "cannot build a wavelet at {f} Hz with {nc} cycles (sampling {sfreq} Hz)"
            )));
        }

        let wavelets: Vec<Vec<Complex<f64>>> = freqs
            .iter()
            .zip(n_cycles)
            .map(|(&f, &nc)| morlet(sfreq, f, nc))
            .collect();

        if let Some((f, w)) = freqs.iter().zip(&wavelets).find(|(_, w)| w.len() > n_times) {
            return Err(SyncError::InvalidInput(format!(
                "wavelet at {f} Hz spans {} samples, longer than the {n_times}-sample epoch",
                w.len()
            )));
        }

        let max_len = wavelets.iter().map(Vec::len).max().unwrap_or(1);
        let nfft = n_times + max_len - 1;
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(nfft);
        let ifft = planner.plan_fft_inverse(nfft);

        let offsets = wavelets.iter().map(|w| (w.len() - 1) / 2).collect();
        let kernels = wavelets
            .into_iter()
            .map(|mut w| {
                w.resize(nfft, Complex::zero());
                fft.process(&mut w);
                w
            })
            .collect();

        Ok(Self {
            n_times,
            nfft,
            offsets,
            kernels,
            fft,
            ifft,
        })
    }

    pub fn n_freqs(&self) -> usize {
        self.kernels.len()
    }

    /// Time-frequency coefficients of one channel, shape (freq, time)
    pub fn transform(&self, x: ArrayView1<'_, f64>) -> Array2<Complex<f64>> {
        debug_assert_eq!(x.len(), self.n_times);
        let mut spectrum: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(v, 0.0)).collect();
        spectrum.resize(self.nfft, Complex::zero());
        self.fft.process(&mut spectrum);

        let scale = 1.0 / self.nfft as f64;
        let mut out = Array2::<Complex<f64>>::zeros((self.n_freqs(), self.n_times));
        let mut buf = vec![Complex::zero(); self.nfft];
        for (fi, kernel) in self.kernels.iter().enumerate() {
            for ((b, &s), &k) in buf.iter_mut().zip(&spectrum).zip(kernel) {
                *b = s * k * scale;
            }
            self.ifft.process(&mut buf);
            let off = self.offsets[fi];
            for (t, v) in out.row_mut(fi).iter_mut().enumerate() {
                *v = buf[off + t];
            }
        }
        out
    }
}
