//! Frequency bands and frequency axes.

use std::fmt;

use ndarray::Array1;

use crate::{Result, SyncError};

/// A named EEG frequency band, edges in Hz
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub name: &'static str,
    pub low: f64,
    pub high: f64,
}

impl Band {
    pub const fn new(name: &'static str, low: f64, high: f64) -> Self {
        Self { name, low, high }
    }

    pub fn contains(&self, freq: f64) -> bool {
        freq >= self.low && freq <= self.high
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}-{} Hz)", self.name, self.low, self.high)
    }
}

/// Bands stacked along the trailing tensor axis, in this order.
pub const CANONICAL_BANDS: [Band; 6] = [
    Band::new("delta", 0.5, 4.0),
    Band::new("theta", 4.0, 8.0),
    Band::new("low alpha", 8.0, 10.0),
    Band::new("high alpha", 10.0, 13.0),
    Band::new("low beta", 13.0, 20.0),
    Band::new("high beta", 20.0, 30.0),
];

pub fn band_by_name(name: &str) -> Option<Band> {
    CANONICAL_BANDS.iter().copied().find(|b| b.name == name)
}

/// Linear sweep from `min_freq` to `max_freq` inclusive at 0.5 Hz spacing:
/// `floor((max - min) * 2) + 1` points.
pub fn frequency_sweep(min_freq: f64, max_freq: f64) -> Result<Vec<f64>> {
    if !(min_freq.is_finite() && max_freq.is_finite()) || min_freq <= 0.0 {
        return Err(SyncError::InvalidInput(format!(
            "frequency bounds must be finite and positive, got {min_freq}..{max_freq}"
        )));
    }
    if max_freq < min_freq {
        return Err(SyncError::InvalidInput(format!(
            "max frequency {max_freq} is below min frequency {min_freq}"
        )));
    }
    let count = ((max_freq - min_freq) * 2.0).floor() as usize + 1;
    if count == 1 {
        return Ok(vec![min_freq]);
    }
    Ok(Array1::linspace(min_freq, max_freq, count).to_vec())
}

/// The frequency axis persisted next to a connectivity tensor
#[derive(Debug, Clone, PartialEq)]
pub enum FrequencyAxis {
    /// Sweep bin centres in Hz
    Bins(Vec<f64>),
    /// Symbolic band names
    Bands(Vec<String>),
}

impl FrequencyAxis {
    pub fn canonical_bands() -> Self {
        FrequencyAxis::Bands(CANONICAL_BANDS.iter().map(|b| b.name.to_string()).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            FrequencyAxis::Bins(f) => f.len(),
            FrequencyAxis::Bands(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices along this axis covered by `band`
    pub fn band_indices(&self, band: &Band) -> Vec<usize> {
        match self {
            FrequencyAxis::Bins(freqs) => freqs
                .iter()
                .enumerate()
                .filter(|&(_, &f)| band.contains(f))
                .map(|(i, _)| i)
                .collect(),
            FrequencyAxis::Bands(names) => names
                .iter()
                .position(|n| n == band.name)
                .into_iter()
                .collect(),
        }
    }
}

impl fmt::Display for FrequencyAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrequencyAxis::Bins(freqs) => write!(f, "{freqs:?}"),
            FrequencyAxis::Bands(names) => write!(f, "{names:?}"),
        }
    }
}
