//! # reesync
//!
//! Pairwise phase-synchrony connectivity between EEG electrodes, computed
//! per epoch and per frequency (sweep bins or canonical bands) and written
//! as `.npy` tensors for group statistics.
//!
//! ```text
//! SignalSource → markers → crop + fixed-length epochs → pick channels
//!     → synchrony estimator (PLV family | phase-difference entropy)
//!     → band stacking / sweep → consistency guard → .npy
//! ```

#![warn(clippy::all, rust_2018_idioms)]

use std::collections::HashSet;

use ndarray::{Array2, Array3};

pub mod aggregate;
pub mod bands;
pub mod config;
pub mod dataset;
pub mod epochs;
pub mod error;
pub mod io;
pub mod npy;
pub mod pipeline;
pub mod signal;
pub mod store;
pub mod synchrony;

pub use bands::{Band, FrequencyAxis, CANONICAL_BANDS};
pub use config::{ConditionFilter, FrequencyScheme, RunConfig};
pub use error::{Result, SyncError};
pub use synchrony::{EntropyPolarity, LockingMeasure, SynchronyMethod};

/// Channel layout and sampling rate of a recording
#[derive(Debug, Clone, PartialEq)]
pub struct EEGInfo {
    pub ch_names: Vec<String>,
    pub sfreq: f64,
}

/// A labelled event boundary, `onset` in seconds from the first sample
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub label: String,
    pub onset: f64,
}

impl Annotation {
    pub fn new(label: impl Into<String>, onset: f64) -> Self {
        Self {
            label: label.into(),
            onset,
        }
    }
}

/// Continuous multichannel recording with its annotations.
///
/// Built through [`ContinuousSignal::new`], which rejects duplicate channel
/// names and shape mismatches. Not mutated afterwards; band filtering
/// produces a new signal via [`ContinuousSignal::with_data`].
#[derive(Debug, Clone)]
pub struct ContinuousSignal {
    info: EEGInfo,
    data: Array2<f64>,
    annotations: Vec<Annotation>,
}

impl ContinuousSignal {
    pub fn new(
        ch_names: Vec<String>,
        sfreq: f64,
        data: Array2<f64>,
        annotations: Vec<Annotation>,
    ) -> Result<Self> {
        if sfreq <= 0.0 || !sfreq.is_finite() {
            return Err(SyncError::InvalidInput(format!(
                "sample rate must be positive, got {sfreq}"
            )));
        }
        if data.nrows() != ch_names.len() {
            return Err(SyncError::InvalidInput(format!(
                "{} channel names for {} data rows",
                ch_names.len(),
                data.nrows()
            )));
        }
        let mut seen = HashSet::new();
        for name in &ch_names {
            if !seen.insert(name.as_str()) {
                return Err(SyncError::InvalidInput(format!(
                    "duplicate channel name {name:?}"
                )));
            }
        }
        Ok(Self {
            info: EEGInfo { ch_names, sfreq },
            data,
            annotations,
        })
    }

    /// Same channels and annotations over new samples of identical shape
    pub fn with_data(&self, data: Array2<f64>) -> Result<Self> {
        if data.dim() != self.data.dim() {
            return Err(SyncError::InvalidInput(format!(
                "replacement data has shape {:?}, expected {:?}",
                data.dim(),
                self.data.dim()
            )));
        }
        Ok(Self {
            info: self.info.clone(),
            data,
            annotations: self.annotations.clone(),
        })
    }

    pub fn ch_names(&self) -> &[String] {
        &self.info.ch_names
    }

    pub fn sfreq(&self) -> f64 {
        self.info.sfreq
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    /// Recording length in seconds
    pub fn duration(&self) -> f64 {
        self.n_samples() as f64 / self.info.sfreq
    }

    pub fn channel_index(&self, name: &str) -> Result<usize> {
        self.info
            .ch_names
            .iter()
            .position(|ch| ch == name)
            .ok_or_else(|| SyncError::ChannelNotFound {
                name: name.to_string(),
                available: self.info.ch_names.clone(),
            })
    }

    /// Order-preserving channel subset; annotations are kept
    pub fn pick_channels<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let indices = names
            .iter()
            .map(|name| self.channel_index(name.as_ref()))
            .collect::<Result<Vec<usize>>>()?;
        Self::new(
            indices.iter().map(|&i| self.info.ch_names[i].clone()).collect(),
            self.info.sfreq,
            self.data.select(ndarray::Axis(0), &indices),
            self.annotations.clone(),
        )
    }
}

/// A (begin, end) annotation pair delimiting one span of interest
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalMarker {
    pub begin: String,
    pub end: String,
    pub begin_onset: f64,
    pub end_onset: f64,
}

/// A batch of fixed-length epochs, `epochs` is (epoch, channel, sample).
///
/// `starts` holds each epoch's offset in seconds from the start of the
/// signal it was cut from. `flat` is (epoch, channel) and marks windows
/// whose unfiltered samples are constant.
#[derive(Debug, Clone)]
pub struct EpochsData {
    pub epochs: Array3<f64>,
    pub flat: Array2<bool>,
    pub ch_names: Vec<String>,
    pub sfreq: f64,
    pub duration: f64,
    pub starts: Vec<f64>,
}
