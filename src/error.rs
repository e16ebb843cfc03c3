//! Error types for the connectivity pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by segmentation, estimation and persistence.
///
/// Recoverable per-session conditions (absent file, no matching
/// annotations, unusable crop bounds) are logged and never surface here.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid parameters or input shapes
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A requested channel is not present in the recording
    #[error("Channel {name:?} not found (available: {available:?})")]
    ChannelNotFound {
        /// Requested channel name
        name: String,
        /// Channels present in the signal
        available: Vec<String>,
    },

    /// Nothing left to compute for a subject
    #[error("No epochs found for subject {subject} ({condition})")]
    NoEpochs {
        /// Subject identifier
        subject: String,
        /// Condition label, e.g. `BL_NoG`
        condition: String,
    },

    /// A band contributed zero epochs and cannot be stacked
    #[error("Band {band} produced no epochs; cannot stack bands")]
    EmptyBand {
        /// Band name
        band: &'static str,
    },

    /// A band's result shape disagrees with the first band
    #[error("Band {band} has shape {got:?}, expected {expected:?}")]
    BandShapeMismatch {
        /// Band name
        band: &'static str,
        /// Shape of the offending band
        got: Vec<usize>,
        /// Shape of the reference band
        expected: Vec<usize>,
    },

    /// Persisted metadata differs from the freshly computed values
    #[error("{kind} in {path:?} do not match: saved {saved}, computed {computed}")]
    MetadataMismatch {
        /// Which metadata artifact (`Channel names`, `Frequencies`)
        kind: &'static str,
        /// Path of the existing file
        path: PathBuf,
        /// Rendering of the saved values
        saved: String,
        /// Rendering of the new values
        computed: String,
    },

    /// Malformed or unsupported `.npy` content
    #[error("NPY error in {path:?}: {reason}")]
    Npy {
        /// File being read
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Malformed BrainVision header or marker file
    #[error("Format error in {path:?}: {reason}")]
    Format {
        /// File being parsed
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Filter design failed
    #[error("Filter design failed: {0}")]
    Filter(String),

    /// Array construction with inconsistent dimensions
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Filesystem error
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, SyncError>;
