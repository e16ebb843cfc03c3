//! Result persistence and the metadata consistency guard.
//!
//! Layout per subject:
//!
//! ```text
//! <root>/connectivity_scores<suffix>/<group>/<subject>/
//!     <prefix>connectivity.npy
//!     channel_names.npy
//!     frequencies.npy
//! ```
//!
//! Metadata is shared by every condition written into the same subject
//! directory. Both metadata files are checked before anything is written;
//! a mismatch aborts the save with nothing touched. Concurrent writers to one
//! directory are not supported.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::ArrayD;

use crate::bands::FrequencyAxis;
use crate::config::ConditionFilter;
use crate::npy::{self, NpyArray};
use crate::{Result, SyncError};

pub const SCORES_DIR: &str = "connectivity_scores";
pub const CHANNELS_FILE: &str = "channel_names.npy";
pub const FREQUENCIES_FILE: &str = "frequencies.npy";
pub const DATA_FILE: &str = "connectivity.npy";

/// A connectivity tensor with the metadata describing its axes.
///
/// `data` is `(epoch, channel, channel, frequency)` or, averaged over epochs,
/// `(channel, channel, frequency)`.
#[derive(Debug, Clone)]
pub struct ConnectivityTensor {
    pub data: ArrayD<f64>,
    pub ch_names: Vec<String>,
    pub frequencies: FrequencyAxis,
}

impl ConnectivityTensor {
    pub fn new(data: ArrayD<f64>, ch_names: Vec<String>, frequencies: FrequencyAxis) -> Result<Self> {
        let shape = data.shape();
        let rank = shape.len();
        if !(rank == 3 || rank == 4) {
            return Err(SyncError::InvalidInput(format!(
                "connectivity tensor must have rank 3 or 4, got shape {shape:?}"
            )));
        }
        let n_ch = ch_names.len();
        if shape[rank - 3] != n_ch || shape[rank - 2] != n_ch {
            return Err(SyncError::InvalidInput(format!(
                "tensor shape {shape:?} does not fit {n_ch} channels"
            )));
        }
        if shape[rank - 1] != frequencies.len() {
            return Err(SyncError::InvalidInput(format!(
                "tensor shape {shape:?} does not fit {} frequency entries",
                frequencies.len()
            )));
        }
        Ok(Self {
            data,
            ch_names,
            frequencies,
        })
    }

    /// Whether the epoch axis has been averaged away
    pub fn is_averaged(&self) -> bool {
        self.data.ndim() == 3
    }
}

fn axis_to_npy(axis: &FrequencyAxis) -> NpyArray {
    match axis {
        FrequencyAxis::Bins(f) => NpyArray::Float(ndarray::Array1::from(f.clone()).into_dyn()),
        FrequencyAxis::Bands(b) => NpyArray::Unicode(b.clone()),
    }
}

fn axis_from_npy(path: &Path, array: NpyArray) -> Result<FrequencyAxis> {
    match array {
        NpyArray::Unicode(b) => Ok(FrequencyAxis::Bands(b)),
        NpyArray::Float(f) if f.ndim() == 1 => Ok(FrequencyAxis::Bins(f.iter().copied().collect())),
        NpyArray::Float(f) => Err(SyncError::Npy {
            path: path.to_path_buf(),
            reason: format!("frequency axis must be 1-D, got shape {:?}", f.shape()),
        }),
    }
}

fn render(array: &NpyArray) -> String {
    match array {
        NpyArray::Float(a) => format!("float64 {:?}", a.iter().collect::<Vec<_>>()),
        NpyArray::Unicode(s) => format!("unicode {s:?}"),
    }
}

/// Guard one metadata artifact. Returns `true` when the file is absent and
/// has to be written.
fn check_metadata(kind: &'static str, path: &Path, computed: &NpyArray) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    let saved = npy::read(path)?;
    // dtype, length and values must all agree
    if &saved != computed {
        return Err(SyncError::MetadataMismatch {
            kind,
            path: path.to_path_buf(),
            saved: render(&saved),
            computed: render(computed),
        });
    }
    Ok(false)
}

fn write_npy(path: &Path, array: &NpyArray) -> Result<()> {
    match array {
        NpyArray::Float(a) => npy::write_f64(path, a),
        NpyArray::Unicode(s) => npy::write_strings(path, s),
    }
}

/// Output directory tree rooted at `<root>/connectivity_scores<suffix>`
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
    suffix: String,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            suffix: suffix.into(),
        }
    }

    pub fn scores_dir(&self) -> PathBuf {
        self.root.join(format!("{SCORES_DIR}{}", self.suffix))
    }

    pub fn subject_dir(&self, group: &str, subject: &str) -> PathBuf {
        self.scores_dir().join(group).join(subject)
    }

    pub fn data_path(&self, group: &str, subject: &str, condition: &ConditionFilter) -> PathBuf {
        self.subject_dir(group, subject)
            .join(format!("{}{DATA_FILE}", condition.file_prefix()))
    }

    /// Persist `tensor` for one subject and condition, returning the data
    /// file path. The data file is always overwritten; metadata is written
    /// only if absent and must match otherwise.
    pub fn save(
        &self,
        group: &str,
        subject: &str,
        condition: &ConditionFilter,
        tensor: &ConnectivityTensor,
    ) -> Result<PathBuf> {
        let dir = self.subject_dir(group, subject);
        let channels_path = dir.join(CHANNELS_FILE);
        let freqs_path = dir.join(FREQUENCIES_FILE);

        let channels = NpyArray::Unicode(tensor.ch_names.clone());
        let freqs = axis_to_npy(&tensor.frequencies);

        let write_channels = check_metadata("Channel names", &channels_path, &channels)?;
        let write_freqs = check_metadata("Frequencies", &freqs_path, &freqs)?;

        fs::create_dir_all(&dir).map_err(|e| SyncError::io(&dir, e))?;
        if write_channels {
            write_npy(&channels_path, &channels)?;
            log::info!("Saved channel names to {}", channels_path.display());
        }
        if write_freqs {
            write_npy(&freqs_path, &freqs)?;
            log::info!("Saved frequencies to {}", freqs_path.display());
        }

        let data_path = self.data_path(group, subject, condition);
        npy::write_f64(&data_path, &tensor.data)?;
        log::info!(
            "Saved connectivity {:?} to {}",
            tensor.data.shape(),
            data_path.display()
        );
        Ok(data_path)
    }

    /// Read back a previously saved tensor with its metadata
    pub fn load(
        &self,
        group: &str,
        subject: &str,
        condition: &ConditionFilter,
    ) -> Result<ConnectivityTensor> {
        let dir = self.subject_dir(group, subject);
        let data = npy::read_f64(&self.data_path(group, subject, condition))?;
        let ch_names = npy::read_strings(&dir.join(CHANNELS_FILE))?;
        let freqs_path = dir.join(FREQUENCIES_FILE);
        let frequencies = axis_from_npy(&freqs_path, npy::read(&freqs_path)?)?;
        ConnectivityTensor::new(data, ch_names, frequencies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn tensor(ch: &[&str], freqs: FrequencyAxis, fill: f64) -> ConnectivityTensor {
        let c = ch.len();
        let data = Array4::from_elem((2, c, c, freqs.len()), fill).into_dyn();
        ConnectivityTensor::new(data, names(ch), freqs).unwrap()
    }

    #[test]
    fn layout_follows_condition_prefix() {
        let store = ResultStore::new("/data", "_n2");
        let path = store.data_path("expert", "7", &ConditionFilter::new(true, true));
        assert_eq!(
            path,
            PathBuf::from("/data/connectivity_scores_n2/expert/7/BL_WiG_connectivity.npy")
        );
    }

    #[test]
    fn first_save_writes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path(), "");
        let t = tensor(&["F3", "Fz"], FrequencyAxis::Bins(vec![1.0, 1.5]), 0.3);
        let cond = ConditionFilter::new(false, true);
        let path = store.save("novice", "3", &cond, &t).unwrap();
        assert!(path.ends_with("WiG_connectivity.npy"));

        let back = store.load("novice", "3", &cond).unwrap();
        assert_eq!(back.ch_names, names(&["F3", "Fz"]));
        assert_eq!(back.frequencies, FrequencyAxis::Bins(vec![1.0, 1.5]));
        assert_eq!(back.data, t.data);
    }

    #[test]
    fn channel_mismatch_aborts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path(), "");
        let freqs = FrequencyAxis::canonical_bands();
        let cond = ConditionFilter::new(false, false);

        let first = tensor(&["F3", "Fz"], freqs.clone(), 0.1);
        let path = store.save("expert", "1", &cond, &first).unwrap();
        let before = fs::read(&path).unwrap();

        let second = tensor(&["F3", "Cz"], freqs, 0.9);
        match store.save("expert", "1", &cond, &second) {
            Err(SyncError::MetadataMismatch { kind, .. }) => assert_eq!(kind, "Channel names"),
            other => panic!("expected MetadataMismatch, got {other:?}"),
        }
        assert_eq!(fs::read(&path).unwrap(), before);
        let channels_path = store.subject_dir("expert", "1").join(CHANNELS_FILE);
        let channels = npy::read_strings(&channels_path).unwrap();
        assert_eq!(channels, names(&["F3", "Fz"]));
    }

    #[test]
    fn frequency_kind_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path(), "");
        let cond = ConditionFilter::new(true, false);
        let bins = tensor(&["F3", "Fz"], FrequencyAxis::Bins(vec![0.5; 6]), 0.0);
        store.save("expert", "2", &cond, &bins).unwrap();

        let other = ConditionFilter::new(true, true);
        let bands = tensor(&["F3", "Fz"], FrequencyAxis::canonical_bands(), 0.0);
        match store.save("expert", "2", &other, &bands) {
            Err(SyncError::MetadataMismatch { kind, .. }) => assert_eq!(kind, "Frequencies"),
            other => panic!("expected MetadataMismatch, got {other:?}"),
        }
        assert!(!store.data_path("expert", "2", &other).exists());
    }

    #[test]
    fn matching_metadata_overwrites_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path(), "");
        let cond = ConditionFilter::new(false, false);
        let freqs = FrequencyAxis::Bins(vec![4.0]);
        store.save("g", "s", &cond, &tensor(&["A", "B"], freqs.clone(), 0.1)).unwrap();
        store.save("g", "s", &cond, &tensor(&["A", "B"], freqs, 0.7)).unwrap();
        let back = store.load("g", "s", &cond).unwrap();
        assert!(back.data.iter().all(|&v| v == 0.7));
    }

    #[test]
    fn tensor_shape_must_fit_metadata() {
        let data = Array3::<f64>::zeros((3, 3, 2)).into_dyn();
        let freqs = FrequencyAxis::Bins(vec![1.0, 2.0]);
        assert!(ConnectivityTensor::new(data.clone(), names(&["A", "B", "C"]), freqs.clone()).is_ok());
        assert!(ConnectivityTensor::new(data, names(&["A", "B"]), freqs).is_err());
        let t = ConnectivityTensor::new(
            Array3::<f64>::zeros((3, 3, 1)).into_dyn(),
            names(&["A", "B", "C"]),
            FrequencyAxis::Bins(vec![1.0]),
        )
        .unwrap();
        assert!(t.is_averaged());
    }
}
