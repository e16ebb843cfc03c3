//! Group-level read-back of persisted connectivity tensors.
//!
//! Every subject directory under `<scores>/<group>/` contributes one
//! epoch-averaged `(C, C, F)` array per condition. Subjects missing any of
//! the four condition files are skipped.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;

use ndarray::{stack, Array1, Array3, Array4, ArrayD, ArrayView1, ArrayView3, Axis, Ix4};

use crate::bands::{Band, FrequencyAxis};
use crate::config::ConditionFilter;
use crate::store::{ConnectivityTensor, ResultStore};
use crate::{Result, SyncError};

/// Guards the min-max denominator against constant baselines
const NORM_EPS: f64 = 1e-6;

/// Positions of `BL_NoG` and `BL_WiG` in [`ConditionFilter::all`]
const BASELINE_CONDITIONS: [usize; 2] = [0, 1];

/// Group plus condition, the first level of the dataset
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConditionKey {
    pub group: String,
    pub baseline: bool,
    pub gestures: bool,
}

impl ConditionKey {
    pub fn new(group: impl Into<String>, condition: ConditionFilter) -> Self {
        Self {
            group: group.into(),
            baseline: condition.baseline,
            gestures: condition.gestures,
        }
    }

    pub fn condition(&self) -> ConditionFilter {
        ConditionFilter::new(self.baseline, self.gestures)
    }
}

/// Electrode given by name or by matrix index
#[derive(Debug, Clone, PartialEq)]
pub enum Electrode {
    Name(String),
    Index(usize),
}

impl From<&str> for Electrode {
    fn from(name: &str) -> Self {
        Electrode::Name(name.to_string())
    }
}

impl From<usize> for Electrode {
    fn from(idx: usize) -> Self {
        Electrode::Index(idx)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatasetOptions {
    /// Scale every condition by the element-wise min/max of the subject's
    /// two baseline conditions
    pub normalize: bool,
    /// Subject ids to leave out, per group
    pub excludes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct GroupDataset {
    pub ch_names: Vec<String>,
    pub frequencies: FrequencyAxis,
    subjects: BTreeMap<ConditionKey, BTreeMap<String, Array3<f64>>>,
}

/// Lane min or max; any NaN makes the result NaN, as numpy does
fn nan_reduce(lane: ArrayView1<'_, f64>, pick: fn(f64, f64) -> f64) -> f64 {
    if lane.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    lane.iter().copied().reduce(pick).unwrap_or(f64::NAN)
}

/// Element-wise min-max scaling of all four conditions by the baseline pair.
/// Tensors must still carry their epoch axis.
fn normalize(tensors: &mut [ArrayD<f64>; 4], baseline: [usize; 2]) -> Result<()> {
    let views = baseline
        .iter()
        .map(|&i| tensors[i].view().into_dimensionality::<Ix4>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| {
            SyncError::InvalidInput("normalization needs per-epoch (rank 4) tensors".to_string())
        })?;
    let all_bl = ndarray::concatenate(Axis(0), &views)?;
    if all_bl.dim().0 == 0 {
        return Err(SyncError::InvalidInput("baseline conditions hold no epochs".to_string()));
    }

    let min = all_bl.map_axis(Axis(0), |lane| nan_reduce(lane, f64::min));
    let max = all_bl.map_axis(Axis(0), |lane| nan_reduce(lane, f64::max));
    let scale = &max - &min + NORM_EPS;

    for t in tensors.iter_mut() {
        let mut t4 = t.view_mut().into_dimensionality::<Ix4>().map_err(|_| {
            SyncError::InvalidInput("normalization needs per-epoch (rank 4) tensors".to_string())
        })?;
        for mut epoch in t4.outer_iter_mut() {
            epoch -= &min;
            epoch /= &scale;
        }
    }
    Ok(())
}

/// Per-subject epoch mean; averaged tensors are taken as they are
fn epoch_mean(tensor: ArrayD<f64>) -> Result<Array3<f64>> {
    let mean = if tensor.ndim() == 4 {
        tensor.mean_axis(Axis(0)).ok_or_else(|| {
            SyncError::InvalidInput("cannot average a tensor with no epochs".to_string())
        })?
    } else {
        tensor
    };
    Ok(mean.into_dimensionality()?)
}

fn is_not_found(err: &SyncError) -> bool {
    matches!(err, SyncError::Io { source, .. } if source.kind() == ErrorKind::NotFound)
}

impl GroupDataset {
    /// Load every subject of `groups` from the store's score directory
    pub fn load(store: &ResultStore, groups: &[&str], options: &DatasetOptions) -> Result<Self> {
        let conditions = ConditionFilter::all();

        let mut metadata: Option<(Vec<String>, FrequencyAxis)> = None;
        let mut subjects: BTreeMap<ConditionKey, BTreeMap<String, Array3<f64>>> = BTreeMap::new();

        for &group in groups {
            let group_dir = store.scores_dir().join(group);
            let entries = fs::read_dir(&group_dir).map_err(|e| SyncError::io(&group_dir, e))?;
            let mut ids: Vec<String> = entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_dir())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            ids.sort();

            let excluded = options.excludes.get(group);
            for id in ids {
                if excluded.is_some_and(|ex| ex.contains(&id)) {
                    log::info!("Excluding {group}/{id}");
                    continue;
                }

                let mut loaded: Vec<ConnectivityTensor> = Vec::with_capacity(4);
                let mut missing = false;
                for condition in &conditions {
                    match store.load(group, &id, condition) {
                        Ok(t) => loaded.push(t),
                        Err(e) if is_not_found(&e) => {
                            log::warn!("Skipping {group}/{id}: {e}");
                            missing = true;
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                if missing {
                    continue;
                }

                let subject_dir = store.subject_dir(group, &id);
                match &metadata {
                    None => {
                        metadata = Some((loaded[0].ch_names.clone(), loaded[0].frequencies.clone()))
                    }
                    Some((names, freqs)) => {
                        if &loaded[0].ch_names != names {
                            return Err(SyncError::MetadataMismatch {
                                kind: "Channel names",
                                path: subject_dir,
                                saved: format!("{names:?}"),
                                computed: format!("{:?}", loaded[0].ch_names),
                            });
                        }
                        if &loaded[0].frequencies != freqs {
                            return Err(SyncError::MetadataMismatch {
                                kind: "Frequencies",
                                path: subject_dir,
                                saved: freqs.to_string(),
                                computed: loaded[0].frequencies.to_string(),
                            });
                        }
                    }
                }

                let mut tensors: [ArrayD<f64>; 4] = loaded
                    .into_iter()
                    .map(|t| t.data)
                    .collect::<Vec<_>>()
                    .try_into()
                    .map_err(|_| SyncError::InvalidInput(format!("{group}/{id}: expected 4 conditions")))?;
                if options.normalize {
                    normalize(&mut tensors, BASELINE_CONDITIONS)?;
                }

                for (condition, tensor) in conditions.iter().zip(tensors) {
                    subjects
                        .entry(ConditionKey::new(group, *condition))
                        .or_default()
                        .insert(id.clone(), epoch_mean(tensor)?);
                }
                log::debug!("Loaded {group}/{id}");
            }
        }

        let (ch_names, frequencies) = metadata.ok_or_else(|| {
            SyncError::InvalidInput(format!(
                "no complete subjects under {}",
                store.scores_dir().display()
            ))
        })?;
        Ok(Self {
            ch_names,
            frequencies,
            subjects,
        })
    }

    /// Subject ids for a key, in array order
    pub fn subject_ids(&self, key: &ConditionKey) -> Vec<&str> {
        self.subjects
            .get(key)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// `(subject, C, C, F)` for one group and condition
    pub fn group_array(&self, key: &ConditionKey) -> Result<Array4<f64>> {
        let per_subject = self
            .subjects
            .get(key)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| SyncError::InvalidInput(format!("no subjects for {key:?}")))?;
        let views: Vec<ArrayView3<'_, f64>> = per_subject.values().map(|a| a.view()).collect();
        Ok(stack(Axis(0), &views)?)
    }

    /// `(subject, C, C)`: the band's entry on a symbolic axis, the mean over
    /// the bins inside `[low, high]` on a numeric one
    pub fn band_slice(&self, key: &ConditionKey, band: &Band) -> Result<Array3<f64>> {
        let data = self.group_array(key)?;
        let idx = self.frequencies.band_indices(band);
        if idx.is_empty() {
            return Err(SyncError::InvalidInput(format!(
                "{band} is not covered by the frequency axis {}",
                self.frequencies
            )));
        }
        data.select(Axis(3), &idx)
            .mean_axis(Axis(3))
            .ok_or_else(|| SyncError::InvalidInput(format!("empty selection for {band}")))
    }

    pub fn electrode_index(&self, electrode: &Electrode) -> Result<usize> {
        match electrode {
            Electrode::Index(i) if *i < self.ch_names.len() => Ok(*i),
            Electrode::Index(i) => Err(SyncError::InvalidInput(format!(
                "electrode index {i} out of range for {} channels",
                self.ch_names.len()
            ))),
            Electrode::Name(name) => self
                .ch_names
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| SyncError::ChannelNotFound {
                    name: name.clone(),
                    available: self.ch_names.clone(),
                }),
        }
    }

    /// Per-subject band values for one electrode pair, read from the lower
    /// triangle
    pub fn pair_values(
        &self,
        key: &ConditionKey,
        band: &Band,
        a: impl Into<Electrode>,
        b: impl Into<Electrode>,
    ) -> Result<Array1<f64>> {
        let i = self.electrode_index(&a.into())?;
        let j = self.electrode_index(&b.into())?;
        let (row, col) = if i < j { (j, i) } else { (i, j) };
        let slice = self.band_slice(key, band)?;
        Ok(slice.slice(ndarray::s![.., row, col]).to_owned())
    }
}
