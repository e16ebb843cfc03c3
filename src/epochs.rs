use std::collections::HashMap;

use ndarray::{concatenate, s, Array2, Array3, Axis};

use crate::config::{ConditionFilter, EpochConfig};
use crate::signal::is_flat;
use crate::{Annotation, ContinuousSignal, EpochsData, IntervalMarker, Result, SyncError};

/// Substring identifying a span's opening annotation
pub const BEGIN_TOKEN: &str = "beg";
/// Replaces [`BEGIN_TOKEN`] to name the matching closing annotation
pub const END_TOKEN: &str = "end";

/// Pair begin/end annotations of one condition.
///
/// Labels are deduplicated with the last onset winning while the first
/// occurrence fixes the order. A begin label without its end counterpart is
/// dropped.
pub fn resolve_markers(annotations: &[Annotation], condition: &ConditionFilter) -> Vec<IntervalMarker> {
    let mut order: Vec<&str> = Vec::new();
    let mut onsets: HashMap<&str, f64> = HashMap::new();
    for annot in annotations {
        if onsets.insert(annot.label.as_str(), annot.onset).is_none() {
            order.push(annot.label.as_str());
        }
    }

    let mut markers = Vec::new();
    for &label in order
        .iter()
        .filter(|l| l.contains(BEGIN_TOKEN) && condition.matches(l))
    {
        let end_label = label.replace(BEGIN_TOKEN, END_TOKEN);
        match onsets.get(end_label.as_str()) {
            Some(&end_onset) => markers.push(IntervalMarker {
                begin: label.to_string(),
                end: end_label,
                begin_onset: onsets[label],
                end_onset,
            }),
            None => log::info!("Dropping {label:?}: no {end_label:?} annotation"),
        }
    }
    markers
}

/// Number of `win`-sample windows at `step` spacing fully inside `span` samples
pub fn epoch_count(span: usize, win: usize, step: usize) -> usize {
    if win == 0 || step == 0 || span < win {
        return 0;
    }
    (span - win) / step + 1
}

/// Window and step lengths in samples
pub fn window_samples(params: &EpochConfig, sfreq: f64) -> Result<(usize, usize)> {
    params.validate()?;
    let win = (params.duration * sfreq).round() as usize;
    let step = ((params.duration - params.overlap) * sfreq).round() as usize;
    if win == 0 || step == 0 {
        return Err(SyncError::InvalidInput(format!(
            "duration {} s / overlap {} s round to {win}-sample windows with {step}-sample steps at {sfreq} Hz",
            params.duration, params.overlap
        )));
    }
    Ok((win, step))
}

/// Fixed-length epochs from the span `[tmin, tmax]` (seconds, both ends
/// inclusive). A trailing partial window is discarded.
pub fn fixed_length_epochs(
    signal: &ContinuousSignal,
    tmin: f64,
    tmax: f64,
    params: &EpochConfig,
) -> Result<EpochsData> {
    let sfreq = signal.sfreq();
    let (win, step) = window_samples(params, sfreq)?;
    let n_ch = signal.ch_names().len();

    let n_samples = signal.n_samples();
    let start = (tmin.max(0.0) * sfreq).round() as usize;
    let stop = ((tmax * sfreq).round().max(0.0) as usize).min(n_samples.saturating_sub(1));
    let span = if n_samples == 0 || stop < start {
        0
    } else {
        stop - start + 1
    };

    let n_epochs = epoch_count(span, win, step);
    let mut epochs = Array3::<f64>::zeros((n_epochs, n_ch, win));
    let mut starts = Vec::with_capacity(n_epochs);
    for e in 0..n_epochs {
        let first = start + e * step;
        epochs
            .slice_mut(s![e, .., ..])
            .assign(&signal.data().slice(s![.., first..first + win]));
        starts.push(first as f64 / sfreq);
    }

    Ok(EpochsData::new(
        epochs,
        signal.ch_names().to_vec(),
        sfreq,
        params.duration,
        starts,
    ))
}

/// Crop every marker span by the configured margins and cut it into epochs.
///
/// Spans whose crop bounds collapse (end <= begin) or start past the end of
/// the recording are skipped with a warning. No markers yields an empty
/// batch.
pub fn epoch_intervals(
    signal: &ContinuousSignal,
    markers: &[IntervalMarker],
    params: &EpochConfig,
) -> Result<EpochsData> {
    let (win, _) = window_samples(params, signal.sfreq())?;
    let mut batches = vec![EpochsData::empty(
        signal.ch_names().to_vec(),
        signal.sfreq(),
        params.duration,
        win,
    )];

    for marker in markers {
        let tmin = marker.begin_onset + params.margin_start;
        let tmax = marker.end_onset - params.margin_end;
        if tmax <= tmin {
            log::warn!(
                "Skipping {:?}..{:?}: crop bounds {tmin:.3}..{tmax:.3} s are empty",
                marker.begin,
                marker.end
            );
            continue;
        }
        if tmin >= signal.duration() {
            log::warn!(
                "Skipping {:?}: crop start {tmin:.3} s is past the end of the {:.3} s recording",
                marker.begin,
                signal.duration()
            );
            continue;
        }
        if tmax > signal.duration() {
            log::warn!(
                "Clamping {:?}: crop end {tmax:.3} s exceeds the {:.3} s recording",
                marker.end,
                signal.duration()
            );
        }

        let batch = fixed_length_epochs(signal, tmin, tmax, params)?;
        log::debug!(
            "{:?}: {} epochs from {tmin:.3}..{tmax:.3} s",
            marker.begin,
            batch.len()
        );
        batches.push(batch);
    }

    EpochsData::concatenate(&batches)
}

impl EpochsData {
    /// Wrap cut epochs, marking constant windows as flat
    pub fn new(
        epochs: Array3<f64>,
        ch_names: Vec<String>,
        sfreq: f64,
        duration: f64,
        starts: Vec<f64>,
    ) -> Self {
        let (n_epochs, n_ch, _) = epochs.dim();
        let flat = Array2::from_shape_fn((n_epochs, n_ch), |(e, c)| {
            is_flat(epochs.slice(s![e, c, ..]))
        });
        Self {
            epochs,
            flat,
            ch_names,
            sfreq,
            duration,
            starts,
        }
    }

    /// A zero-epoch batch with the given layout
    pub fn empty(ch_names: Vec<String>, sfreq: f64, duration: f64, n_times: usize) -> Self {
        Self {
            epochs: Array3::zeros((0, ch_names.len(), n_times)),
            flat: Array2::from_elem((0, ch_names.len()), false),
            ch_names,
            sfreq,
            duration,
            starts: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.epochs.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_channels(&self) -> usize {
        self.epochs.len_of(Axis(1))
    }

    pub fn n_times(&self) -> usize {
        self.epochs.len_of(Axis(2))
    }

    /// Take the flat mask from a batch cut at the same windows, typically
    /// the unfiltered counterpart of a band-passed batch
    pub fn with_flat_mask(mut self, raw: &EpochsData) -> Result<Self> {
        if raw.flat.dim() != self.flat.dim() || raw.ch_names != self.ch_names {
            return Err(SyncError::InvalidInput(format!(
                "flat mask of {} epochs x {:?} does not fit {} epochs x {:?}",
                raw.len(),
                raw.ch_names,
                self.len(),
                self.ch_names
            )));
        }
        self.flat.assign(&raw.flat);
        Ok(self)
    }

    /// Stack batches along the epoch axis, preserving order
    pub fn concatenate(batches: &[EpochsData]) -> Result<EpochsData> {
        let first = batches.first().ok_or_else(|| {
            SyncError::InvalidInput("cannot concatenate zero epoch batches".to_string())
        })?;
        for other in &batches[1..] {
            if other.ch_names != first.ch_names {
                return Err(SyncError::InvalidInput(format!(
                    "epoch batches disagree on channels: {:?} vs {:?}",
                    first.ch_names, other.ch_names
                )));
            }
            if other.sfreq != first.sfreq || other.n_times() != first.n_times() {
                return Err(SyncError::InvalidInput(format!(
                    "epoch batches disagree on layout: {} Hz x {} samples vs {} Hz x {} samples",
                    first.sfreq,
                    first.n_times(),
                    other.sfreq,
                    other.n_times()
                )));
            }
        }

        let views: Vec<_> = batches.iter().map(|b| b.epochs.view()).collect();
        let flat: Vec<_> = batches.iter().map(|b| b.flat.view()).collect();
        Ok(EpochsData {
            epochs: concatenate(Axis(0), &views)?,
            flat: concatenate(Axis(0), &flat)?,
            ch_names: first.ch_names.clone(),
            sfreq: first.sfreq,
            duration: first.duration,
            starts: batches.iter().flat_map(|b| b.starts.iter().copied()).collect(),
        })
    }

    /// Order-preserving channel selection by name
    pub fn pick_channels<S: AsRef<str>>(&self, names: &[S]) -> Result<EpochsData> {
        let indices = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.ch_names
                    .iter()
                    .position(|ch| ch == name)
                    .ok_or_else(|| SyncError::ChannelNotFound {
                        name: name.to_string(),
                        available: self.ch_names.clone(),
                    })
            })
            .collect::<Result<Vec<usize>>>()?;

        Ok(EpochsData {
            epochs: self.epochs.select(Axis(1), &indices),
            flat: self.flat.select(Axis(1), &indices),
            ch_names: indices.iter().map(|&i| self.ch_names[i].clone()).collect(),
            sfreq: self.sfreq,
            duration: self.duration,
            starts: self.starts.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn ramp_signal(n_ch: usize, seconds: f64, sfreq: f64, annotations: Vec<Annotation>) -> ContinuousSignal {
        let n = (seconds * sfreq) as usize;
        let data = Array2::from_shape_fn((n_ch, n), |(c, t)| (c * 100_000 + t) as f64);
        let names = (0..n_ch).map(|c| format!("Ch{}", c + 1)).collect();
        ContinuousSignal::new(names, sfreq, data, annotations).unwrap()
    }

    fn no_margins(duration: f64, overlap: f64) -> EpochConfig {
        EpochConfig {
            duration,
            overlap,
            margin_start: 0.0,
            margin_end: 0.0,
        }
    }

    #[test]
    fn epoch_count_formula() {
        // L=10s, D=5, O=2.5 at 100 Hz
        assert_eq!(epoch_count(1000, 500, 250), 3);
        assert_eq!(epoch_count(499, 500, 250), 0);
        assert_eq!(epoch_count(500, 500, 250), 1);
        assert_eq!(epoch_count(1249, 500, 250), 3);
        assert_eq!(epoch_count(1250, 500, 250), 4);
    }

    #[test]
    fn ten_second_span_gives_three_epochs() {
        let signal = ramp_signal(2, 20.0, 100.0, vec![]);
        let epochs = fixed_length_epochs(&signal, 0.0, 10.0, &no_margins(5.0, 2.5)).unwrap();
        assert_eq!(epochs.len(), 3);
        assert_eq!(epochs.starts, vec![0.0, 2.5, 5.0]);
        assert_eq!(epochs.n_times(), 500);
        // second epoch starts at sample 250
        assert_eq!(epochs.epochs[[1, 0, 0]], 250.0);
        assert_eq!(epochs.epochs[[1, 1, 0]], 100_250.0);
    }

    #[test]
    fn short_span_gives_no_epochs() {
        let signal = ramp_signal(2, 20.0, 100.0, vec![]);
        let epochs = fixed_length_epochs(&signal, 1.0, 4.0, &no_margins(5.0, 2.5)).unwrap();
        assert!(epochs.is_empty());
        assert_eq!(epochs.epochs.dim(), (0, 2, 500));
    }

    #[test]
    fn markers_pair_by_token_substitution() {
        let annotations = vec![
            Annotation::new("0, BL_NoG_beg###TEST", 1.0),
            Annotation::new("0, NoG_beg", 30.0),
            Annotation::new("0, BL_NoG_end###TEST", 20.0),
            Annotation::new("0, NoG_end", 50.0),
            Annotation::new("1, NoG_beg", 60.0),
        ];
        let markers = resolve_markers(&annotations, &ConditionFilter::new(false, false));
        // "1, NoG_beg" has no end and is dropped; the BL span is filtered out
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].begin, "0, NoG_beg");
        assert_eq!(markers[0].end, "0, NoG_end");
        assert_eq!((markers[0].begin_onset, markers[0].end_onset), (30.0, 50.0));

        let bl = resolve_markers(&annotations, &ConditionFilter::new(true, false));
        assert_eq!(bl.len(), 1);
        assert_eq!(bl[0].end_onset, 20.0);
    }

    #[test]
    fn duplicate_labels_keep_last_onset() {
        let annotations = vec![
            Annotation::new("WiG_beg", 1.0),
            Annotation::new("WiG_end", 5.0),
            Annotation::new("WiG_beg", 10.0),
            Annotation::new("WiG_end", 25.0),
        ];
        let markers = resolve_markers(&annotations, &ConditionFilter::new(false, true));
        assert_eq!(markers.len(), 1);
        assert_eq!((markers[0].begin_onset, markers[0].end_onset), (10.0, 25.0));
    }

    #[test]
    fn intervals_apply_margins_and_skip_empty_crops() {
        let annotations = vec![
            Annotation::new("NoG_beg", 0.0),
            Annotation::new("NoG_end", 13.0),
            // crop collapses: 40 + 2 > 42 - 1
            Annotation::new("2, NoG_beg", 40.0),
            Annotation::new("2, NoG_end", 42.0),
        ];
        let signal = ramp_signal(2, 60.0, 100.0, annotations);
        let markers = resolve_markers(signal.annotations(), &ConditionFilter::new(false, false));
        assert_eq!(markers.len(), 2);

        let epochs = epoch_intervals(&signal, &markers, &EpochConfig::default()).unwrap();
        // crop 2..12 s -> 10 s span -> 3 epochs
        assert_eq!(epochs.len(), 3);
        assert_eq!(epochs.starts, vec![2.0, 4.5, 7.0]);
    }

    #[test]
    fn span_starting_after_recording_is_skipped() {
        let annotations = vec![
            Annotation::new("NoG_beg", 0.0),
            Annotation::new("NoG_end", 13.0),
            // crop would start at 32 s in a 30 s recording
            Annotation::new("2, NoG_beg", 30.0),
            Annotation::new("2, NoG_end", 50.0),
        ];
        let signal = ramp_signal(2, 30.0, 100.0, annotations);
        let markers = resolve_markers(signal.annotations(), &ConditionFilter::new(false, false));
        assert_eq!(markers.len(), 2);

        let epochs = epoch_intervals(&signal, &markers, &EpochConfig::default()).unwrap();
        assert_eq!(epochs.starts, vec![2.0, 4.5, 7.0]);

        let late = epoch_intervals(&signal, &markers[1..], &EpochConfig::default()).unwrap();
        assert!(late.is_empty());
        assert_eq!(late.flat.dim(), (0, 2));
    }

    #[test]
    fn constant_windows_are_marked_flat() {
        let mut signal = ramp_signal(3, 20.0, 100.0, vec![]);
        let mut data = signal.data().clone();
        // Ch2 constant over the first 5 s only
        data.slice_mut(s![1, ..500]).fill(7.0);
        signal = signal.with_data(data).unwrap();

        let epochs = fixed_length_epochs(&signal, 0.0, 10.0, &no_margins(5.0, 2.5)).unwrap();
        assert_eq!(epochs.flat.dim(), (3, 3));
        assert!(epochs.flat[[0, 1]]);
        assert!(!epochs.flat[[1, 1]]);
        assert!(!epochs.flat[[0, 0]]);

        let picked = epochs.pick_channels(&["Ch2", "Ch1"]).unwrap();
        assert!(picked.flat[[0, 0]]);
        assert!(!picked.flat[[0, 1]]);

        // a filtered copy is never bit-exactly constant
        let filtered = EpochsData::new(
            Array3::from_shape_fn(epochs.epochs.dim(), |(e, c, t)| {
                epochs.epochs[[e, c, t]] + t as f64 * 1e-9
            }),
            epochs.ch_names.clone(),
            epochs.sfreq,
            epochs.duration,
            epochs.starts.clone(),
        );
        assert!(!filtered.flat[[0, 1]]);
        let masked = filtered.with_flat_mask(&epochs).unwrap();
        assert!(masked.flat[[0, 1]]);
    }

    #[test]
    fn no_markers_is_an_empty_batch() {
        let signal = ramp_signal(3, 30.0, 100.0, vec![]);
        let epochs = epoch_intervals(&signal, &[], &EpochConfig::default()).unwrap();
        assert!(epochs.is_empty());
        assert_eq!(epochs.n_channels(), 3);
    }

    #[test]
    fn crop_end_is_clamped_to_recording() {
        let annotations = vec![Annotation::new("NoG_beg", 0.0), Annotation::new("NoG_end", 100.0)];
        let signal = ramp_signal(2, 12.0, 100.0, annotations);
        let markers = resolve_markers(signal.annotations(), &ConditionFilter::new(false, false));
        let epochs = epoch_intervals(&signal, &markers, &EpochConfig::default()).unwrap();
        // crop 2 s .. last sample (11.99 s) -> 1000 samples -> 3 epochs
        assert_eq!(epochs.len(), 3);
    }

    #[test]
    fn concatenate_preserves_order() {
        let signal = ramp_signal(2, 30.0, 100.0, vec![]);
        let params = no_margins(5.0, 0.0);
        let a = fixed_length_epochs(&signal, 10.0, 20.0, &params).unwrap();
        let b = fixed_length_epochs(&signal, 0.0, 5.0, &params).unwrap();
        let all = EpochsData::concatenate(&[a, b]).unwrap();
        assert_eq!(all.starts, vec![10.0, 15.0, 0.0]);
        assert_eq!(all.epochs[[2, 0, 0]], 0.0);
    }

    #[test]
    fn concatenate_rejects_mismatched_channels() {
        let a = EpochsData::empty(vec!["A".into(), "B".into()], 100.0, 1.0, 100);
        let b = EpochsData::empty(vec!["A".into(), "C".into()], 100.0, 1.0, 100);
        assert!(EpochsData::concatenate(&[a, b]).is_err());
    }

    #[test]
    fn pick_channels_preserves_requested_order() {
        let signal = ramp_signal(4, 10.0, 100.0, vec![]);
        let epochs = fixed_length_epochs(&signal, 0.0, 5.0, &no_margins(5.0, 0.0)).unwrap();
        let picked = epochs.pick_channels(&["Ch3", "Ch1"]).unwrap();
        assert_eq!(picked.ch_names, vec!["Ch3", "Ch1"]);
        assert_eq!(picked.epochs[[0, 0, 0]], 200_000.0);
        assert_eq!(picked.epochs[[0, 1, 0]], 0.0);
    }

    #[test]
    fn pick_missing_channel_is_fatal() {
        let signal = ramp_signal(2, 10.0, 100.0, vec![]);
        let epochs = fixed_length_epochs(&signal, 0.0, 5.0, &no_margins(5.0, 0.0)).unwrap();
        let err = epochs.pick_channels(&["Cz"]).unwrap_err();
        assert!(matches!(err, SyncError::ChannelNotFound { ref name, .. } if name == "Cz"));
    }
}
