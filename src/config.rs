//! Run configuration for one subject/condition computation

use std::path::PathBuf;

use crate::synchrony::{EntropyPolarity, LockingMeasure, SynchronyMethod};
use crate::{Result, SyncError};

/// Electrodes of interest, in matrix row/column order.
pub const DEFAULT_CHANNELS: [&str; 12] = [
    "F3", "Fz", "F4", "FCz", "Cz", "CP3", "CP4", "P1", "Pz", "P2", "PPO1", "PPO2",
];

/// Baseline / gesture condition selecting which annotation spans are used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionFilter {
    /// Resting-state baseline spans (`BL` in the label)
    pub baseline: bool,
    /// Spans with gestures (`WiG`) rather than without (`NoG`)
    pub gestures: bool,
}

impl ConditionFilter {
    pub const BASELINE_TAG: &'static str = "BL";

    pub fn new(baseline: bool, gestures: bool) -> Self {
        Self { baseline, gestures }
    }

    pub fn gesture_tag(&self) -> &'static str {
        if self.gestures {
            "WiG"
        } else {
            "NoG"
        }
    }

    /// Whether an annotation label belongs to this condition
    pub fn matches(&self, label: &str) -> bool {
        label.contains(self.gesture_tag())
            && label.contains(Self::BASELINE_TAG) == self.baseline
    }

    /// `BL_NoG`, `WiG`, ...
    pub fn label(&self) -> String {
        if self.baseline {
            format!("{}_{}", Self::BASELINE_TAG, self.gesture_tag())
        } else {
            self.gesture_tag().to_string()
        }
    }

    /// Output file prefix, e.g. `BL_NoG_`
    pub fn file_prefix(&self) -> String {
        format!("{}_", self.label())
    }

    /// All four conditions in a stable order
    pub fn all() -> [ConditionFilter; 4] {
        [
            ConditionFilter::new(true, false),
            ConditionFilter::new(true, true),
            ConditionFilter::new(false, false),
            ConditionFilter::new(false, true),
        ]
    }
}

/// Segmentation parameters, all in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochConfig {
    /// Epoch length D
    pub duration: f64,
    /// Overlap O between consecutive epochs, 0 <= O < D
    pub overlap: f64,
    /// Clipped after each begin marker (onset jitter)
    pub margin_start: f64,
    /// Clipped before each end marker
    pub margin_end: f64,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            duration: 5.0,
            overlap: 2.5,
            margin_start: 2.0,
            margin_end: 1.0,
        }
    }
}

impl EpochConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.duration.is_finite() && self.duration > 0.0) {
            return Err(SyncError::InvalidInput(format!(
                "epoch duration must be positive, got {}",
                self.duration
            )));
        }
        if !(self.overlap >= 0.0 && self.overlap < self.duration) {
            return Err(SyncError::InvalidInput(format!(
                "epoch overlap must lie in [0, {}), got {}",
                self.duration, self.overlap
            )));
        }
        if !(self.margin_start.is_finite() && self.margin_end.is_finite()) {
            return Err(SyncError::InvalidInput("crop margins must be finite".to_string()));
        }
        Ok(())
    }
}

/// How the frequency axis is built
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrequencyScheme {
    /// Linear 0.5 Hz sweep between the bounds, computed in one pass
    Sweep { min_freq: f64, max_freq: f64 },
    /// The six canonical bands, each filtered and estimated separately
    Bands,
}

impl FrequencyScheme {
    pub fn name(&self) -> &'static str {
        match self {
            FrequencyScheme::Sweep { .. } => "sweep",
            FrequencyScheme::Bands => "bands",
        }
    }
}

/// Everything one invocation needs
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root data directory (`processed/` inputs, `connectivity_scores*/` outputs)
    pub root_dir: PathBuf,
    /// Subject group, e.g. `expert` / `novice`
    pub group: String,
    /// Subject identifier
    pub subject: String,
    /// Optional tag in the session file name, `<session>_<tag>_raw.vhdr`
    pub input_tag: Option<String>,
    /// Sessions 1..=n_sessions are tried; absent ones are skipped
    pub n_sessions: usize,
    pub condition: ConditionFilter,
    pub epochs: EpochConfig,
    /// Channel subset, in output order
    pub channels: Vec<String>,
    pub method: SynchronyMethod,
    pub scheme: FrequencyScheme,
    /// Wavelet cycles are `freq / cycles_numerator`
    pub cycles_numerator: f64,
    /// Average over epochs before writing
    pub average: bool,
    /// Appended to `connectivity_scores` so parameter sweeps can coexist
    pub dir_suffix: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("data"),
            group: "expert".to_string(),
            subject: "1".to_string(),
            input_tag: None,
            n_sessions: 4,
            condition: ConditionFilter::new(false, false),
            epochs: EpochConfig::default(),
            channels: DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
            method: SynchronyMethod::Locking(LockingMeasure::Plv),
            scheme: FrequencyScheme::Sweep {
                min_freq: 0.5,
                max_freq: 30.0,
            },
            cycles_numerator: 4.0,
            average: false,
            dir_suffix: String::new(),
        }
    }
}

impl RunConfig {
    /// Entropy over band-filtered signals with the default polarity
    pub fn entropy_bands() -> Self {
        Self {
            method: SynchronyMethod::Entropy(EntropyPolarity::default()),
            scheme: FrequencyScheme::Bands,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.epochs.validate()?;
        if self.channels.len() < 2 {
            return Err(SyncError::InvalidInput(format!(
                "need at least 2 channels to pair, got {}",
                self.channels.len()
            )));
        }
        if self.n_sessions == 0 {
            return Err(SyncError::InvalidInput("no sessions to process".to_string()));
        }
        if !(self.cycles_numerator.is_finite() && self.cycles_numerator > 0.0) {
            return Err(SyncError::InvalidInput(format!(
                "cycles numerator must be positive, got {}",
                self.cycles_numerator
            )));
        }
        if matches!(self.method, SynchronyMethod::Entropy(_))
            && !matches!(self.scheme, FrequencyScheme::Bands)
        {
            return Err(SyncError::InvalidInput(
                "the entropy estimator has no frequency axis; use the band scheme".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_matching() {
        let bl_nog = ConditionFilter::new(true, false);
        assert!(bl_nog.matches("0, BL_NoG_beg###TEST"));
        assert!(!bl_nog.matches("0, NoG_beg###TEST"));
        assert!(!bl_nog.matches("0, BL_WiG_beg###TEST"));

        let wig = ConditionFilter::new(false, true);
        assert!(wig.matches("3, WiG_beg"));
        assert!(!wig.matches("3, BL_WiG_beg"));
    }

    #[test]
    fn condition_prefixes() {
        assert_eq!(ConditionFilter::new(true, false).file_prefix(), "BL_NoG_");
        assert_eq!(ConditionFilter::new(true, true).file_prefix(), "BL_WiG_");
        assert_eq!(ConditionFilter::new(false, false).file_prefix(), "NoG_");
        assert_eq!(ConditionFilter::new(false, true).file_prefix(), "WiG_");
    }

    #[test]
    fn epoch_config_bounds() {
        assert!(EpochConfig::default().validate().is_ok());
        let bad_overlap = EpochConfig {
            overlap: 5.0,
            ..EpochConfig::default()
        };
        assert!(bad_overlap.validate().is_err());
        let bad_duration = EpochConfig {
            duration: 0.0,
            ..EpochConfig::default()
        };
        assert!(bad_duration.validate().is_err());
    }

    #[test]
    fn entropy_requires_bands() {
        let mut cfg = RunConfig::entropy_bands();
        assert!(cfg.validate().is_ok());
        cfg.scheme = FrequencyScheme::Sweep {
            min_freq: 1.0,
            max_freq: 2.0,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn single_channel_rejected() {
        let cfg = RunConfig {
            channels: vec!["Cz".to_string()],
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
