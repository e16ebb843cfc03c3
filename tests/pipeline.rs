use std::f64::consts::PI;
use std::fs;
use std::path::Path;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use reesync::dataset::{ConditionKey, DatasetOptions, GroupDataset};
use reesync::io::{write_brainvision, SessionLayout};
use reesync::npy;
use reesync::pipeline::run_subject;
use reesync::store::{ResultStore, CHANNELS_FILE, FREQUENCIES_FILE};
use reesync::{
    Annotation, ConditionFilter, ContinuousSignal, EntropyPolarity, FrequencyAxis, FrequencyScheme,
    LockingMeasure, RunConfig, SyncError, SynchronyMethod,
};

const SFREQ: f64 = 100.0;
const CHANNELS: [&str; 5] = ["F3", "Fz", "F4", "Cz", "Pz"];

/// 60 s recording with one 20 s span per condition
fn recording(seed: u64) -> ContinuousSignal {
    let n = (60.0 * SFREQ) as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let data = Array2::from_shape_fn((CHANNELS.len(), n), |(c, t)| {
        let noise = rng.gen_range(-0.5..0.5);
        let t = t as f64 / SFREQ;
        (2.0 * PI * 10.0 * t + 0.3 * c as f64).sin() + 0.5 * (2.0 * PI * 5.0 * t).sin() + noise
    });
    let annotations = vec![
        Annotation::new("New Segment", 0.0),
        Annotation::new("BL_NoG_beg", 0.0),
        Annotation::new("BL_NoG_end", 14.0),
        Annotation::new("BL_WiG_beg", 15.0),
        Annotation::new("BL_WiG_end", 29.0),
        Annotation::new("NoG_beg", 30.0),
        Annotation::new("NoG_end", 44.0),
        Annotation::new("WiG_beg", 45.0),
        Annotation::new("WiG_end", 59.0),
    ];
    ContinuousSignal::new(
        CHANNELS.iter().map(|c| c.to_string()).collect(),
        SFREQ,
        data,
        annotations,
    )
    .unwrap()
}

fn write_sessions(root: &Path, group: &str, subject: &str, sessions: &[usize]) -> SessionLayout {
    let layout = SessionLayout::new(root, group, subject, Some("ica".to_string()));
    for &s in sessions {
        write_brainvision(&layout.subject_dir(), &layout.file_stem(s), &recording(s as u64)).unwrap();
    }
    layout
}

fn base_config(root: &Path, group: &str, subject: &str) -> RunConfig {
    RunConfig {
        root_dir: root.to_path_buf(),
        group: group.to_string(),
        subject: subject.to_string(),
        input_tag: Some("ica".to_string()),
        channels: vec!["F3".into(), "Fz".into(), "Cz".into()],
        scheme: FrequencyScheme::Sweep {
            min_freq: 4.0,
            max_freq: 20.0,
        },
        ..RunConfig::default()
    }
}

#[test]
fn missing_session_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let layout = write_sessions(dir.path(), "expert", "1", &[1, 3, 4]);
    let config = base_config(dir.path(), "expert", "1");

    let path = run_subject(&config, &layout).unwrap();
    assert!(path.ends_with("connectivity_scores/expert/1/NoG_connectivity.npy"));

    // crop 32 s .. 43 s -> 1101 samples -> 3 epochs per session
    let data = npy::read_f64(&path).unwrap();
    assert_eq!(data.shape(), &[9, 3, 3, 33]);
    for e in 0..9 {
        for f in 0..33 {
            assert_eq!(data[[e, 0, 2, f]], data[[e, 2, 0, f]]);
            assert_eq!(data[[e, 1, 1, f]], 0.0);
        }
    }

    let subject_dir = path.parent().unwrap();
    let names = npy::read_strings(&subject_dir.join(CHANNELS_FILE)).unwrap();
    assert_eq!(names, ["F3", "Fz", "Cz"]);
    let freqs = npy::read_f64(&subject_dir.join(FREQUENCIES_FILE)).unwrap();
    assert_eq!(freqs.len(), 33);
    assert_eq!(freqs[[0]], 4.0);
}

#[test]
fn changed_channels_trip_the_guard() {
    let dir = tempfile::tempdir().unwrap();
    let layout = write_sessions(dir.path(), "novice", "2", &[1]);
    let first = RunConfig {
        channels: vec!["F3".into(), "Fz".into()],
        ..base_config(dir.path(), "novice", "2")
    };
    let path = run_subject(&first, &layout).unwrap();
    let before = fs::read(&path).unwrap();

    let second = RunConfig {
        channels: vec!["F3".into(), "Cz".into()],
        ..first.clone()
    };
    match run_subject(&second, &layout) {
        Err(SyncError::MetadataMismatch { kind, .. }) => assert_eq!(kind, "Channel names"),
        other => panic!("expected MetadataMismatch, got {other:?}"),
    }
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn band_workflow_stacks_six_bands() {
    let dir = tempfile::tempdir().unwrap();
    let layout = write_sessions(dir.path(), "expert", "7", &[1, 2]);
    let config = RunConfig {
        scheme: FrequencyScheme::Bands,
        method: SynchronyMethod::Locking(LockingMeasure::Wpli),
        condition: ConditionFilter::new(true, true),
        dir_suffix: "_bands".to_string(),
        ..base_config(dir.path(), "expert", "7")
    };
    let path = run_subject(&config, &layout).unwrap();
    assert!(path.ends_with("connectivity_scores_bands/expert/7/BL_WiG_connectivity.npy"));

    // crop 17 s .. 28 s -> 3 epochs per session
    let data = npy::read_f64(&path).unwrap();
    assert_eq!(data.shape(), &[6, 3, 3, 6]);
    assert!(data.iter().all(|v| v.is_finite()));

    let store = ResultStore::new(dir.path(), "_bands");
    let back = store
        .load("expert", "7", &ConditionFilter::new(true, true))
        .unwrap();
    assert_eq!(back.frequencies, FrequencyAxis::canonical_bands());
}

#[test]
fn entropy_runs_read_back_as_a_group_dataset() {
    let dir = tempfile::tempdir().unwrap();
    for subject in ["1", "2"] {
        let layout = write_sessions(dir.path(), "expert", subject, &[1]);
        for condition in ConditionFilter::all() {
            let config = RunConfig {
                scheme: FrequencyScheme::Bands,
                method: SynchronyMethod::Entropy(EntropyPolarity::Synchrony),
                condition,
                ..base_config(dir.path(), "expert", subject)
            };
            run_subject(&config, &layout).unwrap();
        }
    }

    let store = ResultStore::new(dir.path(), "");
    let options = DatasetOptions {
        normalize: true,
        ..DatasetOptions::default()
    };
    let ds = GroupDataset::load(&store, &["expert"], &options).unwrap();
    assert_eq!(ds.ch_names, ["F3", "Fz", "Cz"]);

    let key = ConditionKey::new("expert", ConditionFilter::new(false, true));
    assert_eq!(ds.group_array(&key).unwrap().dim(), (2, 3, 3, 6));
    let alpha = reesync::bands::band_by_name("low alpha").unwrap();
    let values = ds.pair_values(&key, &alpha, "F3", "Cz").unwrap();
    assert_eq!(values.len(), 2);
}

#[test]
fn subject_without_sessions_fails() {
    let dir = tempfile::tempdir().unwrap();
    let layout = SessionLayout::new(dir.path(), "expert", "9", Some("ica".to_string()));
    let config = base_config(dir.path(), "expert", "9");
    assert!(matches!(
        run_subject(&config, &layout),
        Err(SyncError::NoEpochs { .. })
    ));
    assert!(!ResultStore::new(dir.path(), "")
        .subject_dir("expert", "9")
        .exists());
}
