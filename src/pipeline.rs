//! Per-subject orchestration: load sessions, segment, estimate, aggregate,
//! persist.

use std::path::PathBuf;

use ndarray::Array3;

use crate::aggregate::{band_connectivity, finalize, stack_bands};
use crate::bands::{frequency_sweep, Band, FrequencyAxis, CANONICAL_BANDS};
use crate::config::{FrequencyScheme, RunConfig};
use crate::epochs::{epoch_intervals, resolve_markers};
use crate::io::{SessionLayout, SignalSource};
use crate::signal::bandpass_filter;
use crate::store::{ConnectivityTensor, ResultStore};
use crate::synchrony::{phase_locking, SweepSpec, SynchronyMethod};
use crate::{ContinuousSignal, EpochsData, Result, SyncError};

/// Sessions `1..=n_sessions` that exist in `source`, in order
pub fn load_sessions<S: SignalSource + ?Sized>(
    source: &S,
    n_sessions: usize,
) -> Result<Vec<(usize, ContinuousSignal)>> {
    let mut sessions = Vec::new();
    for session in 1..=n_sessions {
        match source.load(session)? {
            Some(signal) => sessions.push((session, signal)),
            None => log::info!("Skipping {}: not found", source.describe(session)),
        }
    }
    Ok(sessions)
}

/// Epochs of the configured condition across all sessions, optionally
/// band-pass filtered first. `None` when no session contributed an epoch.
fn gather_epochs(
    config: &RunConfig,
    sessions: &[(usize, ContinuousSignal)],
    band: Option<&Band>,
) -> Result<Option<EpochsData>> {
    let label = config.condition.label();
    let mut batches = Vec::new();

    for (session, signal) in sessions {
        let markers = resolve_markers(signal.annotations(), &config.condition);
        if markers.is_empty() {
            log::warn!("No {label} annotations in session {session}");
            continue;
        }

        let raw = epoch_intervals(signal, &markers, &config.epochs)?;
        let epochs = match band {
            // flatness is judged before filtering
            Some(band) => {
                let filtered = bandpass_filter(signal, band)?;
                epoch_intervals(&filtered, &markers, &config.epochs)?.with_flat_mask(&raw)?
            }
            None => raw,
        }
        .pick_channels(&config.channels)?;
        if epochs.is_empty() {
            log::warn!("Session {session} produced no {label} epochs");
            continue;
        }
        log::debug!("Session {session}: {} epochs", epochs.len());
        batches.push(epochs);
    }

    if batches.is_empty() {
        return Ok(None);
    }
    EpochsData::concatenate(&batches).map(Some)
}

/// Compute one subject's connectivity tensor for the configured condition
/// and frequency scheme without touching the output tree.
pub fn compute<S: SignalSource + ?Sized>(
    config: &RunConfig,
    source: &S,
) -> Result<ConnectivityTensor> {
    config.validate()?;
    let label = config.condition.label();
    let no_epochs = || SyncError::NoEpochs {
        subject: config.subject.clone(),
        condition: label.clone(),
    };

    log::info!(
        "Subject {} ({}): {} on {} scheme, {label}",
        config.subject,
        config.group,
        config.method,
        config.scheme.name()
    );
    let sessions = load_sessions(source, config.n_sessions)?;

    match config.scheme {
        FrequencyScheme::Sweep { min_freq, max_freq } => {
            let SynchronyMethod::Locking(measure) = config.method else {
                return Err(SyncError::InvalidInput(
                    "the sweep scheme needs a locking measure".to_string(),
                ));
            };
            let sweep = SweepSpec::new(frequency_sweep(min_freq, max_freq)?, config.cycles_numerator)?;

            let epochs = gather_epochs(config, &sessions, None)?.ok_or_else(no_epochs)?;
            log::info!(
                "{} epochs x {} frequencies ({min_freq}-{max_freq} Hz)",
                epochs.len(),
                sweep.len()
            );
            let con = phase_locking(&epochs, &sweep, measure)?;
            ConnectivityTensor::new(
                finalize(con, config.average)?,
                epochs.ch_names,
                FrequencyAxis::Bins(sweep.freqs),
            )
        }
        FrequencyScheme::Bands => {
            // filter only the channels of interest
            let sessions = sessions
                .into_iter()
                .map(|(n, s)| s.pick_channels(&config.channels).map(|s| (n, s)))
                .collect::<Result<Vec<_>>>()?;

            let mut per_band: Vec<(Band, Array3<f64>)> = Vec::with_capacity(CANONICAL_BANDS.len());
            let mut any_epochs = false;
            for band in &CANONICAL_BANDS {
                let con = match gather_epochs(config, &sessions, Some(band))? {
                    Some(epochs) => {
                        any_epochs = true;
                        log::info!("{band}: {} epochs", epochs.len());
                        band_connectivity(&epochs, band, config.method, config.cycles_numerator)?
                    }
                    None => {
                        log::warn!("{band}: no epochs");
                        let c = config.channels.len();
                        Array3::zeros((0, c, c))
                    }
                };
                per_band.push((*band, con));
            }
            if !any_epochs {
                return Err(no_epochs());
            }

            let stacked = stack_bands(&per_band)?;
            ConnectivityTensor::new(
                finalize(stacked, config.average)?,
                config.channels.clone(),
                FrequencyAxis::canonical_bands(),
            )
        }
    }
}

/// Compute and persist one subject, returning the written data file
pub fn run_subject<S: SignalSource + ?Sized>(config: &RunConfig, source: &S) -> Result<PathBuf> {
    let tensor = compute(config, source)?;
    let store = ResultStore::new(&config.root_dir, config.dir_suffix.clone());
    store.save(&config.group, &config.subject, &config.condition, &tensor)
}

/// [`run_subject`] over the BrainVision files under `config.root_dir`
pub fn run(config: &RunConfig) -> Result<PathBuf> {
    let layout = SessionLayout::new(
        &config.root_dir,
        config.group.clone(),
        config.subject.clone(),
        config.input_tag.clone(),
    );
    run_subject(config, &layout)
}
