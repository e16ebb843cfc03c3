use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use reesync::config::{EpochConfig, DEFAULT_CHANNELS};
use reesync::{
    ConditionFilter, EntropyPolarity, FrequencyScheme, LockingMeasure, RunConfig, SynchronyMethod,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Method {
    Plv,
    Ciplv,
    Pli,
    Wpli,
    Entropy,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scheme {
    /// Linear 0.5 Hz sweep between --min-freq and --max-freq
    Sweep,
    /// The six canonical EEG bands
    Bands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Polarity {
    /// Store 1 - H (higher means more synchronized)
    Synchrony,
    /// Store the normalized entropy H
    Entropy,
}

// CLI code
// underscores will be converted to "-" when clap parses the arguments
#[derive(Parser)]
#[command(name = "reesync")]
#[command(version = "0.1.0")]
#[command(about = "Pairwise EEG phase-synchrony connectivity for one subject", long_about = None)]
pub struct Cli {
    /// Subject group, e.g. expert or novice
    group: String,

    /// Subject identifier
    subject: String,

    /// Root data directory (reads processed/, writes connectivity_scores*/)
    #[arg(long, default_value = "data")]
    root_dir: PathBuf,

    /// Tag in the session file name, <session>_<tag>_raw.vhdr
    #[arg(long)]
    input_tag: Option<String>,

    /// Number of sessions to look for (1..=N)
    #[arg(long, default_value_t = 4)]
    sessions: usize,

    /// Lowest sweep frequency (Hz)
    #[arg(long, default_value_t = 0.5)]
    min_freq: f64,

    /// Highest sweep frequency (Hz)
    #[arg(long, default_value_t = 30.0)]
    max_freq: f64,

    /// Wavelet cycles are freq / cycles_numerator
    #[arg(long, default_value_t = 4.0)]
    cycles_numerator: f64,

    #[arg(long, value_enum, default_value_t = Method::Plv)]
    method: Method,

    #[arg(long, value_enum, default_value_t = Scheme::Sweep)]
    scheme: Scheme,

    /// Average over epochs before saving
    #[arg(long)]
    average: bool,

    /// Orientation of the entropy estimator's output
    #[arg(long, value_enum, default_value_t = Polarity::Synchrony)]
    entropy_polarity: Polarity,

    /// Use the baseline (BL) spans
    #[arg(long)]
    baseline: bool,

    /// Use the with-gestures (WiG) spans instead of NoG
    #[arg(long)]
    gestures: bool,

    /// Epoch length (s)
    #[arg(long, default_value_t = 5.0)]
    epoch_duration: f64,

    /// Overlap between consecutive epochs (s)
    #[arg(long, default_value_t = 2.5)]
    epoch_overlap: f64,

    /// Comma-separated electrodes, in output order
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_CHANNELS.map(String::from))]
    channels: Vec<String>,

    /// Appended to the connectivity_scores directory name
    #[arg(long, default_value = "")]
    dir_suffix: String,

    /// Seconds clipped after each begin marker
    #[arg(long, default_value_t = 2.0)]
    margin_start: f64,

    /// Seconds clipped before each end marker
    #[arg(long, default_value_t = 1.0)]
    margin_end: f64,
}

impl Cli {
    fn run_config(&self) -> RunConfig {
        let method = match self.method {
            Method::Plv => SynchronyMethod::Locking(LockingMeasure::Plv),
            Method::Ciplv => SynchronyMethod::Locking(LockingMeasure::Ciplv),
            Method::Pli => SynchronyMethod::Locking(LockingMeasure::Pli),
            Method::Wpli => SynchronyMethod::Locking(LockingMeasure::Wpli),
            Method::Entropy => SynchronyMethod::Entropy(match self.entropy_polarity {
                Polarity::Synchrony => EntropyPolarity::Synchrony,
                Polarity::Entropy => EntropyPolarity::Entropy,
            }),
        };
        let scheme = match self.scheme {
            Scheme::Sweep => FrequencyScheme::Sweep {
                min_freq: self.min_freq,
                max_freq: self.max_freq,
            },
            Scheme::Bands => FrequencyScheme::Bands,
        };

        RunConfig {
            root_dir: self.root_dir.clone(),
            group: self.group.clone(),
            subject: self.subject.clone(),
            input_tag: self.input_tag.clone(),
            n_sessions: self.sessions,
            condition: ConditionFilter::new(self.baseline, self.gestures),
            epochs: EpochConfig {
                duration: self.epoch_duration,
                overlap: self.epoch_overlap,
                margin_start: self.margin_start,
                margin_end: self.margin_end,
            },
            channels: self.channels.iter().map(|c| c.trim().to_string()).collect(),
            method,
            scheme,
            cycles_numerator: self.cycles_numerator,
            average: self.average,
            dir_suffix: self.dir_suffix.clone(),
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.run_config();

    match reesync::pipeline::run(&config) {
        Ok(path) => {
            log::info!("Done: {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!(
                "Subject {}/{} ({}, {} scheme, {}) failed: {e}",
                config.group,
                config.subject,
                config.condition.label(),
                config.scheme.name(),
                config.method
            );
            ExitCode::FAILURE
        }
    }
}
