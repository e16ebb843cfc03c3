//! BrainVision input (`.vhdr` header, `.vmrk` markers, multiplexed binary
//! `.eeg`) and the [`SignalSource`] seam the pipeline loads sessions through.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::prelude::*;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::{Annotation, ContinuousSignal, Result, SyncError};

/// Anything that can hand the pipeline one recording session at a time.
///
/// `Ok(None)` means the session does not exist and is skipped; any other
/// failure is an error.
pub trait SignalSource {
    fn load(&self, session: usize) -> Result<Option<ContinuousSignal>>;

    /// Human-readable location of a session, for logging
    fn describe(&self, session: usize) -> String {
        format!("session {session}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Int16,
    Float32,
}

impl BinaryFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "INT_16" => Some(BinaryFormat::Int16),
            "IEEE_FLOAT_32" => Some(BinaryFormat::Float32),
            _ => None,
        }
    }

    fn width(&self) -> usize {
        match self {
            BinaryFormat::Int16 => 2,
            BinaryFormat::Float32 => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    pub reference: String,
    /// Scale applied to raw values
    pub resolution: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrainVisionHeader {
    pub n_channels: usize,
    /// Microseconds between samples
    pub sampling_interval: f64,
    pub binary_format: BinaryFormat,
    pub data_file: String,
    pub marker_file: Option<String>,
    pub channels: Vec<ChannelInfo>,
}

impl BrainVisionHeader {
    pub fn sfreq(&self) -> f64 {
        1e6 / self.sampling_interval
    }
}

/// One `Mk<n>=` entry
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub kind: String,
    pub description: String,
    /// 1-based sample position
    pub position: usize,
    pub points: usize,
    pub channel: usize,
}

impl Marker {
    /// Annotation label: the description, or the type when it is empty
    pub fn label(&self) -> &str {
        if self.description.is_empty() {
            &self.kind
        } else {
            &self.description
        }
    }

    pub fn onset(&self, sfreq: f64) -> f64 {
        self.position.saturating_sub(1) as f64 / sfreq
    }
}

fn format_err(path: &Path, reason: impl Into<String>) -> SyncError {
    SyncError::Format {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// BrainVision escapes commas in names as `\1`
fn unescape(field: &str) -> String {
    field.trim().replace("\\1", ",")
}

/// Header and marker files are usually latin-1 or UTF-8
pub fn read_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| SyncError::io(path, e))?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => e.into_bytes().iter().map(|&b| b as char).collect(),
    })
}

/// `key=value` entries grouped by `[Section]`, comments skipped
fn sections(text: &str) -> BTreeMap<String, Vec<(String, String)>> {
    let mut out: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    let mut current = String::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = name.trim().to_string();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            out.entry(current.clone())
                .or_default()
                .push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    out
}

fn lookup<'a>(entries: Option<&'a Vec<(String, String)>>, key: &str) -> Option<&'a str> {
    entries?
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Numbered entries `<prefix><n>=...` sorted by `n`
fn numbered<'a>(entries: Option<&'a Vec<(String, String)>>, prefix: &str) -> Vec<(usize, &'a str)> {
    let mut out: Vec<(usize, &str)> = entries
        .into_iter()
        .flatten()
        .filter_map(|(k, v)| {
            k.strip_prefix(prefix)
                .and_then(|n| n.parse::<usize>().ok())
                .map(|n| (n, v.as_str()))
        })
        .collect();
    out.sort_by_key(|&(n, _)| n);
    out
}

pub fn parse_header(path: &Path, text: &str) -> Result<BrainVisionHeader> {
    let sections = sections(text);
    let common = sections.get("Common Infos");
    let binary = sections.get("Binary Infos");

    let n_channels: usize = lookup(common, "NumberOfChannels")
        .ok_or_else(|| format_err(path, "missing NumberOfChannels"))?
        .parse()
        .map_err(|_| format_err(path, "NumberOfChannels is not an integer"))?;
    if n_channels == 0 {
        return Err(format_err(path, "Number of channels cannot be zero"));
    }

    let sampling_interval: f64 = lookup(common, "SamplingInterval")
        .ok_or_else(|| format_err(path, "missing SamplingInterval"))?
        .parse()
        .map_err(|_| format_err(path, "SamplingInterval is not a number"))?;
    if !(sampling_interval.is_finite() && sampling_interval > 0.0) {
        return Err(format_err(path, "SamplingInterval must be positive"));
    }

    if let Some(format) = lookup(common, "DataFormat") {
        if format != "BINARY" {
            return Err(format_err(path, format!("unsupported DataFormat {format}")));
        }
    }
    if let Some(orientation) = lookup(common, "DataOrientation") {
        if orientation != "MULTIPLEXED" {
            return Err(format_err(
                path,
                format!("unsupported DataOrientation {orientation}"),
            ));
        }
    }

    let format_name = lookup(binary, "BinaryFormat").unwrap_or("INT_16");
    let binary_format = BinaryFormat::parse(format_name)
        .ok_or_else(|| format_err(path, format!("Format not supported: {format_name}")))?;

    let data_file = lookup(common, "DataFile")
        .ok_or_else(|| format_err(path, "missing DataFile"))?
        .to_string();
    let marker_file = lookup(common, "MarkerFile").map(str::to_string);

    let channels = numbered(sections.get("Channel Infos"), "Ch")
        .into_iter()
        .map(|(n, value)| {
            let fields: Vec<&str> = value.split(',').collect();
            let name = fields.first().map(|f| unescape(f)).unwrap_or_default();
            if name.is_empty() {
                return Err(format_err(path, format!("channel Ch{n} has no name")));
            }
            let resolution = match fields.get(2).map(|f| f.trim()) {
                None | Some("") => 1.0,
                Some(r) => r
                    .parse::<f64>()
                    .map_err(|_| format_err(path, format!("bad resolution {r:?} for {name}")))?,
            };
            Ok(ChannelInfo {
                name,
                reference: fields.get(1).map(|f| unescape(f)).unwrap_or_default(),
                resolution,
                unit: fields.get(3).map(|f| unescape(f)).unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if channels.len() != n_channels {
        return Err(format_err(
            path,
            format!(
                "header declares {n_channels} channels but lists {}",
                channels.len()
            ),
        ));
    }

    log::debug!(
        "{}: {n_channels} channels at {} Hz, {binary_format:?}",
        path.display(),
        1e6 / sampling_interval
    );

    Ok(BrainVisionHeader {
        n_channels,
        sampling_interval,
        binary_format,
        data_file,
        marker_file,
        channels,
    })
}

pub fn parse_vmrk(path: &Path, text: &str) -> Result<Vec<Marker>> {
    let sections = sections(text);
    numbered(sections.get("Marker Infos"), "Mk")
        .into_iter()
        .map(|(n, value)| {
            let fields: Vec<&str> = value.split(',').collect();
            if fields.len() < 3 {
                return Err(format_err(path, format!("marker Mk{n} has too few fields")));
            }
            let position = fields[2]
                .trim()
                .parse()
                .map_err(|_| format_err(path, format!("marker Mk{n} has a bad position")))?;
            Ok(Marker {
                kind: unescape(fields[0]),
                description: unescape(fields[1]),
                position,
                points: fields.get(3).and_then(|p| p.trim().parse().ok()).unwrap_or(1),
                channel: fields.get(4).and_then(|c| c.trim().parse().ok()).unwrap_or(0),
            })
        })
        .collect()
}

/// Raw multiplexed samples, scaled by nothing yet
pub fn parse_bytes(path: &Path, format: BinaryFormat) -> Result<Vec<f64>> {
    let f = File::open(path).map_err(|e| SyncError::io(path, e))?;
    let mut reader = BufReader::new(f);
    let mut buffer = Vec::new();
    reader
        .read_to_end(&mut buffer)
        .map_err(|e| SyncError::io(path, e))?;

    if buffer.len() % format.width() != 0 {
        return Err(format_err(
            path,
            format!("{} bytes is not a whole number of samples", buffer.len()),
        ));
    }
    let samples = match format {
        BinaryFormat::Int16 => buffer
            .chunks_exact(2)
            .map(|p| f64::from(i16::from_le_bytes([p[0], p[1]])))
            .collect(),
        BinaryFormat::Float32 => buffer
            .chunks_exact(4)
            .map(|p| f64::from(f32::from_le_bytes([p[0], p[1], p[2], p[3]])))
            .collect(),
    };
    Ok(samples)
}

/// Channel-interleaved samples to (channel, time), scaling each channel
pub fn demultiplex(samples: &[f64], channels: &[ChannelInfo]) -> Result<Array2<f64>> {
    let n_ch = channels.len();
    if n_ch == 0 {
        return Err(SyncError::InvalidInput("Number of channels cannot be zero".to_string()));
    }
    if samples.len() % n_ch != 0 {
        return Err(SyncError::InvalidInput(format!(
            "{} samples do not divide into {n_ch} channels",
            samples.len()
        )));
    }
    let n_times = samples.len() / n_ch;
    Ok(Array2::from_shape_fn((n_ch, n_times), |(c, t)| {
        samples[t * n_ch + c] * channels[c].resolution
    }))
}

/// Load a full recording from its `.vhdr` file
pub fn read_brainvision(vhdr: &Path) -> Result<ContinuousSignal> {
    let dir = vhdr.parent().unwrap_or_else(|| Path::new("."));
    let header = parse_header(vhdr, &read_text(vhdr)?)?;
    let sfreq = header.sfreq();

    let samples = parse_bytes(&dir.join(&header.data_file), header.binary_format)?;
    let data = demultiplex(&samples, &header.channels)?;

    let annotations = match &header.marker_file {
        Some(file) => {
            let vmrk = dir.join(file);
            parse_vmrk(&vmrk, &read_text(&vmrk)?)?
                .iter()
                .map(|m| Annotation::new(m.label(), m.onset(sfreq)))
                .collect()
        }
        None => Vec::new(),
    };

    log::info!(
        "Read {} ({} channels, {} samples, {} annotations)",
        vhdr.display(),
        header.n_channels,
        data.ncols(),
        annotations.len()
    );

    let ch_names = header.channels.into_iter().map(|c| c.name).collect();
    ContinuousSignal::new(ch_names, sfreq, data, annotations)
}

/// Write `signal` as an `IEEE_FLOAT_32` BrainVision triplet `<stem>.{vhdr,vmrk,eeg}`
/// in `dir`, returning the header path. Annotations become `Comment` markers.
pub fn write_brainvision(dir: &Path, stem: &str, signal: &ContinuousSignal) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| SyncError::io(dir, e))?;
    let vhdr = dir.join(format!("{stem}.vhdr"));
    let vmrk = dir.join(format!("{stem}.vmrk"));
    let eeg = dir.join(format!("{stem}.eeg"));

    let mut header = format!(
        "Brain Vision Data Exchange Header File Version 1.0\n\n\
         [Common Infos]\nCodepage=UTF-8\nDataFile={stem}.eeg\nMarkerFile={stem}.vmrk\n\
         DataFormat=BINARY\nDataOrientation=MULTIPLEXED\nNumberOfChannels={}\n\
         SamplingInterval={}\n\n[Binary Infos]\nBinaryFormat=IEEE_FLOAT_32\n\n[Channel Infos]\n",
        signal.ch_names().len(),
        1e6 / signal.sfreq()
    );
    for (i, name) in signal.ch_names().iter().enumerate() {
        header.push_str(&format!("Ch{}={},,1,µV\n", i + 1, name.replace(',', "\\1")));
    }

    let mut markers = format!(
        "Brain Vision Data Exchange Marker File, Version 1.0\n\n\
         [Common Infos]\nCodepage=UTF-8\nDataFile={stem}.eeg\n\n[Marker Infos]\n"
    );
    for (i, a) in signal.annotations().iter().enumerate() {
        let position = (a.onset * signal.sfreq()).round() as usize + 1;
        markers.push_str(&format!(
            "Mk{}=Comment,{},{position},1,0\n",
            i + 1,
            a.label.replace(',', "\\1")
        ));
    }

    let data = signal.data();
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for column in data.columns() {
        for &v in column {
            bytes.extend_from_slice(&(v as f32).to_le_bytes());
        }
    }

    fs::write(&vhdr, header).map_err(|e| SyncError::io(&vhdr, e))?;
    fs::write(&vmrk, markers).map_err(|e| SyncError::io(&vmrk, e))?;
    fs::write(&eeg, bytes).map_err(|e| SyncError::io(&eeg, e))?;
    Ok(vhdr)
}

/// Preprocessed sessions on disk:
/// `<root>/processed/<group>/<subject>/<session>[_<tag>]_raw.vhdr`
#[derive(Debug, Clone)]
pub struct SessionLayout {
    pub root: PathBuf,
    pub group: String,
    pub subject: String,
    pub tag: Option<String>,
}

impl SessionLayout {
    pub fn new(
        root: impl Into<PathBuf>,
        group: impl Into<String>,
        subject: impl Into<String>,
        tag: Option<String>,
    ) -> Self {
        Self {
            root: root.into(),
            group: group.into(),
            subject: subject.into(),
            tag,
        }
    }

    pub fn subject_dir(&self) -> PathBuf {
        self.root.join("processed").join(&self.group).join(&self.subject)
    }

    pub fn file_stem(&self, session: usize) -> String {
        match &self.tag {
            Some(tag) => format!("{session}_{tag}_raw"),
            None => format!("{session}_raw"),
        }
    }

    pub fn session_path(&self, session: usize) -> PathBuf {
        self.subject_dir().join(format!("{}.vhdr", self.file_stem(session)))
    }
}

impl SignalSource for SessionLayout {
    fn load(&self, session: usize) -> Result<Option<ContinuousSignal>> {
        let path = self.session_path(session);
        if !path.exists() {
            return Ok(None);
        }
        read_brainvision(&path).map(Some)
    }

    fn describe(&self, session: usize) -> String {
        self.session_path(session).display().to_string()
    }
}

/// Sessions held in memory, keyed by session number
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    sessions: BTreeMap<usize, ContinuousSignal>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session: usize, signal: ContinuousSignal) -> Self {
        self.sessions.insert(session, signal);
        self
    }
}

impl SignalSource for MemorySource {
    fn load(&self, session: usize) -> Result<Option<ContinuousSignal>> {
        Ok(self.sessions.get(&session).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const VHDR: &str = "Brain Vision Data Exchange Header File Version 1.0\r\n\
; Data created by the Vision Recorder\r\n\
\r\n\
[Common Infos]\r\n\
Codepage=UTF-8\r\n\
DataFile=1_raw.eeg\r\n\
MarkerFile=1_raw.vmrk\r\n\
DataFormat=BINARY\r\n\
DataOrientation=MULTIPLEXED\r\n\
NumberOfChannels=3\r\n\
; Sampling interval in microseconds\r\n\
SamplingInterval=2000\r\n\
\r\n\
[Binary Infos]\r\n\
BinaryFormat=INT_16\r\n\
\r\n\
[Channel Infos]\r\n\
Ch1=Fz,,0.1,µV\r\n\
Ch2=Cz,,0.5,µV\r\n\
Ch3=P\\1z,,,µV\r\n";

    const VMRK: &str = "Brain Vision Data Exchange Marker File, Version 1.0\n\
\n\
[Marker Infos]\n\
; Each entry: Mk<Marker number>=<Type>,<Description>,<Position in data points>,\n\
Mk1=New Segment,,1,1,0\n\
Mk2=Comment,BL_NoG_beg,501,1,0\n\
Mk3=Comment,BL_NoG_end,1001,1,0\n";

    #[test]
    fn header_fields_are_parsed() {
        let header = parse_header(Path::new("1_raw.vhdr"), VHDR).unwrap();
        assert_eq!(header.n_channels, 3);
        assert_eq!(header.sfreq(), 500.0);
        assert_eq!(header.binary_format, BinaryFormat::Int16);
        assert_eq!(header.data_file, "1_raw.eeg");
        assert_eq!(header.marker_file.as_deref(), Some("1_raw.vmrk"));
        let names: Vec<_> = header.channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Fz", "Cz", "P,z"]);
        assert_eq!(header.channels[1].resolution, 0.5);
        assert_eq!(header.channels[2].resolution, 1.0);
    }

    #[test]
    fn channel_count_must_match() {
        let broken = VHDR.replace("NumberOfChannels=3", "NumberOfChannels=4");
        assert!(matches!(
            parse_header(Path::new("x.vhdr"), &broken),
            Err(SyncError::Format { .. })
        ));
    }

    #[test]
    fn vectorized_orientation_is_rejected() {
        let broken = VHDR.replace("MULTIPLEXED", "VECTORIZED");
        assert!(parse_header(Path::new("x.vhdr"), &broken).is_err());
    }

    #[test]
    fn markers_become_annotations() {
        let markers = parse_vmrk(Path::new("1_raw.vmrk"), VMRK).unwrap();
        assert_eq!(markers.len(), 3);
        assert_eq!(markers[0].label(), "New Segment");
        assert_eq!(markers[1].label(), "BL_NoG_beg");
        assert_eq!(markers[1].onset(500.0), 1.0);
        assert_eq!(markers[2].onset(500.0), 2.0);
    }

    #[test]
    fn demultiplex_scales_per_channel() {
        let header = parse_header(Path::new("1_raw.vhdr"), VHDR).unwrap();
        let samples = [10.0, 10.0, 10.0, 20.0, 20.0, 20.0];
        let data = demultiplex(&samples, &header.channels).unwrap();
        assert_eq!(data.dim(), (3, 2));
        assert_eq!(data[[0, 1]], 2.0);
        assert_eq!(data[[1, 0]], 5.0);
        assert_eq!(data[[2, 1]], 20.0);
        assert!(demultiplex(&samples[..5], &header.channels).is_err());
    }

    #[test]
    fn int16_recording_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1_raw.vhdr"), VHDR).unwrap();
        fs::write(dir.path().join("1_raw.vmrk"), VMRK).unwrap();
        let raw: Vec<u8> = (0..3 * 1200)
            .flat_map(|i: i32| ((i % 100) as i16 - 50).to_le_bytes())
            .collect();
        fs::write(dir.path().join("1_raw.eeg"), raw).unwrap();

        let signal = read_brainvision(&dir.path().join("1_raw.vhdr")).unwrap();
        assert_eq!(signal.ch_names(), ["Fz", "Cz", "P,z"]);
        assert_eq!(signal.n_samples(), 1200);
        assert_eq!(signal.annotations().len(), 3);
        assert_eq!(signal.annotations()[1], Annotation::new("BL_NoG_beg", 1.0));
        // first frame: -50, -49, -48
        assert_abs_diff_eq!(signal.data()[[0, 0]], -5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(signal.data()[[1, 0]], -24.5, epsilon = 1e-12);
        assert_eq!(signal.data()[[2, 0]], -48.0);
    }

    #[test]
    fn written_recording_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array2::from_shape_fn((2, 250), |(c, t)| (t as f64 * 0.1).sin() * (c + 1) as f64);
        let signal = ContinuousSignal::new(
            vec!["F3".into(), "F4".into()],
            250.0,
            data,
            vec![Annotation::new("WiG_beg", 0.2), Annotation::new("WiG_end", 0.8)],
        )
        .unwrap();
        let vhdr = write_brainvision(dir.path(), "2_raw", &signal).unwrap();
        let back = read_brainvision(&vhdr).unwrap();
        assert_eq!(back.ch_names(), signal.ch_names());
        assert_eq!(back.sfreq(), 250.0);
        assert_eq!(back.annotations(), signal.annotations());
        for (a, b) in back.data().iter().zip(signal.data().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn missing_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(dir.path(), "expert", "4", Some("ica".to_string()));
        assert!(layout
            .session_path(2)
            .ends_with("processed/expert/4/2_ica_raw.vhdr"));
        assert!(layout.load(2).unwrap().is_none());
    }
}
