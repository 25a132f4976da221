//! Common types and configuration used throughout the admission controller

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Sequential identifier handed out at admission time. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl WorkerId {
    pub fn get(self) -> u32 {
        self.0
    }

    /// Name of the worker bin inside the shared pipeline
    pub fn bin_name(self) -> String {
        format!("source-bin-{:02}", self.0)
    }

    /// Name of the muxer request pad this worker feeds
    pub fn muxer_pad_name(self) -> String {
        format!("sink_{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decode path chosen for a worker when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecodeBackend {
    /// Fixed-function decode hardware
    Hardware,
    /// CPU decoder, used while the hardware is saturated
    Software,
}

impl DecodeBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeBackend::Hardware => "hardware",
            DecodeBackend::Software => "software",
        }
    }
}

impl fmt::Display for DecodeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds and pacing for the admission loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Input file path or `file://` URI looped by every worker
    pub uri: String,
    /// Workers admitted unconditionally at startup
    pub initial_workers: u32,
    /// Admission tick period in milliseconds
    pub tick_interval_ms: u64,
    /// Gate closes when decoder load is above this...
    pub decoder_gate_percent: f64,
    /// ...and CPU load is above this
    pub cpu_gate_percent: f64,
    /// Decoder load above which new workers fall back to software decode
    pub software_fallback_percent: f64,
    /// Delay before the seek-to-start that loops a finished worker
    pub restart_delay_ms: u64,
    /// Registry slots reserved per initial worker
    pub registry_multiplier: u32,
    /// Optional hard ceiling on admitted workers
    pub max_workers: Option<u32>,
    pub sampler: SamplerConfig,
    pub source: SourceConfig,
    pub muxer: MuxerConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            initial_workers: 1,
            tick_interval_ms: 1_000,
            decoder_gate_percent: 90.0,
            cpu_gate_percent: 75.0,
            software_fallback_percent: 99.0,
            restart_delay_ms: 1,
            registry_multiplier: 200,
            max_workers: None,
            sampler: SamplerConfig::default(),
            source: SourceConfig::default(),
            muxer: MuxerConfig::default(),
        }
    }
}

impl AdmissionConfig {
    /// Load a configuration file; missing keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Slots pre-reserved in the worker registry
    pub fn registry_capacity(&self) -> usize {
        self.initial_workers.max(1) as usize * self.registry_multiplier.max(1) as usize
    }

    /// Check the knobs that would otherwise fail deep inside the loop
    pub fn validate(&self) -> Result<()> {
        if self.uri.trim().is_empty() {
            return Err(Error::configuration("input path or URI is empty"));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::configuration("tick_interval_ms must be positive"));
        }
        for (name, value) in [
            ("decoder_gate_percent", self.decoder_gate_percent),
            ("cpu_gate_percent", self.cpu_gate_percent),
            ("software_fallback_percent", self.software_fallback_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(Error::configuration(format!(
                    "{} must lie in [0, 100], got {}",
                    name, value
                )));
            }
        }
        if self.sampler.decoder_command.is_empty() {
            return Err(Error::configuration("sampler.decoder_command is empty"));
        }
        Ok(())
    }
}

/// Where load readings come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Kernel CPU counters
    pub stat_path: PathBuf,
    /// Program and arguments reporting decoder utilization
    pub decoder_command: Vec<String>,
    /// First output line containing this token carries the percentage
    pub decoder_line_filter: String,
    /// Upper bound on the decoder query, in milliseconds
    pub decoder_timeout_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            stat_path: PathBuf::from("/proc/stat"),
            decoder_command: vec![
                "nvidia-smi".to_string(),
                "-q".to_string(),
                "-d".to_string(),
                "UTILIZATION".to_string(),
            ],
            decoder_line_filter: "Decoder".to_string(),
            decoder_timeout_ms: 2_000,
        }
    }
}

/// Element factories and caps used to build one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub source_element: String,
    pub parser_element: String,
    pub hardware_decoder: String,
    pub software_decoder: String,
    pub normalizer_element: String,
    /// Caps forced after the normalizer on the hardware path
    pub hardware_caps: Option<String>,
    /// Caps forced after the normalizer on the software path
    pub software_caps: Option<String>,
    pub gpu_id: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source_element: "filesrc".to_string(),
            parser_element: "h264parse".to_string(),
            hardware_decoder: "nvv4l2decoder".to_string(),
            software_decoder: "avdec_h264".to_string(),
            normalizer_element: "nvvideoconvert".to_string(),
            hardware_caps: None,
            software_caps: Some(
                "video/x-raw(memory:NVMM), format=NV12, width=640, height=480".to_string(),
            ),
            gpu_id: 0,
        }
    }
}

impl SourceConfig {
    pub fn decoder_element(&self, backend: DecodeBackend) -> &str {
        match backend {
            DecodeBackend::Hardware => &self.hardware_decoder,
            DecodeBackend::Software => &self.software_decoder,
        }
    }

    pub fn caps_for(&self, backend: DecodeBackend) -> Option<&str> {
        match backend {
            DecodeBackend::Hardware => self.hardware_caps.as_deref(),
            DecodeBackend::Software => self.software_caps.as_deref(),
        }
    }
}

/// The shared batching stage every worker feeds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    pub muxer_element: String,
    pub sink_element: String,
    pub batch_size: u32,
    /// Microseconds the muxer waits before pushing an incomplete batch
    pub batched_push_timeout_us: i32,
    pub width: u32,
    pub height: u32,
    pub live_source: bool,
    pub gpu_id: u32,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            muxer_element: "nvstreammux".to_string(),
            sink_element: "fakesink".to_string(),
            batch_size: 200,
            batched_push_timeout_us: 33_333,
            width: 1280,
            height: 720,
            live_source: true,
            gpu_id: 0,
        }
    }
}

/// Turn the command-line input into a local file location.
///
/// Plain paths pass through; `file://` URIs are converted. Any other scheme
/// is rejected since workers read through a file source.
pub fn resolve_location(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::configuration("input path or URI is empty"));
    }

    if !trimmed.contains("://") {
        return Ok(trimmed.to_string());
    }

    let parsed = Url::parse(trimmed)?;
    if parsed.scheme() != "file" {
        return Err(Error::configuration(format!(
            "unsupported URI scheme '{}', only file:// inputs can be looped",
            parsed.scheme()
        )));
    }

    let path = parsed
        .to_file_path()
        .map_err(|_| Error::configuration(format!("cannot map {} to a local path", trimmed)))?;
    Ok(path.to_string_lossy().into_owned())
}
