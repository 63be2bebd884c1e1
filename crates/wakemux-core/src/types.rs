use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Sample rate every detector consumes.
pub const DETECTION_SAMPLE_RATE: u32 = 16_000;

/// Raw interleaved audio as delivered by a capture device.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// PCM layout of a byte stream: samples per second, bytes per sample, channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub rate: u32,
    pub width: u16,
    pub channels: u16,
}

impl AudioFormat {
    /// 16 kHz, 16-bit signed little-endian, mono.
    pub const DETECTION: AudioFormat = AudioFormat {
        rate: DETECTION_SAMPLE_RATE,
        width: 2,
        channels: 1,
    };

    pub fn bytes_per_frame(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Playback duration of `byte_len` bytes in this format.
    pub fn duration_of(&self, byte_len: usize) -> Duration {
        let frame = self.bytes_per_frame();
        if frame == 0 || self.rate == 0 {
            return Duration::ZERO;
        }
        let frames = (byte_len / frame) as f64;
        Duration::from_secs_f64(frames / self.rate as f64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::DETECTION
    }
}

/// One wake-word hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub name: String,
    /// Position in the audio stream (since the last reset) at which the detector fired.
    pub timestamp_ms: u64,
    pub probability: f32,
}

/// Describes one detectable target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub phrase: String,
    #[serde(default)]
    pub languages: BTreeSet<String>,
    #[serde(default)]
    pub is_builtin: bool,
}

impl ModelInfo {
    /// Metadata for a registered model whose backend has not been loaded yet.
    pub fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phrase: name.to_string(),
            languages: BTreeSet::new(),
            is_builtin: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub model_name: String,

    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default = "default_threshold")]
    pub threshold: f32,

    #[serde(default = "default_trigger_level")]
    pub trigger_level: u32,

    #[serde(default = "default_refractory_seconds")]
    pub refractory_seconds: f32,

    #[serde(default)]
    pub custom_model_dir: Option<PathBuf>,
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_threshold() -> f32 {
    0.5
}

fn default_trigger_level() -> u32 {
    1
}

fn default_refractory_seconds() -> f32 {
    2.0
}

impl BackendConfig {
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            device: default_device(),
            cache_dir: None,
            threshold: default_threshold(),
            trigger_level: default_trigger_level(),
            refractory_seconds: default_refractory_seconds(),
            custom_model_dir: None,
        }
    }

    /// Registry key for this config: the file stem of `model_name`.
    pub fn derived_name(&self) -> String {
        Path::new(&self.model_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.model_name)
            .to_string()
    }

    pub fn refractory(&self) -> Duration {
        Duration::from_secs_f32(self.refractory_seconds.max(0.0))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidModel {
            name: self.model_name.clone(),
            reason,
        };

        if self.model_name.trim().is_empty() {
            return Err(invalid("model_name must not be empty".to_string()));
        }
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(invalid(format!(
                "threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if self.trigger_level == 0 {
            return Err(invalid("trigger_level must be at least 1".to_string()));
        }
        if !self.refractory_seconds.is_finite() || self.refractory_seconds < 0.0 {
            return Err(invalid(format!(
                "refractory_seconds must be a non-negative number, got {}",
                self.refractory_seconds
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a managed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

/// Usage counters of one managed model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelStats {
    pub load_count: u64,
    pub unload_count: u64,
    pub total_requests: u64,
    pub total_audio_seconds: f64,
    pub last_load_time: Option<SystemTime>,
    pub last_request_time: Option<SystemTime>,
    pub load_duration_seconds: Option<f64>,
}

/// Point-in-time snapshot of one managed model, for health endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub state: ModelState,
    pub loaded: bool,
    pub device: String,
    pub ttl_seconds: f64,
    pub ttl_remaining: Option<f64>,
    pub active_requests: usize,
    pub is_default: bool,
    pub stats: ModelStats,
}
