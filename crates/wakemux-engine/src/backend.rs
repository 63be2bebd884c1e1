use crate::scorer::{Scorer, ScorerCatalog};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wakemux_core::{BackendConfig, DetectionResult, EngineError, ModelInfo, DETECTION_SAMPLE_RATE};

/// One loadable detection model.
///
/// Audio passed to [`process_audio`](Self::process_audio) is 16 kHz, 16-bit
/// signed little-endian, mono PCM. Chunk boundaries are arbitrary; the
/// backend buffers partial frames internally.
pub trait Backend: Send {
    fn name(&self) -> &str;
    fn device(&self) -> &str;
    fn is_loaded(&self) -> bool;
    /// `true` if any detector fired since the last [`reset`](Self::reset).
    fn is_detected(&self) -> bool;
    /// Build the model. Calling this while already loaded is an error.
    fn load(&mut self) -> Result<Duration, EngineError>;
    fn unload(&mut self);
    /// Start a fresh audio stream without reloading.
    fn reset(&mut self);
    fn process_audio(&mut self, chunk: &[u8]) -> Vec<DetectionResult>;
    fn available_models(&self) -> Vec<ModelInfo>;
}

// ── Debounce state ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct DetectorState {
    id: String,
    triggers_left: u32,
    is_detected: bool,
    last_triggered_ms: Option<u64>,
}

impl DetectorState {
    fn new(id: &str, trigger_level: u32) -> Self {
        Self {
            id: id.to_string(),
            triggers_left: trigger_level,
            is_detected: false,
            last_triggered_ms: None,
        }
    }
}

struct Detector {
    info: ModelInfo,
    scorer: Box<dyn Scorer>,
    state: DetectorState,
    pending: Vec<i16>,
    samples_consumed: u64,
}

// ── DetectorBackend ───────────────────────────────────────────

/// Backend that debounces per-frame scorer probabilities into discrete detections.
///
/// A frame scoring above `threshold` counts down `triggers_left`; a frame at or
/// below it restores the counter. Reaching zero emits one detection, after
/// which the detector stays silent for `refractory_seconds` of audio.
pub struct DetectorBackend {
    name: String,
    config: BackendConfig,
    catalog: Arc<ScorerCatalog>,
    detector: Option<Detector>,
    carry: Option<u8>,
}

impl DetectorBackend {
    pub fn new(config: BackendConfig, catalog: Arc<ScorerCatalog>) -> Self {
        Self {
            name: config.derived_name(),
            config,
            catalog,
            detector: None,
            carry: None,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn decode(&mut self, chunk: &[u8]) -> Vec<i16> {
        let mut bytes = Vec::with_capacity(chunk.len() + 1);
        if let Some(b) = self.carry.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(chunk);

        let mut samples = bytes.chunks_exact(2);
        let decoded = samples
            .by_ref()
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        self.carry = samples.remainder().first().copied();
        decoded
    }
}

impl Backend for DetectorBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn device(&self) -> &str {
        &self.config.device
    }

    fn is_loaded(&self) -> bool {
        self.detector.is_some()
    }

    fn is_detected(&self) -> bool {
        self.detector
            .as_ref()
            .is_some_and(|d| d.state.is_detected)
    }

    fn load(&mut self) -> Result<Duration, EngineError> {
        let started = Instant::now();
        let load_error = |reason: String| EngineError::ModelLoad {
            name: self.name.clone(),
            reason,
        };

        if self.detector.is_some() {
            return Err(load_error("already loaded".to_string()));
        }
        self.config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        if !matches!(self.config.device.as_str(), "cpu" | "auto") {
            return Err(load_error(format!(
                "device '{}' is not available",
                self.config.device
            )));
        }
        if let Some(dir) = &self.config.cache_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| load_error(format!("cannot create cache dir {}: {e}", dir.display())))?;
        }

        let (info, scorer) = self.catalog.resolve(&self.config)?;
        if scorer.frame_samples() == 0 {
            return Err(load_error("scorer reports a frame length of 0 samples".to_string()));
        }
        debug!(
            model = %self.name,
            frame_samples = scorer.frame_samples(),
            threshold = self.config.threshold,
            trigger_level = self.config.trigger_level,
            "scorer ready"
        );
        self.detector = Some(Detector {
            state: DetectorState::new(&info.name, self.config.trigger_level),
            info,
            scorer,
            pending: Vec::new(),
            samples_consumed: 0,
        });
        self.carry = None;

        let elapsed = started.elapsed();
        info!(model = %self.name, device = %self.config.device, ?elapsed, "backend loaded");
        Ok(elapsed)
    }

    fn unload(&mut self) {
        if self.detector.take().is_some() {
            info!(model = %self.name, "backend unloaded");
        }
        self.carry = None;
    }

    fn reset(&mut self) {
        self.carry = None;
        if let Some(detector) = self.detector.as_mut() {
            detector.state = DetectorState::new(&detector.info.name, self.config.trigger_level);
            detector.pending.clear();
            detector.samples_consumed = 0;
            detector.scorer.reset();
        }
    }

    fn process_audio(&mut self, chunk: &[u8]) -> Vec<DetectionResult> {
        if self.detector.is_none() {
            warn!(model = %self.name, "audio received while backend is unloaded");
            return Vec::new();
        }
        let samples = self.decode(chunk);

        let threshold = self.config.threshold;
        let trigger_level = self.config.trigger_level;
        let refractory_ms = self.config.refractory().as_millis() as u64;
        let mut detections = Vec::new();

        let Some(detector) = self.detector.as_mut() else {
            return detections;
        };
        detector.pending.extend_from_slice(&samples);
        let frame_len = detector.scorer.frame_samples();

        let mut offset = 0;
        while detector.pending.len() - offset >= frame_len {
            let frame = &detector.pending[offset..offset + frame_len];
            offset += frame_len;
            detector.samples_consumed += frame_len as u64;
            let now_ms = detector.samples_consumed * 1000 / DETECTION_SAMPLE_RATE as u64;

            let probability = match detector.scorer.score(frame) {
                Ok(p) if p.is_finite() => p.clamp(0.0, 1.0),
                Ok(p) => {
                    warn!(model = %detector.state.id, probability = p, "scorer returned a non-finite value");
                    continue;
                }
                Err(e) => {
                    warn!(model = %detector.state.id, "scoring failed: {e}");
                    continue;
                }
            };

            let state = &mut detector.state;
            if probability <= threshold {
                state.triggers_left = trigger_level;
                continue;
            }

            let cooling_down = state
                .last_triggered_ms
                .is_some_and(|t| now_ms.saturating_sub(t) < refractory_ms);
            if cooling_down {
                continue;
            }

            state.triggers_left = state.triggers_left.saturating_sub(1);
            if state.triggers_left == 0 {
                state.triggers_left = trigger_level;
                state.last_triggered_ms = Some(now_ms);
                state.is_detected = true;
                debug!(model = %state.id, timestamp_ms = now_ms, probability, "detection");
                detections.push(DetectionResult {
                    name: state.id.clone(),
                    timestamp_ms: now_ms,
                    probability,
                });
            }
        }
        detector.pending.drain(..offset);

        detections
    }

    fn available_models(&self) -> Vec<ModelInfo> {
        self.detector
            .as_ref()
            .map(|d| vec![d.info.clone()])
            .unwrap_or_default()
    }
}
