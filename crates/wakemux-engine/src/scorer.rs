use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use wakemux_core::{BackendConfig, EngineError, ModelInfo};

/// Frame length used by the builtin scorers: 80 ms at 16 kHz.
pub const DEFAULT_FRAME_SAMPLES: usize = 1280;

/// Turns one fixed-size frame of 16 kHz mono samples into a wake-word probability.
///
/// This is the seam to the feature-extraction / inference stack. A
/// [`DetectorBackend`](crate::DetectorBackend) owns one scorer per detector and
/// feeds it frames of exactly [`frame_samples`](Self::frame_samples) samples.
pub trait Scorer: Send {
    fn frame_samples(&self) -> usize;
    fn score(&mut self, frame: &[i16]) -> Result<f32, EngineError>;
    /// Drop any streaming state carried between frames.
    fn reset(&mut self) {}
}

// ── EnergyScorer ──────────────────────────────────────────────

/// RMS-energy scorer: loud frames score high, silence scores zero.
pub struct EnergyScorer {
    frame_samples: usize,
    gain: f32,
}

impl EnergyScorer {
    pub fn new(frame_samples: usize, gain: f32) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            gain,
        }
    }
}

impl Default for EnergyScorer {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_SAMPLES, 1.0)
    }
}

impl Scorer for EnergyScorer {
    fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    fn score(&mut self, frame: &[i16]) -> Result<f32, EngineError> {
        if frame.is_empty() {
            return Err(EngineError::Scoring("empty frame".to_string()));
        }
        let energy: f64 = frame
            .iter()
            .map(|&s| {
                let normalized = s as f64 / 32768.0;
                normalized * normalized
            })
            .sum();
        let rms = (energy / frame.len() as f64).sqrt() as f32;
        Ok((rms * self.gain).clamp(0.0, 1.0))
    }
}

// ── Custom model descriptors ──────────────────────────────────

/// `<custom_model_dir>/<name>.toml`
#[derive(Debug, Deserialize)]
struct CustomModelDescriptor {
    phrase: Option<String>,
    #[serde(default)]
    languages: BTreeSet<String>,
    #[serde(default = "default_gain")]
    gain: f32,
    #[serde(default = "default_frame_samples")]
    frame_samples: usize,
}

fn default_gain() -> f32 {
    1.0
}

fn default_frame_samples() -> usize {
    DEFAULT_FRAME_SAMPLES
}

fn load_custom_model(
    dir: &Path,
    name: &str,
) -> Result<(ModelInfo, Box<dyn Scorer>), EngineError> {
    let path = dir.join(format!("{name}.toml"));
    let load_error = |reason: String| EngineError::ModelLoad {
        name: name.to_string(),
        reason,
    };

    let content = std::fs::read_to_string(&path)
        .map_err(|e| load_error(format!("cannot read {}: {e}", path.display())))?;
    let descriptor: CustomModelDescriptor = toml::from_str(&content)
        .map_err(|e| load_error(format!("invalid descriptor {}: {e}", path.display())))?;
    if descriptor.frame_samples == 0 {
        return Err(load_error("frame_samples must be at least 1".to_string()));
    }

    let info = ModelInfo {
        name: name.to_string(),
        phrase: descriptor.phrase.unwrap_or_else(|| name.replace(['_', '-'], " ")),
        languages: descriptor.languages,
        is_builtin: false,
    };
    tracing::debug!(model = %name, path = %path.display(), "loaded custom model descriptor");
    Ok((
        info,
        Box::new(EnergyScorer::new(descriptor.frame_samples, descriptor.gain)),
    ))
}

// ── ScorerCatalog ─────────────────────────────────────────────

pub type ScorerFactory =
    Arc<dyn Fn(&BackendConfig) -> Result<Box<dyn Scorer>, EngineError> + Send + Sync>;

struct CatalogEntry {
    info: ModelInfo,
    factory: ScorerFactory,
}

/// Known models and how to build a scorer for each.
pub struct ScorerCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl ScorerCatalog {
    pub fn new() -> Self {
        let mut catalog = Self {
            entries: HashMap::new(),
        };
        catalog.register(
            ModelInfo {
                name: "energy".to_string(),
                phrase: "any loud sound".to_string(),
                languages: BTreeSet::new(),
                is_builtin: true,
            },
            |_| Ok(Box::new(EnergyScorer::default())),
        );
        catalog
    }

    pub fn register<F>(&mut self, info: ModelInfo, factory: F)
    where
        F: Fn(&BackendConfig) -> Result<Box<dyn Scorer>, EngineError> + Send + Sync + 'static,
    {
        self.entries.insert(
            info.name.clone(),
            CatalogEntry {
                info,
                factory: Arc::new(factory),
            },
        );
    }

    /// Build the scorer for `config`: catalog entries first, then the custom model directory.
    pub fn resolve(
        &self,
        config: &BackendConfig,
    ) -> Result<(ModelInfo, Box<dyn Scorer>), EngineError> {
        let name = config.derived_name();
        if let Some(entry) = self.entries.get(&name) {
            let scorer = (entry.factory)(config)?;
            return Ok((entry.info.clone(), scorer));
        }

        match config.custom_model_dir.as_deref() {
            Some(dir) => load_custom_model(dir, &name),
            None => Err(EngineError::ModelLoad {
                name,
                reason: "model not found in catalog".to_string(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn list_models(&self) -> Vec<ModelInfo> {
        let mut models: Vec<_> = self.entries.values().map(|e| e.info.clone()).collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }
}

impl Default for ScorerCatalog {
    fn default() -> Self {
        Self::new()
    }
}
