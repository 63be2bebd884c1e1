pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, GeneralConfig, ModelsConfig, RecorderConfig, ServerConfig};
pub use error::{AudioError, ConfigError, EngineError, ProtocolError};
pub use types::{
    AudioChunk, AudioFormat, BackendConfig, DetectionResult, ModelInfo, ModelState, ModelStats,
    ModelStatus, DETECTION_SAMPLE_RATE,
};
