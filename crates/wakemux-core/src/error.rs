use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("invalid model config '{name}': {reason}")]
    InvalidModel { name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to enumerate devices: {0}")]
    DeviceEnumeration(String),

    #[error("failed to build stream: {0}")]
    StreamBuild(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("unsupported audio format: {0}")]
    Format(String),

    #[error("resampling failed: {0}")]
    Resample(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load model '{name}': {reason}")]
    ModelLoad { name: String, reason: String },

    #[error("model '{name}' is busy ({active_requests} active request(s))")]
    ModelBusy { name: String, active_requests: usize },

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no model name given and no default model is set")]
    NoDefaultModel,

    #[error("model already registered: {0}")]
    DuplicateModel(String),

    #[error("invalid backend config: {0}")]
    InvalidConfig(String),

    #[error("scoring failed: {0}")]
    Scoring(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed event header: {0}")]
    Header(String),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("connection closed mid-frame")]
    UnexpectedEof,
}
