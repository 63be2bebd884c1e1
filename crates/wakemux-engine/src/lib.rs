pub mod backend;
pub mod manager;
pub mod registry;
pub mod scorer;

pub use backend::{Backend, DetectorBackend};
pub use manager::{ModelManager, ModelRequest};
pub use registry::{ManagedModel, ManagerBuilder, ModelRegistry, RegistryConfig};
pub use scorer::{EnergyScorer, Scorer, ScorerCatalog, ScorerFactory, DEFAULT_FRAME_SAMPLES};
