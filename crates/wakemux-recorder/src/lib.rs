pub mod recorder;
pub mod tee;

pub use recorder::{DualPhaseRecorder, DEFAULT_QUEUE_CAPACITY};
pub use tee::tee;
