pub mod capture;
pub mod convert;
pub mod device;

pub use capture::{CaptureHandle, CaptureNode};
pub use convert::{convert, pcm16_mono_16k};
pub use device::DeviceManager;
