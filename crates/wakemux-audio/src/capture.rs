use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use wakemux_core::{AudioChunk, AudioError};

// ── CaptureHandle ─────────────────────────────────────────────

#[derive(Clone)]
pub struct CaptureHandle {
    enabled: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    id: String,
}

impl CaptureHandle {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Pause or resume forwarding; the device stream keeps running.
    pub fn set_enabled(&self, v: bool) {
        self.enabled.store(v, Ordering::Relaxed);
    }

    /// `true` once the device reported a stream error.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

// ── CaptureNode ───────────────────────────────────────────────

/// Live microphone stream that forwards every callback buffer to a tap channel.
pub struct CaptureNode {
    _stream: Stream,
}

impl CaptureNode {
    /// Open `device` with its default input configuration.
    pub fn new(
        device: &Device,
        tap: mpsc::UnboundedSender<AudioChunk>,
        id: &str,
    ) -> Result<(Self, CaptureHandle), AudioError> {
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;
        let config: StreamConfig = supported.config();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;

        let enabled = Arc::new(AtomicBool::new(true));
        let enabled_flag = Arc::clone(&enabled);
        let failed = Arc::new(AtomicBool::new(false));
        let failed_flag = Arc::clone(&failed);
        let capture_id = id.to_string();

        let err_callback = move |err: cpal::StreamError| {
            tracing::error!(capture_id = %capture_id, "capture stream error: {}", err);
            failed_flag.store(true, Ordering::Relaxed);
        };

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !enabled_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    let chunk = AudioChunk {
                        samples: data.to_vec(),
                        sample_rate,
                        channels,
                    };
                    // Receiver gone means the consumer finished; nothing to do.
                    let _ = tap.send(chunk);
                },
                err_callback,
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        tracing::info!(
            capture_id = %id,
            sample_rate,
            channels,
            "capture stream started"
        );

        let handle = CaptureHandle {
            enabled,
            failed,
            id: id.to_string(),
        };
        Ok((Self { _stream: stream }, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_capture_handle(id: &str) -> CaptureHandle {
        CaptureHandle {
            enabled: Arc::new(AtomicBool::new(true)),
            failed: Arc::new(AtomicBool::new(false)),
            id: id.to_string(),
        }
    }

    #[test]
    fn test_capture_handle_default_enabled() {
        let handle = make_capture_handle("mic1");
        assert!(handle.is_enabled());
        assert!(!handle.has_failed());
        assert_eq!(handle.id(), "mic1");
    }

    #[test]
    fn test_capture_handle_disable() {
        let handle = make_capture_handle("mic1");
        handle.set_enabled(false);
        assert!(!handle.is_enabled());
        handle.set_enabled(true);
        assert!(handle.is_enabled());
    }

    #[test]
    fn test_capture_handle_clone_shares_state() {
        let h1 = make_capture_handle("mic1");
        let h2 = h1.clone();
        h1.set_enabled(false);
        assert!(!h2.is_enabled());
        h1.failed.store(true, Ordering::Relaxed);
        assert!(h2.has_failed());
    }

    #[test]
    fn test_tap_dropped_receiver_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel::<AudioChunk>();
        drop(rx);
        let chunk = AudioChunk {
            samples: vec![0.0; 480],
            sample_rate: 48000,
            channels: 1,
        };
        let _ = tx.send(chunk);
    }
}
