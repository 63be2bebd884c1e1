use crate::tee::tee;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wakemux_core::EngineError;
use wakemux_engine::ModelManager;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// "Say the wake word to start, say it again to stop."
///
/// Phase 1 listens on the start model with no buffer. After a hit the source is
/// teed into a recording sink and a detection loop on the stop model.
pub struct DualPhaseRecorder {
    start_model: Arc<ModelManager>,
    stop_model: Arc<ModelManager>,
    queue_capacity: usize,
}

impl DualPhaseRecorder {
    pub fn new(start_model: Arc<ModelManager>, stop_model: Arc<ModelManager>) -> Self {
        Self {
            start_model,
            stop_model,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Run both phases over `source` (16 kHz, 16-bit, mono PCM chunks).
    ///
    /// Returns `Ok(None)` when `stop` fires or the source ends before the stop word.
    pub async fn record(
        &self,
        mut source: mpsc::Receiver<Vec<u8>>,
        stop: CancellationToken,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        if !self.wait_for_start(&mut source, &stop).await? {
            return Ok(None);
        }
        info!(
            start_model = %self.start_model.name(),
            stop_model = %self.stop_model.name(),
            "recording started"
        );

        // External stop reaches every task through `halt`; dropping this
        // future cancels them too.
        let halt = stop.child_token();
        let _halt_on_drop = halt.clone().drop_guard();
        let fan_out = halt.child_token();

        let (sink_rx, detector_rx, producer) = tee(source, self.queue_capacity, fan_out.clone());
        let sink = tokio::spawn(collect(sink_rx, halt.clone()));
        let detector = tokio::spawn(watch_for_stop(
            Arc::clone(&self.stop_model),
            detector_rx,
            halt.clone(),
        ));

        let stopped_at = detector.await.unwrap_or_else(|e| {
            warn!("stop-word detector failed: {e}");
            Ok(None)
        });
        fan_out.cancel();
        if !matches!(stopped_at, Ok(Some(_))) {
            halt.cancel();
        }
        join(producer).await;
        let mut chunks = join(sink).await;

        match stopped_at? {
            Some(index) => {
                chunks.truncate(index + 1);
                let recording = chunks.concat();
                info!(chunks = chunks.len(), bytes = recording.len(), "recording finished");
                Ok(Some(recording))
            }
            None => {
                info!("recording discarded");
                Ok(None)
            }
        }
    }

    /// Phase 1. `true` once the start word is heard.
    async fn wait_for_start(
        &self,
        source: &mut mpsc::Receiver<Vec<u8>>,
        stop: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let request = self.start_model.request().await?;
        request.reset();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(false),
                chunk = source.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                debug!("audio source ended while waiting for the start word");
                return Ok(false);
            };
            if let Some(hit) = request.process_audio(&chunk).into_iter().next() {
                debug!(model = %hit.name, timestamp_ms = hit.timestamp_ms, "start word detected");
                return Ok(true);
            }
        }
    }
}

async fn join<T: Default>(handle: JoinHandle<T>) -> T {
    handle.await.unwrap_or_else(|e| {
        warn!("recorder task failed: {e}");
        T::default()
    })
}

/// Recording sink. On `halt` it still keeps every chunk already queued.
async fn collect(mut rx: mpsc::Receiver<Vec<u8>>, halt: CancellationToken) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = halt.cancelled() => {
                rx.close();
                while let Some(chunk) = rx.recv().await {
                    chunks.push(chunk);
                }
                break;
            }
            chunk = rx.recv() => match chunk {
                Some(chunk) => chunks.push(chunk),
                None => break,
            },
        }
    }
    chunks
}

/// Phase 2 detection loop. Yields the index of the chunk that held the stop word.
async fn watch_for_stop(
    manager: Arc<ModelManager>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    halt: CancellationToken,
) -> Result<Option<usize>, EngineError> {
    let request = manager.request().await?;
    request.reset();
    let mut index = 0;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = halt.cancelled() => return Ok(None),
            chunk = rx.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            debug!("audio source ended while recording");
            return Ok(None);
        };
        if let Some(hit) = request.process_audio(&chunk).into_iter().next() {
            debug!(model = %hit.name, chunk = index, "stop word detected");
            return Ok(Some(index));
        }
        index += 1;
    }
}
