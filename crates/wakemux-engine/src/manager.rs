use crate::backend::Backend;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wakemux_core::{DetectionResult, EngineError, ModelInfo, ModelState, ModelStats, ModelStatus};

struct ManagerInner {
    state: ModelState,
    active_requests: usize,
    /// Later of the last load and the last time `active_requests` dropped to zero.
    idle_since: Option<Instant>,
    stats: ModelStats,
}

struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Loads its backend on first use and unloads it after `ttl` without requests.
///
/// Callers hold a [`ModelRequest`] while they use the backend. Load and unload
/// transitions are serialized by one async gate, and unloading is refused
/// while any request is active.
pub struct ModelManager {
    name: String,
    device: String,
    ttl: Duration,
    backend: Mutex<Box<dyn Backend>>,
    lifecycle: tokio::sync::Mutex<()>,
    inner: Mutex<ManagerInner>,
    idle_changed: Notify,
    watcher: Mutex<Option<Watcher>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModelManager {
    pub fn new(backend: Box<dyn Backend>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: backend.name().to_string(),
            device: backend.device().to_string(),
            ttl,
            backend: Mutex::new(backend),
            lifecycle: tokio::sync::Mutex::new(()),
            inner: Mutex::new(ManagerInner {
                state: ModelState::Unloaded,
                active_requests: 0,
                idle_since: None,
                stats: ModelStats::default(),
            }),
            idle_changed: Notify::new(),
            watcher: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn state(&self) -> ModelState {
        lock(&self.inner).state
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == ModelState::Loaded
    }

    pub fn active_requests(&self) -> usize {
        lock(&self.inner).active_requests
    }

    pub fn stats(&self) -> ModelStats {
        lock(&self.inner).stats.clone()
    }

    /// Time until the idle backend is evicted; `None` when nothing is scheduled
    /// or the TTL reaches past the end of the clock.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        let inner = lock(&self.inner);
        if inner.state != ModelState::Loaded || inner.active_requests > 0 {
            return None;
        }
        let deadline = inner.idle_since?.checked_add(self.ttl)?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    /// Models the loaded backend can detect; empty while unloaded.
    pub fn available_models(&self) -> Vec<ModelInfo> {
        if !self.is_loaded() {
            return Vec::new();
        }
        lock(&self.backend).available_models()
    }

    pub fn status(&self) -> ModelStatus {
        let ttl_remaining = self.ttl_remaining().map(|d| d.as_secs_f64());
        let inner = lock(&self.inner);
        ModelStatus {
            name: self.name.clone(),
            state: inner.state,
            loaded: inner.state == ModelState::Loaded,
            device: self.device.clone(),
            ttl_seconds: self.ttl.as_secs_f64(),
            ttl_remaining,
            active_requests: inner.active_requests,
            is_default: false,
            stats: inner.stats.clone(),
        }
    }

    /// Ensure the backend is loaded. Concurrent callers share one load.
    pub async fn get_model(&self) -> Result<(), EngineError> {
        if self.is_loaded() {
            return Ok(());
        }

        let _gate = self.lifecycle.lock().await;
        if self.is_loaded() {
            return Ok(());
        }

        lock(&self.inner).state = ModelState::Loading;
        info!(model = %self.name, "loading model");
        let started_at = SystemTime::now();
        let result = self.load_backend();

        let mut inner = lock(&self.inner);
        match result {
            Ok(elapsed) => {
                inner.state = ModelState::Loaded;
                inner.idle_since = Some(Instant::now());
                inner.stats.load_count += 1;
                inner.stats.last_load_time = Some(started_at);
                inner.stats.load_duration_seconds = Some(elapsed.as_secs_f64());
                drop(inner);
                self.idle_changed.notify_one();
                info!(
                    model = %self.name,
                    load_seconds = elapsed.as_secs_f64(),
                    "model loaded"
                );
                Ok(())
            }
            Err(e) => {
                inner.state = ModelState::Unloaded;
                error!(model = %self.name, "model load failed: {e}");
                Err(e)
            }
        }
    }

    /// Run the blocking `Backend::load` without stalling other tasks on this worker.
    fn load_backend(&self) -> Result<Duration, EngineError> {
        let load = || lock(&self.backend).load();
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(load),
            _ => load(),
        }
    }

    /// Enter a request scope: the backend stays loaded until the returned guard drops.
    pub async fn request(self: &Arc<Self>) -> Result<ModelRequest, EngineError> {
        let request = ModelRequest::enter(Arc::clone(self));
        self.get_model().await?;
        Ok(request)
    }

    /// Unload now. Fails while any request is active.
    pub async fn unload(&self) -> Result<(), EngineError> {
        let _gate = self.lifecycle.lock().await;
        {
            let mut inner = lock(&self.inner);
            if inner.active_requests > 0 {
                return Err(EngineError::ModelBusy {
                    name: self.name.clone(),
                    active_requests: inner.active_requests,
                });
            }
            if inner.state != ModelState::Loaded {
                return Ok(());
            }
            inner.state = ModelState::Unloading;
        }
        self.finish_unload();
        info!(model = %self.name, "model unloaded on request");
        Ok(())
    }

    /// Start the idle watcher. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut watcher = lock(&self.watcher);
        if watcher.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).watch_idle(cancel.clone()));
        *watcher = Some(Watcher { cancel, handle });
        debug!(model = %self.name, ttl = ?self.ttl, "idle watcher started");
    }

    /// Stop the idle watcher and unload, even if requests are still active.
    pub async fn stop(&self) {
        let watcher = lock(&self.watcher).take();
        if let Some(watcher) = watcher {
            watcher.cancel.cancel();
            if let Err(e) = watcher.handle.await {
                warn!(model = %self.name, "idle watcher ended abnormally: {e}");
            }
        }

        let _gate = self.lifecycle.lock().await;
        {
            let mut inner = lock(&self.inner);
            if inner.state != ModelState::Loaded {
                return;
            }
            if inner.active_requests > 0 {
                warn!(
                    model = %self.name,
                    active_requests = inner.active_requests,
                    "force-unloading model with active requests"
                );
            }
            inner.state = ModelState::Unloading;
        }
        self.finish_unload();
        info!(model = %self.name, "model unloaded on shutdown");
    }

    fn finish_unload(&self) {
        lock(&self.backend).unload();
        {
            let mut inner = lock(&self.inner);
            inner.state = ModelState::Unloaded;
            inner.idle_since = None;
            inner.stats.unload_count += 1;
        }
        self.idle_changed.notify_one();
    }

    fn release(&self) {
        let now_idle = {
            let mut inner = lock(&self.inner);
            debug_assert!(inner.active_requests > 0, "request released twice");
            inner.active_requests = inner.active_requests.saturating_sub(1);
            if inner.active_requests == 0 {
                inner.idle_since = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if now_idle {
            self.idle_changed.notify_one();
        }
    }

    fn eviction_deadline(&self) -> Option<Instant> {
        let inner = lock(&self.inner);
        if inner.state == ModelState::Loaded && inner.active_requests == 0 {
            inner.idle_since.and_then(|t| t.checked_add(self.ttl))
        } else {
            None
        }
    }

    async fn watch_idle(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let deadline = self.eviction_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.idle_changed.notified() => continue,
                _ = sleep_until(deadline) => self.evict_if_idle().await,
            }
        }
        debug!(model = %self.name, "idle watcher stopped");
    }

    async fn evict_if_idle(&self) {
        let _gate = self.lifecycle.lock().await;
        {
            let mut inner = lock(&self.inner);
            let expired = inner.state == ModelState::Loaded
                && inner.active_requests == 0
                && inner
                    .idle_since
                    .and_then(|t| t.checked_add(self.ttl))
                    .is_some_and(|deadline| Instant::now() >= deadline);
            if !expired {
                return;
            }
            inner.state = ModelState::Unloading;
        }
        self.finish_unload();
        info!(model = %self.name, ttl = ?self.ttl, "model unloaded after idle timeout");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── ModelRequest ──────────────────────────────────────────────

/// Active use of a loaded backend. Dropping it (including on cancellation) ends the request.
pub struct ModelRequest {
    manager: Arc<ModelManager>,
}

impl ModelRequest {
    fn enter(manager: Arc<ModelManager>) -> Self {
        {
            let mut inner = lock(&manager.inner);
            inner.active_requests += 1;
            inner.stats.total_requests += 1;
            inner.stats.last_request_time = Some(SystemTime::now());
        }
        Self { manager }
    }

    pub fn model_name(&self) -> &str {
        self.manager.name()
    }

    pub fn process_audio(&self, chunk: &[u8]) -> Vec<DetectionResult> {
        let seconds = wakemux_core::AudioFormat::DETECTION
            .duration_of(chunk.len())
            .as_secs_f64();
        lock(&self.manager.inner).stats.total_audio_seconds += seconds;
        lock(&self.manager.backend).process_audio(chunk)
    }

    pub fn reset(&self) {
        lock(&self.manager.backend).reset();
    }

    pub fn is_detected(&self) -> bool {
        lock(&self.manager.backend).is_detected()
    }

    pub fn available_models(&self) -> Vec<ModelInfo> {
        lock(&self.manager.backend).available_models()
    }
}

impl Drop for ModelRequest {
    fn drop(&mut self) {
        self.manager.release();
    }
}
