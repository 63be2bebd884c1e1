use crate::event::{ChunkFormat, Event};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wakemux_audio::convert;
use wakemux_core::{AudioFormat, EngineError, ModelInfo};
use wakemux_engine::{ModelManager, ModelRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Detecting,
}

/// Per-connection protocol state.
///
/// Holds no model request between events; every chunk is scored inside its own
/// request scope, so dropping the session releases everything.
pub struct ProtocolSession {
    id: String,
    registry: Arc<ModelRegistry>,
    state: SessionState,
    selected: Vec<Arc<ModelManager>>,
    format: AudioFormat,
    detected: bool,
}

impl ProtocolSession {
    pub fn new(id: &str, registry: Arc<ModelRegistry>) -> Self {
        Self {
            id: id.to_string(),
            registry,
            state: SessionState::Idle,
            selected: Vec::new(),
            format: AudioFormat::DETECTION,
            detected: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn selected_models(&self) -> Vec<&str> {
        self.selected.iter().map(|m| m.name()).collect()
    }

    /// Apply one inbound event and return the events to send back, in order.
    pub async fn handle_event(&mut self, event: Event) -> Vec<Event> {
        debug!(session = %self.id, event = event.kind(), state = ?self.state, "event received");
        match event {
            Event::Describe => vec![self.describe()],
            Event::Detect { names } => {
                self.select(&names);
                Vec::new()
            }
            Event::AudioStart { format } => self.start_segment(format).await,
            Event::AudioChunk { format, audio } => self.process_chunk(format, &audio).await,
            Event::AudioStop => self.stop_segment(),
            other => {
                debug!(session = %self.id, event = other.kind(), "ignoring outbound-only event");
                Vec::new()
            }
        }
    }

    fn describe(&self) -> Event {
        let managers = self.registry.managers();
        let mut models: Vec<ModelInfo> = managers
            .iter()
            .filter(|m| m.is_loaded())
            .flat_map(|m| m.available_models())
            .collect();
        if models.is_empty() {
            models = managers
                .iter()
                .map(|m| ModelInfo::placeholder(m.name()))
                .collect();
        }
        Event::Info { models }
    }

    fn resolve(&self, names: &[String]) -> Result<Vec<Arc<ModelManager>>, EngineError> {
        if names.is_empty() {
            return Ok(vec![self.registry.get_manager(None)?]);
        }
        let mut managers: Vec<Arc<ModelManager>> = Vec::with_capacity(names.len());
        for name in names {
            let manager = self.registry.get_manager(Some(name))?;
            if !managers.iter().any(|m| Arc::ptr_eq(m, &manager)) {
                managers.push(manager);
            }
        }
        Ok(managers)
    }

    fn select(&mut self, names: &[String]) {
        if self.state == SessionState::Detecting {
            warn!(session = %self.id, "detect received mid-segment; keeping current selection");
            return;
        }
        match self.resolve(names) {
            Ok(managers) => {
                self.selected = managers;
                self.state = SessionState::Configured;
                info!(session = %self.id, models = ?self.selected_models(), "detectors selected");
            }
            Err(e) => {
                warn!(session = %self.id, ?names, "selection not applied: {e}");
            }
        }
    }

    async fn start_segment(&mut self, format: AudioFormat) -> Vec<Event> {
        if self.state == SessionState::Idle {
            match self.resolve(&[]) {
                Ok(managers) => {
                    self.selected = managers;
                    self.state = SessionState::Configured;
                }
                Err(e) => return vec![Event::error(e.to_string(), "no-model")],
            }
        }

        for manager in &self.selected {
            match manager.request().await {
                Ok(request) => request.reset(),
                Err(e) => {
                    self.state = SessionState::Configured;
                    return vec![Event::error(e.to_string(), "model-load")];
                }
            }
        }

        self.format = format;
        self.detected = false;
        self.state = SessionState::Detecting;
        debug!(session = %self.id, ?format, "audio segment started");
        Vec::new()
    }

    async fn process_chunk(&mut self, format: ChunkFormat, audio: &[u8]) -> Vec<Event> {
        if self.state != SessionState::Detecting {
            debug!(session = %self.id, "audio chunk outside a segment; ignored");
            return Vec::new();
        }

        let format = format.resolve(self.format);
        let pcm = match convert(audio, format, AudioFormat::DETECTION) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!(session = %self.id, "audio conversion failed: {e}");
                self.end_segment();
                return vec![Event::error(e.to_string(), "audio-format")];
            }
        };

        let mut events = Vec::new();
        for manager in &self.selected {
            let request = match manager.request().await {
                Ok(request) => request,
                Err(e) => {
                    self.state = SessionState::Configured;
                    self.detected = false;
                    events.push(Event::error(e.to_string(), "model-load"));
                    return events;
                }
            };
            for detection in request.process_audio(&pcm) {
                info!(
                    session = %self.id,
                    model = %detection.name,
                    timestamp_ms = detection.timestamp_ms,
                    probability = detection.probability,
                    "wake word detected"
                );
                self.detected = true;
                events.push(Event::Detection {
                    name: detection.name,
                    timestamp_ms: detection.timestamp_ms,
                });
            }
        }
        events
    }

    fn stop_segment(&mut self) -> Vec<Event> {
        if self.state != SessionState::Detecting {
            debug!(session = %self.id, "audio stop outside a segment; ignored");
            return Vec::new();
        }
        let detected = self.detected;
        self.end_segment();
        if detected {
            Vec::new()
        } else {
            vec![Event::NotDetected]
        }
    }

    fn end_segment(&mut self) {
        self.state = SessionState::Configured;
        self.detected = false;
    }
}
