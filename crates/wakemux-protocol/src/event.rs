use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use wakemux_core::{AudioFormat, ModelInfo, ProtocolError};

pub const MAX_HEADER_BYTES: usize = 64 * 1024;
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// One protocol message. Only `AudioChunk` carries a binary payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Describe,
    Info { models: Vec<ModelInfo> },
    /// Empty `names` selects the default model.
    Detect { names: Vec<String> },
    AudioStart { format: AudioFormat },
    /// Fields missing from `format` fall back to the ones announced by `AudioStart`.
    AudioChunk { format: ChunkFormat, audio: Vec<u8> },
    AudioStop,
    Detection { name: String, timestamp_ms: u64 },
    NotDetected,
    Error { text: String, code: Option<String> },
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    payload_length: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

#[derive(Deserialize)]
struct InfoData {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct DetectData {
    #[serde(default)]
    names: Vec<String>,
}

/// Audio format as sent on the wire, where any field may be left out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
}

impl ChunkFormat {
    /// Fill every missing field from `fallback`.
    pub fn resolve(&self, fallback: AudioFormat) -> AudioFormat {
        AudioFormat {
            rate: self.rate.unwrap_or(fallback.rate),
            width: self.width.unwrap_or(fallback.width),
            channels: self.channels.unwrap_or(fallback.channels),
        }
    }
}

impl From<AudioFormat> for ChunkFormat {
    fn from(format: AudioFormat) -> Self {
        Self {
            rate: Some(format.rate),
            width: Some(format.width),
            channels: Some(format.channels),
        }
    }
}

#[derive(Deserialize)]
struct DetectionData {
    name: String,
    #[serde(default)]
    timestamp_ms: u64,
}

#[derive(Deserialize)]
struct ErrorData {
    text: String,
    code: Option<String>,
}

fn format_data(format: &AudioFormat) -> Value {
    json!({
        "rate": format.rate,
        "width": format.width,
        "channels": format.channels,
    })
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Describe => "describe",
            Event::Info { .. } => "info",
            Event::Detect { .. } => "detect",
            Event::AudioStart { .. } => "audio-start",
            Event::AudioChunk { .. } => "audio-chunk",
            Event::AudioStop => "audio-stop",
            Event::Detection { .. } => "detection",
            Event::NotDetected => "not-detected",
            Event::Error { .. } => "error",
        }
    }

    pub fn error(text: impl Into<String>, code: &str) -> Self {
        Event::Error {
            text: text.into(),
            code: Some(code.to_string()),
        }
    }

    fn data(&self) -> Value {
        match self {
            Event::Describe | Event::AudioStop | Event::NotDetected => Value::Null,
            Event::Info { models } => json!({ "models": models }),
            Event::Detect { names } => json!({ "names": names }),
            Event::AudioStart { format } => format_data(format),
            Event::AudioChunk { format, .. } => json!(format),
            Event::Detection { name, timestamp_ms } => {
                json!({ "name": name, "timestamp_ms": timestamp_ms })
            }
            Event::Error { text, code } => match code {
                Some(code) => json!({ "text": text, "code": code }),
                None => json!({ "text": text }),
            },
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Event::AudioChunk { audio, .. } => audio,
            _ => &[],
        }
    }

    /// Build an event from a decoded header. Unknown types yield `None`.
    fn from_parts(
        kind: &str,
        data: Map<String, Value>,
        payload: Vec<u8>,
    ) -> Result<Option<Self>, ProtocolError> {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: &str,
            data: Map<String, Value>,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(Value::Object(data))
                .map_err(|e| ProtocolError::Header(format!("bad '{kind}' data: {e}")))
        }

        let event = match kind {
            "describe" => Event::Describe,
            "info" => Event::Info {
                models: parse::<InfoData>(kind, data)?.models,
            },
            "detect" => Event::Detect {
                names: parse::<DetectData>(kind, data)?.names,
            },
            "audio-start" => Event::AudioStart {
                format: parse::<ChunkFormat>(kind, data)?.resolve(AudioFormat::DETECTION),
            },
            "audio-chunk" => Event::AudioChunk {
                format: parse::<ChunkFormat>(kind, data)?,
                audio: payload,
            },
            "audio-stop" => Event::AudioStop,
            "detection" => {
                let data: DetectionData = parse(kind, data)?;
                Event::Detection {
                    name: data.name,
                    timestamp_ms: data.timestamp_ms,
                }
            }
            "not-detected" => Event::NotDetected,
            "error" => {
                let data: ErrorData = parse(kind, data)?;
                Event::Error {
                    text: data.text,
                    code: data.code,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Read the next known event. Returns `Ok(None)` on a clean end of stream.
///
/// Every event is one JSON header line followed by `payload_length` raw bytes:
///
/// ```text
/// {"type":"audio-chunk","data":{"rate":16000,"width":2,"channels":1},"payload_length":3200}\n
/// <3200 bytes of PCM>
/// ```
pub async fn read_event<R>(reader: &mut R) -> Result<Option<Event>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let n = (&mut *reader)
            .take(MAX_HEADER_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            if line.len() > MAX_HEADER_BYTES {
                return Err(ProtocolError::FrameTooLarge(line.len()));
            }
            return Err(ProtocolError::UnexpectedEof);
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let header: Header = serde_json::from_slice(&line)
            .map_err(|e| ProtocolError::Header(e.to_string()))?;
        if header.payload_length > MAX_PAYLOAD_BYTES {
            return Err(ProtocolError::FrameTooLarge(header.payload_length));
        }

        let mut payload = vec![0u8; header.payload_length];
        if let Err(e) = reader.read_exact(&mut payload).await {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => ProtocolError::UnexpectedEof,
                _ => ProtocolError::Io(e),
            });
        }

        match Event::from_parts(&header.kind, header.data, payload)? {
            Some(event) => return Ok(Some(event)),
            None => debug!(kind = %header.kind, "ignoring unknown event type"),
        }
    }
}

pub async fn write_event<W>(writer: &mut W, event: &Event) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let data = match event.data() {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let payload = event.payload();
    let header = Header {
        kind: event.kind().to_string(),
        data,
        payload_length: payload.len(),
    };
    let mut line =
        serde_json::to_vec(&header).map_err(|e| ProtocolError::Header(e.to_string()))?;
    line.push(b'\n');

    writer.write_all(&line).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    async fn encode(events: &[Event]) -> Vec<u8> {
        let mut buf = Vec::new();
        for event in events {
            write_event(&mut buf, event).await.unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn test_audio_chunk_carries_payload() {
        let event = Event::AudioChunk {
            format: AudioFormat::DETECTION.into(),
            audio: vec![1, 2, 3, 4],
        };
        let bytes = encode(std::slice::from_ref(&event)).await;
        let newline = bytes.iter().position(|&b| b == b'\n').unwrap();
        let header: Value = serde_json::from_slice(&bytes[..newline]).unwrap();
        assert_eq!(header["type"], "audio-chunk");
        assert_eq!(header["payload_length"], 4);
        assert_eq!(header["data"]["rate"], 16000);
        assert_eq!(&bytes[newline + 1..], &[1, 2, 3, 4]);

        let mut reader = bytes.as_slice();
        assert_eq!(read_event(&mut reader).await.unwrap(), Some(event));
        assert_eq!(read_event(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_event_sequence_survives_framing() {
        let events = vec![
            Event::Describe,
            Event::Info {
                models: vec![ModelInfo {
                    name: "hey-bot".to_string(),
                    phrase: "hey bot".to_string(),
                    languages: BTreeSet::from(["en".to_string()]),
                    is_builtin: false,
                }],
            },
            Event::Detect {
                names: vec!["hey-bot".to_string()],
            },
            Event::AudioStop,
            Event::Detection {
                name: "hey-bot".to_string(),
                timestamp_ms: 1280,
            },
            Event::NotDetected,
            Event::error("bad chunk", "audio-format"),
        ];
        let bytes = encode(&events).await;
        let mut reader = bytes.as_slice();
        for expected in &events {
            assert_eq!(read_event(&mut reader).await.unwrap().as_ref(), Some(expected));
        }
        assert!(read_event(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_minimal_headers_use_defaults() {
        let raw = b"{\"type\":\"detect\"}\n{\"type\":\"audio-start\",\"data\":{\"rate\":48000}}\n";
        let mut reader = &raw[..];
        assert_eq!(
            read_event(&mut reader).await.unwrap(),
            Some(Event::Detect { names: vec![] })
        );
        assert_eq!(
            read_event(&mut reader).await.unwrap(),
            Some(Event::AudioStart {
                format: AudioFormat {
                    rate: 48000,
                    width: 2,
                    channels: 1
                }
            })
        );
    }

    #[tokio::test]
    async fn test_partial_chunk_format_keeps_given_fields() {
        let raw = b"{\"type\":\"audio-chunk\",\"data\":{\"rate\":8000},\"payload_length\":2}\nab";
        let mut reader = &raw[..];
        let event = read_event(&mut reader).await.unwrap().unwrap();
        let Event::AudioChunk { format, audio } = &event else {
            panic!("expected an audio chunk, got {event:?}");
        };
        assert_eq!(
            *format,
            ChunkFormat {
                rate: Some(8000),
                width: None,
                channels: None
            }
        );
        assert_eq!(audio, b"ab");
        assert_eq!(
            format.resolve(AudioFormat::DETECTION),
            AudioFormat {
                rate: 8000,
                width: 2,
                channels: 1
            }
        );

        let bytes = encode(std::slice::from_ref(&event)).await;
        let newline = bytes.iter().position(|&b| b == b'\n').unwrap();
        let header: Value = serde_json::from_slice(&bytes[..newline]).unwrap();
        assert_eq!(header["data"], json!({ "rate": 8000 }));
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_skipped_with_its_payload() {
        let raw = b"{\"type\":\"transcribe\",\"payload_length\":3}\nabc\n{\"type\":\"audio-stop\"}\n";
        let mut reader = &raw[..];
        assert_eq!(read_event(&mut reader).await.unwrap(), Some(Event::AudioStop));
    }

    #[tokio::test]
    async fn test_malformed_header_is_an_error() {
        let mut reader = &b"not json\n"[..];
        assert!(matches!(
            read_event(&mut reader).await,
            Err(ProtocolError::Header(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_unexpected_eof() {
        let mut reader = &b"{\"type\":\"audio-chunk\",\"payload_length\":10}\nabc"[..];
        assert!(matches!(
            read_event(&mut reader).await,
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let raw = format!(
            "{{\"type\":\"audio-chunk\",\"payload_length\":{}}}\n",
            MAX_PAYLOAD_BYTES + 1
        );
        let mut reader = raw.as_bytes();
        assert!(matches!(
            read_event(&mut reader).await,
            Err(ProtocolError::FrameTooLarge(n)) if n == MAX_PAYLOAD_BYTES + 1
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_is_rejected() {
        let raw = vec![b' '; MAX_HEADER_BYTES + 10];
        let mut reader = raw.as_slice();
        assert!(matches!(
            read_event(&mut reader).await,
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
