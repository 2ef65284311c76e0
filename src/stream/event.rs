//! Typed stream events and their payloads.

use crate::chunker::{ChunkMetadata, StreamChunk};
use crate::error::StreamError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Payloads above this many bytes are logged when validated
pub const OVERSIZE_WARN_BYTES: usize = 50_000;

/// Panel a stage event is rendered into by the consumer
pub const REASONING_PANEL: &str = "reasoning";

/// Event kinds understood by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    Chunk,
    End,
    Error,
    Metadata,
    Heartbeat,
    Progress,
    StageComplete,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::Start,
        EventType::Chunk,
        EventType::End,
        EventType::Error,
        EventType::Metadata,
        EventType::Heartbeat,
        EventType::Progress,
        EventType::StageComplete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::Chunk => "chunk",
            EventType::End => "end",
            EventType::Error => "error",
            EventType::Metadata => "metadata",
            EventType::Heartbeat => "heartbeat",
            EventType::Progress => "progress",
            EventType::StageComplete => "stage_complete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| StreamError::UnknownEventType(s.to_string()))
    }
}

static LAST_ID_MILLIS: AtomicU64 = AtomicU64::new(0);

/// Wall-clock millis, never lower than a value handed out before.
fn monotonic_millis() -> u64 {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let previous = LAST_ID_MILLIS.fetch_max(now, Ordering::Relaxed);
    previous.max(now)
}

/// `<type>-<millis>-<8 hex>`
pub fn generate_event_id(event_type: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", event_type, monotonic_millis(), &suffix[..8])
}

/// One unit on the event stream.
///
/// The type tag is kept as text so events arriving from elsewhere can be
/// validated; events built through [`Event::new`] always carry a known tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub data: Value,
    #[serde(default)]
    pub id: Option<String>,
    /// Reconnect hint in milliseconds
    #[serde(default)]
    pub retry: Option<u64>,
}

impl Event {
    pub fn new(kind: EventType, data: Map<String, Value>) -> Self {
        Self {
            event_type: kind.as_str().to_string(),
            data: Value::Object(data),
            id: Some(generate_event_id(kind.as_str())),
            retry: None,
        }
    }

    /// Serialize a typed payload; it must serialize to a JSON object.
    pub fn from_payload<T: Serialize>(kind: EventType, payload: &T) -> Result<Self, StreamError> {
        match serde_json::to_value(payload) {
            Ok(Value::Object(data)) => Ok(Self::new(kind, data)),
            Ok(other) => Err(StreamError::InvalidPayload(json_kind(&other).to_string())),
            Err(e) => Err(StreamError::Serialization(e.to_string())),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn without_id(mut self) -> Self {
        self.id = None;
        self
    }

    pub fn with_retry(mut self, millis: u64) -> Self {
        self.retry = Some(millis);
        self
    }

    pub fn kind(&self) -> Result<EventType, StreamError> {
        self.event_type.parse()
    }

    pub fn heartbeat() -> Self {
        let mut data = Map::new();
        data.insert(
            "timestamp".to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
        Self::new(EventType::Heartbeat, data)
    }

    pub fn chunk(chunk: &StreamChunk, stage_id: Option<&str>) -> Result<Self, StreamError> {
        Self::from_payload(
            EventType::Chunk,
            &ChunkPayload {
                content: &chunk.content,
                position: chunk.position,
                length: chunk.length,
                is_word_boundary: chunk.is_word_boundary,
                stage_id,
                metadata: chunk.metadata.as_ref(),
            },
        )
    }

    /// Start, End and StageComplete all share the stage payload shape.
    pub fn stage(
        kind: EventType,
        stage_id: &str,
        stage_name: &str,
        extra: Map<String, Value>,
    ) -> Result<Self, StreamError> {
        Self::from_payload(
            kind,
            &StagePayload {
                stage_id,
                stage_name,
                target_panel: REASONING_PANEL,
                extra,
            },
        )
    }

    pub fn error(code: &str, message: &str, stage_id: Option<&str>) -> Result<Self, StreamError> {
        Self::from_payload(
            EventType::Error,
            &ErrorPayload {
                code,
                message,
                stage_id,
            },
        )
    }

    pub fn progress(stage_id: &str, current: usize, total: usize) -> Result<Self, StreamError> {
        let progress_percent = if total > 0 {
            ((current as f64 / total as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        Self::from_payload(
            EventType::Progress,
            &ProgressPayload {
                stage_id,
                current_chunk: current,
                total_chunks: total,
                progress_percent,
            },
        )
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Serialize)]
struct ChunkPayload<'a> {
    content: &'a str,
    position: usize,
    length: usize,
    is_word_boundary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a ChunkMetadata>,
}

#[derive(Serialize)]
struct StagePayload<'a> {
    stage_id: &'a str,
    stage_name: &'a str,
    target_panel: &'a str,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage_id: Option<&'a str>,
}

#[derive(Serialize)]
struct ProgressPayload<'a> {
    stage_id: &'a str,
    current_chunk: usize,
    total_chunks: usize,
    progress_percent: f64,
}
