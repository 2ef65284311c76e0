//! Wire encoding for events.
//!
//! ```text
//! event: <type>
//! id: <id>
//! retry: <millis>
//! data: <compact json object>
//!
//! ```
//! `id` and `retry` lines appear only when set. Every event ends with a blank line.

use super::event::{json_kind, Event, EventType, OVERSIZE_WARN_BYTES};
use crate::error::StreamError;
use serde_json::Value;
use tracing::warn;

/// Check an event against the wire contract.
pub fn check(event: &Event) -> Result<(), StreamError> {
    event.event_type.parse::<EventType>()?;
    if !event.data.is_object() {
        return Err(StreamError::InvalidPayload(
            json_kind(&event.data).to_string(),
        ));
    }
    if let Some(id) = &event.id {
        if id.contains(&['\n', '\r'][..]) {
            return Err(StreamError::InvalidPayload(
                "event id must be a single line".to_string(),
            ));
        }
    }
    Ok(())
}

/// True when the event can be put on the wire. Oversized payloads pass with a warning.
pub fn validate(event: &Event) -> bool {
    if check(event).is_err() {
        return false;
    }
    match serde_json::to_string(&event.data) {
        Ok(body) => {
            warn_if_oversized(&event.event_type, body.len());
            true
        }
        Err(_) => false,
    }
}

fn warn_if_oversized(event_type: &str, bytes: usize) {
    if bytes > OVERSIZE_WARN_BYTES {
        warn!(event_type, bytes, "Large event payload");
    }
}

/// Encode one event into its wire text.
pub fn encode(event: &Event) -> Result<String, StreamError> {
    check(event)?;
    let data = serde_json::to_string(&event.data)
        .map_err(|e| StreamError::Serialization(e.to_string()))?;
    warn_if_oversized(&event.event_type, data.len());

    let mut out = String::with_capacity(data.len() + 64);
    out.push_str("event: ");
    out.push_str(&event.event_type);
    out.push('\n');
    if let Some(id) = &event.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(retry) = event.retry {
        out.push_str("retry: ");
        out.push_str(&retry.to_string());
        out.push('\n');
    }
    out.push_str("data: ");
    out.push_str(&data);
    out.push_str("\n\n");
    Ok(out)
}
