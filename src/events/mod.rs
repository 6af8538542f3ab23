//! Platform Event Model
//!
//! Producers speak the wire form ([`RawPlatformEvent`]): a type string, an
//! ISO-8601 timestamp and an untyped JSON payload. The bus boundary turns it
//! into a [`PlatformEvent`] whose payload is a typed variant, so chambers never
//! poke at string keys.

pub mod payload;
pub mod taxonomy;

pub use payload::*;
pub use taxonomy::{EventType, UnknownEventType, TAXONOMY_VERSION};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Wire form of an event, exactly as producers submit it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPlatformEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: String,
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Validated, immutable platform event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPlatformEvent", into = "RawPlatformEvent")]
pub struct PlatformEvent {
    timestamp: DateTime<Utc>,
    subject_id: String,
    correlation_id: Option<String>,
    payload: EventPayload,
}

impl PlatformEvent {
    pub fn new(subject_id: impl Into<String>, timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            timestamp,
            subject_id: subject_id.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Decode and validate a wire event
    pub fn from_raw(raw: RawPlatformEvent) -> Result<Self, EventDecodeError> {
        let event_type: EventType = raw
            .event_type
            .parse()
            .map_err(EventDecodeError::UnknownType)?;

        let timestamp = DateTime::parse_from_rfc3339(&raw.timestamp)
            .map_err(|e| EventDecodeError::InvalidTimestamp {
                value: raw.timestamp.clone(),
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);

        let payload = EventPayload::decode(event_type, raw.payload).map_err(|e| {
            EventDecodeError::MalformedPayload {
                event_type,
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            timestamp,
            subject_id: raw.subject_id,
            correlation_id: raw.correlation_id,
            payload,
        })
    }

    pub fn to_raw(&self) -> RawPlatformEvent {
        RawPlatformEvent {
            event_type: self.event_type().as_str().to_string(),
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            subject_id: self.subject_id.clone(),
            correlation_id: self.correlation_id.clone(),
            payload: self.payload.encode(),
        }
    }
}

impl TryFrom<RawPlatformEvent> for PlatformEvent {
    type Error = EventDecodeError;

    fn try_from(raw: RawPlatformEvent) -> Result<Self, Self::Error> {
        PlatformEvent::from_raw(raw)
    }
}

impl From<PlatformEvent> for RawPlatformEvent {
    fn from(event: PlatformEvent) -> Self {
        event.to_raw()
    }
}

/// Why a wire event could not be turned into a [`PlatformEvent`]
#[derive(Debug, Clone)]
pub enum EventDecodeError {
    UnknownType(UnknownEventType),
    InvalidTimestamp { value: String, reason: String },
    MalformedPayload { event_type: EventType, reason: String },
}

impl std::fmt::Display for EventDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownType(e) => write!(f, "{}", e),
            Self::InvalidTimestamp { value, reason } => {
                write!(f, "invalid timestamp '{}': {}", value, reason)
            }
            Self::MalformedPayload { event_type, reason } => {
                write!(f, "malformed {} payload: {}", event_type, reason)
            }
        }
    }
}

impl std::error::Error for EventDecodeError {}

/// Read newline-delimited wire events, skipping blank lines
pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Vec<RawPlatformEvent>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event file: {}", path.display()))?;

    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<RawPlatformEvent>(line)
                .with_context(|| format!("{}:{}: invalid event line", path.display(), idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn raw(event_type: &str, payload: Value) -> RawPlatformEvent {
        RawPlatformEvent {
            event_type: event_type.to_string(),
            timestamp: "2026-03-01T12:00:00Z".to_string(),
            subject_id: "subject-1".to_string(),
            correlation_id: Some("corr-1".to_string()),
            payload,
        }
    }

    #[test]
    fn test_from_raw_builds_typed_event() {
        let event = PlatformEvent::from_raw(raw(
            "job.created",
            json!({"job_id": "j-1", "region": "us-west"}),
        ))
        .unwrap();

        assert_eq!(event.event_type(), EventType::JobCreated);
        assert_eq!(event.correlation_id(), Some("corr-1"));
        match event.payload() {
            EventPayload::JobCreated(job) => assert_eq!(job.region.as_deref(), Some("us-west")),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_from_raw_rejects_unknown_type() {
        let err = PlatformEvent::from_raw(raw("gpu.melted", json!({}))).unwrap_err();
        assert!(matches!(err, EventDecodeError::UnknownType(_)));
    }

    #[test]
    fn test_from_raw_rejects_bad_timestamp() {
        let mut bad = raw("gpu.delisted", json!({"gpu_id": "g-1"}));
        bad.timestamp = "yesterday".to_string();
        let err = PlatformEvent::from_raw(bad).unwrap_err();
        assert!(matches!(err, EventDecodeError::InvalidTimestamp { .. }));
    }

    #[test]
    fn test_serde_goes_through_wire_form() {
        let json = json!({
            "type": "gpu.status_changed",
            "timestamp": "2026-03-01T12:00:00+02:00",
            "subject_id": "g-7",
            "payload": {"gpu_id": "g-7", "status": "busy"}
        });
        let event: PlatformEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.timestamp().to_rfc3339(), "2026-03-01T10:00:00+00:00");

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["type"], "gpu.status_changed");
        assert_eq!(back["payload"]["status"], "busy");
    }

    #[test]
    fn test_load_jsonl_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"type":"gpu.delisted","timestamp":"2026-03-01T12:00:00Z","subject_id":"g-1","payload":{{"gpu_id":"g-1"}}}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"type":"not.a.type","timestamp":"2026-03-01T12:00:01Z","subject_id":"x"}}"#
        )
        .unwrap();

        let events = load_jsonl(file.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "not.a.type");
        assert_eq!(events[1].payload, Value::Null);
    }
}
