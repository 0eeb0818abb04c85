//! Event envelope carried on the controller's event bus
//!
//! Every state change is published as one [`Event`]: a typed payload tagged
//! with its [`EventCategory`], a bus-assigned sequence number and the publish
//! timestamp. Consumers dispatch on the category; there are no per-category
//! callback registries.

use crate::types::{GpuSnapshot, LaunchSession, LogLine, MetricsSnapshot, StatusSnapshot};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of events published on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Status,
    Gpu,
    Metrics,
    LaunchProgress,
    Log,
}

impl EventCategory {
    /// Every category, in replay order
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Status,
        EventCategory::Gpu,
        EventCategory::Metrics,
        EventCategory::LaunchProgress,
        EventCategory::Log,
    ];

    /// Wire name, also used as the SSE `event:` field
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Status => "status",
            EventCategory::Gpu => "gpu",
            EventCategory::Metrics => "metrics",
            EventCategory::LaunchProgress => "launch_progress",
            EventCategory::Log => "log",
        }
    }
}

impl std::str::FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "status" => Ok(EventCategory::Status),
            "gpu" => Ok(EventCategory::Gpu),
            "metrics" => Ok(EventCategory::Metrics),
            "launch_progress" => Ok(EventCategory::LaunchProgress),
            "log" => Ok(EventCategory::Log),
            _ => Err(format!("Unknown event category: {}", s)),
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Status(StatusSnapshot),
    Gpu(Vec<GpuSnapshot>),
    Metrics(MetricsSnapshot),
    LaunchProgress(LaunchSession),
    Log(LogLine),
}

impl EventPayload {
    pub fn category(&self) -> EventCategory {
        match self {
            EventPayload::Status(_) => EventCategory::Status,
            EventPayload::Gpu(_) => EventCategory::Gpu,
            EventPayload::Metrics(_) => EventCategory::Metrics,
            EventPayload::LaunchProgress(_) => EventCategory::LaunchProgress,
            EventPayload::Log(_) => EventCategory::Log,
        }
    }

    /// Serialize the inner value without the category tag
    pub fn data(&self) -> Result<serde_json::Value> {
        let value = match self {
            EventPayload::Status(v) => serde_json::to_value(v)?,
            EventPayload::Gpu(v) => serde_json::to_value(v)?,
            EventPayload::Metrics(v) => serde_json::to_value(v)?,
            EventPayload::LaunchProgress(v) => serde_json::to_value(v)?,
            EventPayload::Log(v) => serde_json::to_value(v)?,
        };
        Ok(value)
    }

    /// Rebuild a payload from its category name and untagged data
    pub fn decode(category: EventCategory, data: serde_json::Value) -> Result<Self> {
        let payload = match category {
            EventCategory::Status => EventPayload::Status(serde_json::from_value(data)?),
            EventCategory::Gpu => EventPayload::Gpu(serde_json::from_value(data)?),
            EventCategory::Metrics => EventPayload::Metrics(serde_json::from_value(data)?),
            EventCategory::LaunchProgress => {
                EventPayload::LaunchProgress(serde_json::from_value(data)?)
            }
            EventCategory::Log => EventPayload::Log(serde_json::from_value(data)?),
        };
        Ok(payload)
    }
}

/// The unit published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Bus-wide publish sequence number, strictly increasing
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Body of an SSE `data:` line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(seq: u64, payload: EventPayload) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn category(&self) -> EventCategory {
        self.payload.category()
    }

    /// The `{data, timestamp}` body sent to SSE clients
    pub fn to_wire(&self) -> Result<WireEvent> {
        Ok(WireEvent {
            data: self.payload.data()?,
            timestamp: self.timestamp,
        })
    }

    /// Parse one SSE frame back into an event
    pub fn from_wire(name: &str, id: Option<&str>, data: &str) -> Result<Self> {
        let category: EventCategory = name.parse().map_err(Error::invalid_request)?;
        let wire: WireEvent = serde_json::from_str(data)?;
        let seq = match id {
            Some(id) => id
                .trim()
                .parse()
                .map_err(|_| Error::invalid_request(format!("Invalid event id: {}", id)))?,
            None => 0,
        };
        Ok(Self {
            seq,
            timestamp: wire.timestamp,
            payload: EventPayload::decode(category, wire.data)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LaunchStage, LogStream, RecipeId};

    #[test]
    fn test_category_names() {
        for category in EventCategory::ALL {
            assert_eq!(category.as_str().parse::<EventCategory>().unwrap(), category);
        }
        assert_eq!(
            serde_json::to_string(&EventCategory::LaunchProgress).unwrap(),
            "\"launch_progress\""
        );
        assert!("bogus".parse::<EventCategory>().is_err());
    }

    #[test]
    fn test_wire_format() {
        let event = Event::new(
            7,
            EventPayload::Log(LogLine {
                pid: 10,
                stream: LogStream::Stderr,
                line: "loading weights".to_string(),
            }),
        );

        let wire = serde_json::to_value(event.to_wire().unwrap()).unwrap();
        assert_eq!(wire["data"]["line"], "loading weights");
        assert_eq!(wire["data"]["stream"], "stderr");
        assert!(wire["timestamp"].is_string());
        // The category travels as the SSE event name, not inside the body
        assert!(wire["data"].get("category").is_none());
    }

    #[test]
    fn test_from_wire() {
        let mut session = LaunchSession::new(RecipeId::new("qwen"));
        session.advance(LaunchStage::Launching, "Spawning vllm");
        let event = Event::new(3, EventPayload::LaunchProgress(session.clone()));
        let body = serde_json::to_string(&event.to_wire().unwrap()).unwrap();

        let parsed = Event::from_wire("launch_progress", Some("3"), &body).unwrap();
        assert_eq!(parsed.seq, 3);
        assert_eq!(parsed.payload, EventPayload::LaunchProgress(session));

        assert!(Event::from_wire("nope", None, &body).is_err());
        assert!(Event::from_wire("status", None, "not json").is_err());
    }

    #[test]
    fn test_tagged_serialization() {
        let event = Event::new(1, EventPayload::Gpu(vec![]));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["category"], "gpu");
        assert_eq!(json["seq"], 1);
        assert!(json["data"].as_array().unwrap().is_empty());
    }
}
