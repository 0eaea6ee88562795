use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Kinds of user activity the generator emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    View,
    Click,
    Purchase,
    AddToCart,
    Login,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::View,
        EventType::Click,
        EventType::Purchase,
        EventType::AddToCart,
        EventType::Login,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::View => "view",
            EventType::Click => "click",
            EventType::Purchase => "purchase",
            EventType::AddToCart => "add_to_cart",
            EventType::Login => "login",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single user-activity record, as transmitted on the topic.
///
/// `timestamp` is the producer's view of when the activity happened, in
/// milliseconds since the Unix epoch.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Event {
    #[serde(deserialize_with = "non_empty_string")]
    pub user_id: String,
    pub event_type: EventType,
    pub timestamp: i64,
    pub url: String,
}

#[derive(Error, Debug)]
pub enum EventDecodeError {
    #[error("received empty payload")]
    Empty,
    #[error("failed to parse event: {0}")]
    Parse(#[from] serde_json::Error),
}

impl Event {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, EventDecodeError> {
        if payload.is_empty() {
            return Err(EventDecodeError::Empty);
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

fn non_empty_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    if value.is_empty() {
        return Err(serde::de::Error::invalid_length(0, &"a non-empty string"));
    }
    Ok(value)
}

/// An `Event` as persisted by the consumer, with the time it was processed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub event: Event,
    pub processing_time: i64,
    /// Negative when the producer clock runs ahead of the consumer clock.
    pub latency_ms: i64,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("latency between timestamp {timestamp} and processing time {processing_time} overflows")]
pub struct LatencyOverflow {
    pub timestamp: i64,
    pub processing_time: i64,
}

impl EnrichedRecord {
    /// Fails when the timestamp is so far from `processing_time` that the latency
    /// does not fit in an i64.
    pub fn new(event: Event, processing_time: i64) -> Result<Self, LatencyOverflow> {
        let latency_ms = processing_time
            .checked_sub(event.timestamp)
            .ok_or(LatencyOverflow {
                timestamp: event.timestamp,
                processing_time,
            })?;

        Ok(Self {
            event,
            processing_time,
            latency_ms,
        })
    }
}
