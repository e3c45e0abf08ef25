//! Message classification for the sensor topic hierarchy.
//!
//! The vase publishes two kinds of messages under one prefix: periodic
//! moisture readings and tap notifications. Anything whose topic mentions
//! `events` is a tap; everything else must be a base-10 integer reading.

use std::num::ParseIntError;

use thiserror::Error;

use crate::domain::MoistureReading;

/// topic substring that marks a tap notification
pub const EVENTS_SEGMENT: &str = "events";

/// A classified inbound sensor message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorMessage {
    Tap(String),
    Moisture(MoistureReading),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("invalid moisture value {payload:?}: {source}")]
    InvalidMoisture {
        payload: String,
        #[source]
        source: ParseIntError,
    },
}

pub fn is_event_topic(topic: &str) -> bool {
    topic.contains(EVENTS_SEGMENT)
}

/// Decode a raw broker payload. Invalid utf-8 is replaced rather than rejected.
pub fn decode_payload(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

pub fn classify(topic: &str, payload: &[u8]) -> Result<SensorMessage, ClassifyError> {
    let text = decode_payload(payload);

    if is_event_topic(topic) {
        return Ok(SensorMessage::Tap(text));
    }

    match text.trim().parse::<i64>() {
        Ok(value) => Ok(SensorMessage::Moisture(MoistureReading::new(value))),
        Err(source) => Err(ClassifyError::InvalidMoisture { payload: text, source }),
    }
}
