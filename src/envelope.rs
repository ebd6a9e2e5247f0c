//! Message envelope: the unit handed to and received from the broker.

use serde::Serialize;
use serde_json::Value;

use crate::error::{EventsError, Result};

/// The only content type this library produces or accepts.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Event name; used as the routing key.
    pub routing_key: String,
    /// Declared content type, if any.
    pub content_type: Option<String>,
    /// Publish time in milliseconds since the Unix epoch.
    pub timestamp: Option<u64>,
    /// Serialized body.
    pub body: Vec<u8>,
}

impl Envelope {
    /// Serialize `content` as a JSON envelope stamped with the current time.
    ///
    /// Fails with `InvalidOption` when the routing key is empty, when the
    /// content serializes to `null`, or when it cannot be serialized.
    pub fn json<T>(routing_key: &str, content: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        if routing_key.is_empty() {
            return Err(EventsError::required("routingKey"));
        }

        let value = serde_json::to_value(content).map_err(|_| EventsError::malformed("content"))?;
        if value.is_null() {
            return Err(EventsError::required("content"));
        }

        let body = serde_json::to_vec(&value).map_err(|_| EventsError::malformed("content"))?;

        Ok(Self {
            routing_key: routing_key.to_string(),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            timestamp: Some(now_millis()),
            body,
        })
    }

    /// Check the declared content type and decode the body.
    pub fn decode_json(&self) -> Result<Value> {
        match self.content_type.as_deref() {
            Some(JSON_CONTENT_TYPE) => {}
            Some(other) => return Err(EventsError::UnsupportedContentType(other.to_string())),
            None => return Err(EventsError::UnsupportedContentType("<none>".to_string())),
        }

        serde_json::from_slice(&self.body).map_err(|e| EventsError::MalformedMessage(e.to_string()))
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
