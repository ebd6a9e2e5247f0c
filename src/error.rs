//! Error taxonomy shared by publishers and consumers.

use std::fmt;

use serde_json::{json, Value};

/// Result type for event operations.
pub type Result<T> = std::result::Result<T, EventsError>;

/// Why an option was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// The option is missing or empty.
    Required,
    /// The option is present but cannot be used.
    Malformed,
}

impl OptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKind::Required => "required",
            OptionKind::Malformed => "malformed",
        }
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while publishing or consuming events.
#[derive(Debug, thiserror::Error)]
pub enum EventsError {
    /// A constructor or call argument is missing or malformed.
    ///
    /// Always raised before any network interaction.
    #[error("Invalid option '{option}': {kind}")]
    InvalidOption {
        option: &'static str,
        kind: OptionKind,
    },

    /// An inbound body could not be decoded despite a JSON content type.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// An inbound message declared a content type other than JSON.
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// The operation needs a live channel.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The broker collaborator refused or failed an operation.
    #[error("Broker error: {0}")]
    Broker(String),

    /// A local listener panicked while handling an event.
    ///
    /// The message that triggered it has already been acknowledged.
    #[error("Listener for '{event}' panicked: {message}")]
    ListenerPanicked { event: String, message: String },
}

impl EventsError {
    pub fn required(option: &'static str) -> Self {
        EventsError::InvalidOption {
            option,
            kind: OptionKind::Required,
        }
    }

    pub fn malformed(option: &'static str) -> Self {
        EventsError::InvalidOption {
            option,
            kind: OptionKind::Malformed,
        }
    }

    /// Taxonomy name of the error kind.
    pub fn name(&self) -> &'static str {
        match self {
            EventsError::InvalidOption { .. } => "InvalidOption",
            EventsError::MalformedMessage(_) => "MalformedMessage",
            EventsError::UnsupportedContentType(_) => "UnsupportedContentType",
            EventsError::NotConnected(_) => "NotConnected",
            EventsError::Broker(_) => "Broker",
            EventsError::ListenerPanicked { .. } => "ListenerPanicked",
        }
    }

    /// Serializable description, suitable for returning to remote callers.
    pub fn to_json(&self) -> Value {
        match self {
            EventsError::InvalidOption { option, kind } => json!({
                "name": self.name(),
                "option": option,
                "kind": kind.as_str(),
                "message": self.to_string(),
            }),
            _ => json!({
                "name": self.name(),
                "message": self.to_string(),
            }),
        }
    }

    /// True for per-message failures that must not stop a dispatch loop.
    pub fn is_message_error(&self) -> bool {
        matches!(
            self,
            EventsError::MalformedMessage(_)
                | EventsError::UnsupportedContentType(_)
                | EventsError::ListenerPanicked { .. }
        )
    }
}
