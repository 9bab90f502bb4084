//! Core types shared across the client.

use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Prefix of Bayeux protocol channels, which never carry events.
const META_CHANNEL_PREFIX: &str = "/meta/";

/// Connection state reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// When the replay marker of a delivered message is persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePolicy {
    /// Commit the marker as the message is handed to the consumer.
    ///
    /// A failure while processing the message still counts it as consumed.
    #[default]
    Immediate,
    /// Commit only when the consumer says the message was processed.
    Manual,
}

/// A message received on a subscribed channel.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Channel the message was published on.
    pub channel: String,

    /// Event payload.
    #[serde(default)]
    pub data: Value,

    /// Protocol extension fields (replay position lives here).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
}

impl Message {
    pub fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data,
            ext: None,
        }
    }

    /// Build a message from a decoded frame.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.get("channel").is_some_and(Value::is_string) {
            return Err(StreamError::Deserialization(
                "Message has no channel".into(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Whether this is a protocol message rather than an event.
    pub fn is_meta(&self) -> bool {
        self.channel.starts_with(META_CHANNEL_PREFIX)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("channel", &self.channel)
            .field("ext", &self.ext)
            .finish_non_exhaustive()
    }
}
