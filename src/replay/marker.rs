//! Replay positions: the sentinel/concrete request and the stored marker.

use crate::error::{Result, StreamError};
use crate::types::Message;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::fmt;

/// Wire value requesting only events published after subscribing.
pub const NEW_EVENTS_WIRE: i64 = -1;

/// Wire value requesting every event inside the retention window.
pub const ALL_EVENTS_WIRE: i64 = -2;

/// Where a subscription starts consuming from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ReplayOption {
    /// Only events broadcast after the subscription is made.
    NewEvents,
    /// Every event still retained by the server, then new ones.
    AllEvents,
    /// Events strictly after the given replay id.
    After(i64),
}

impl ReplayOption {
    /// The integer sent in the subscribe extension.
    pub fn wire_value(self) -> i64 {
        match self {
            ReplayOption::NewEvents => NEW_EVENTS_WIRE,
            ReplayOption::AllEvents => ALL_EVENTS_WIRE,
            ReplayOption::After(id) => id,
        }
    }

    pub fn from_wire(value: i64) -> Self {
        match value {
            NEW_EVENTS_WIRE => ReplayOption::NewEvents,
            ALL_EVENTS_WIRE => ReplayOption::AllEvents,
            id => ReplayOption::After(id),
        }
    }

    /// Whether the server will redeliver events already seen on the channel.
    pub fn replays_history(self) -> bool {
        !matches!(self, ReplayOption::NewEvents)
    }

    /// Subscribe-message extension carrying this replay request.
    pub fn extension(self, channel: &str) -> Value {
        json!({ "replay": { channel: self.wire_value() } })
    }
}

impl From<i64> for ReplayOption {
    fn from(value: i64) -> Self {
        ReplayOption::from_wire(value)
    }
}

impl From<ReplayOption> for i64 {
    fn from(option: ReplayOption) -> Self {
        option.wire_value()
    }
}

impl fmt::Debug for ReplayOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayOption::NewEvents => write!(f, "NewEvents"),
            ReplayOption::AllEvents => write!(f, "AllEvents"),
            ReplayOption::After(id) => write!(f, "After({})", id),
        }
    }
}

/// Position of the last processed message on one channel.
///
/// Markers are ordered by `replay_id`; markers of different channels are
/// incomparable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMarker {
    pub channel: String,
    pub replay_id: i64,
    /// Creation time reported by the server (ISO 8601).
    pub created_at: String,
}

impl ReplayMarker {
    pub fn new(channel: impl Into<String>, replay_id: i64, created_at: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            replay_id,
            created_at: created_at.into(),
        }
    }

    /// Read the replay position out of a received message.
    ///
    /// Looks at `ext.replay` first, then at the `data.event` block used by
    /// topic events, taking the creation date from `data.payload` for
    /// platform events.
    pub fn extract(message: &Message) -> Result<Self> {
        if let Some(replay) = message.ext.as_ref().and_then(|ext| ext.get("replay")) {
            if replay.is_object() {
                let replay_id = replay_id_from(replay.get("id"))?;
                let created_at = created_at_from(replay.get("createdDate"))?;
                return Ok(Self::new(&message.channel, replay_id, created_at));
            }
        }

        let event = message.data.get("event");
        let replay_id = replay_id_from(event.and_then(|e| e.get("replayId")))?;
        let created_at = match event.and_then(|e| e.get("createdDate")) {
            Some(date) => created_at_from(Some(date))?,
            None => created_at_from(
                message
                    .data
                    .get("payload")
                    .and_then(|payload| payload.get("CreatedDate")),
            )?,
        };

        Ok(Self::new(&message.channel, replay_id, created_at))
    }

    /// The request that resumes right after this marker.
    pub fn resume_option(&self) -> ReplayOption {
        ReplayOption::After(self.replay_id)
    }

    /// Whether storing `self` would move the channel position forward (or
    /// keep it) relative to `other`.
    pub fn supersedes(&self, other: &ReplayMarker) -> bool {
        matches!(
            self.partial_cmp(other),
            Some(Ordering::Greater | Ordering::Equal)
        )
    }
}

impl PartialOrd for ReplayMarker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.channel != other.channel {
            return None;
        }
        Some(self.replay_id.cmp(&other.replay_id))
    }
}

fn replay_id_from(value: Option<&Value>) -> Result<i64> {
    match value {
        Some(id) => id.as_i64().ok_or_else(|| {
            StreamError::ReplayExtraction(format!("Replay id is not an integer: {}", id))
        }),
        None => Err(StreamError::ReplayExtraction(
            "No replay id found in message".into(),
        )),
    }
}

fn created_at_from(value: Option<&Value>) -> Result<String> {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StreamError::ReplayExtraction("No message creation date found".into()))
}
