//! Subscription state types.

use crate::error::StreamError;
use crate::replay::ReplayOption;
use serde::{Deserialize, Serialize};

/// Lifecycle of one channel's subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Unsubscribed,
    /// A subscribe request is in flight, or the connection is down and the
    /// channel waits to be resubscribed.
    Subscribing,
    Subscribed,
    Unsubscribing,
}

impl ChannelState {
    /// Whether a subscribe call should be a no-op.
    pub fn is_active(self) -> bool {
        matches!(self, ChannelState::Subscribing | ChannelState::Subscribed)
    }
}

/// How a buffered message relates to its channel's current subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// Delivered under the channel's current subscription.
    Current,
    /// Predates a resubscription that asked for history; the server sends
    /// it again, so this copy is dropped.
    Replayed,
    /// Predates a resubscription for new events only. Delivered, but its
    /// marker is not committed.
    Unreplayable,
    /// Predates a resubscription that never completed because the manager
    /// shut down. Never delivered.
    Closed,
}

/// Outcome of resubscribing the desired set.
#[derive(Debug, Default)]
pub struct Resubscription {
    /// Channels the server refused; they left the desired set.
    pub failures: Vec<(String, StreamError)>,
    /// Channels whose request failed in transit; they stay desired and
    /// subscribing until retried.
    pub interrupted: Vec<String>,
}

impl Resubscription {
    /// Whether every desired channel is subscribed again.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.interrupted.is_empty()
    }
}

/// Snapshot of one channel's entry in the subscription table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSummary {
    pub channel: String,
    pub state: ChannelState,
    /// Replay request of the last successful subscribe.
    pub requested: Option<ReplayOption>,
    /// Connection epoch the subscription was established in.
    pub epoch: u64,
}
