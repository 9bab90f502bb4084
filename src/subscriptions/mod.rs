//! Channel subscriptions and their replay-aware recovery.
//!
//! The manager keeps the per-channel state machine:
//! - Idempotent subscribe, tolerant unsubscribe
//! - Replay resolution on every subscribe attempt
//! - One retry with the configured fallback after a replay rejection
//! - Resubscription of every desired channel after a reconnect
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new(transport, policy);
//! manager.subscribe("/topic/orders")?;
//!
//! // The transport lost and regained its connection
//! manager.connection_lost();
//! let outcome = manager.resubscribe_all();
//! for (channel, error) in &outcome.failures {
//!     eprintln!("{} could not be resubscribed: {}", channel, error);
//! }
//! if !outcome.interrupted.is_empty() {
//!     manager.retry_interrupted();
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{ChannelState, ChannelSummary, Freshness, Resubscription};
