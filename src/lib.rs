//! # Replay Stream
//!
//! A durable event-stream subscriber that resumes every channel where it
//! left off.
//!
//! ## Core Concepts
//!
//! - **Replay markers**: The last processed position of each channel, kept in
//!   a pluggable store
//! - **Replay resolution**: Every (re)subscribe asks the store where to resume
//! - **Fallback**: One retry with a configured option when the server no
//!   longer retains the requested position
//! - **Delivery**: A bounded buffer filled in the background and drained by
//!   `receive`, with markers committed immediately or by the consumer
//!
//! ## Example
//!
//! ```ignore
//! use replay_stream::{Client, ClientConfig, JournalMapping, ReplaySource, StaticCredentials};
//!
//! let client = Client::new(credentials, transport, ClientConfig {
//!     replay: ReplaySource::mapping(JournalMapping::open("./markers.journal")?),
//!     replay_fallback: Some(ReplayOption::AllEvents),
//!     ..Default::default()
//! });
//!
//! client.open()?;
//! client.subscribe("/topic/orders")?;
//!
//! for message in client.messages() {
//!     let message = message?;
//!     println!("{}: {}", message.channel, message.data);
//! }
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod delivery;
pub mod error;
pub mod replay;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use auth::{
    cometd_url, CredentialProvider, Credentials, LoginDomain, OAuthCredentials,
    StaticCredentials, TokenExchange, TokenGrant, TokenResponse, API_VERSION,
};
pub use client::{Client, ClientConfig, Messages, ReplaySource};
pub use codec::{JsonCodec, SerdeJsonCodec};
pub use delivery::{DeliveryPipeline, Pending, PipelineParts, PipelineSettings};
pub use error::{ErrorKind, Result, ServerError, StreamError};
pub use replay::{
    CommitGuard, CommitOutcome, ConstantReplay, DefaultOnMiss, JournalMapping, LruMapping,
    MappingStore, MarkerCommitter, MarkerMapping, MarkerStore, MemoryMapping, ReplayMarker,
    ReplayOption, ReplayPolicy,
};
pub use subscriptions::{
    ChannelState, ChannelSummary, Freshness, Resubscription, SubscriptionManager,
};
pub use transport::{ConnectRequest, MemoryTransport, Transport, TransportEvent};
pub use types::*;
