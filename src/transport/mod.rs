//! The publish/subscribe transport the client runs on.
//!
//! The transport owns the wire protocol and its own reconnection loop. It
//! reports what happens on the connection through a single event channel so
//! that messages and connection-state changes keep their relative order.

mod memory;

pub use memory::{MemoryTransport, DEFAULT_CREATED_DATE};

use crate::error::Result;
use crate::replay::ReplayOption;
use crate::types::ConnectionState;
use crossbeam_channel::Receiver;

/// What the transport reports while connected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// An encoded inbound message.
    Message(Vec<u8>),
    /// The connection changed state.
    State(ConnectionState),
    /// The server ended the session; no further events follow.
    Closed,
}

/// Parameters for establishing a connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Streaming endpoint.
    pub url: String,
    /// Value of the `Authorization` header.
    pub authorization: String,
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("url", &self.url)
            .field("authorization", &"***")
            .finish()
    }
}

/// Publish/subscribe transport.
///
/// Calls block until the server acknowledges them. `close` must fail any
/// call still waiting for an acknowledgement.
pub trait Transport: Send + Sync {
    /// Connect and return the event channel for this connection.
    fn connect(&self, request: &ConnectRequest) -> Result<Receiver<TransportEvent>>;

    /// Subscribe with the given replay request in the subscribe extension.
    ///
    /// A rejection is reported as [`StreamError::Server`](crate::StreamError::Server).
    fn subscribe(&self, channel: &str, replay: ReplayOption) -> Result<()>;

    fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Publish an encoded payload, returning the encoded response.
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<Vec<u8>>;

    fn close(&self) -> Result<()>;
}
