//! In-process transport with a scriptable server side.

use super::{ConnectRequest, Transport, TransportEvent};
use crate::error::{Result, ServerError, StreamError};
use crate::replay::ReplayOption;
use crate::types::ConnectionState;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Creation date stamped on events delivered through [`MemoryTransport::deliver`].
pub const DEFAULT_CREATED_DATE: &str = "2024-01-01T00:00:00.000Z";

#[derive(Default)]
struct MemoryState {
    events: Option<Sender<TransportEvent>>,
    connected: bool,
    closed: bool,
    connects: Vec<ConnectRequest>,
    subscribes: Vec<(String, ReplayOption)>,
    unsubscribes: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    /// Oldest replay id still retained, per channel.
    retention_floor: HashMap<String, i64>,
    rejections: HashMap<String, ServerError>,
    connect_failure: Option<String>,
    /// Subscribe requests to let through, then the reason the next one fails.
    subscribe_interruption: Option<(usize, String)>,
}

/// Transport that keeps everything in memory.
///
/// Cloning yields another handle to the same transport, which lets a test
/// play the server while the client owns the transport.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Server side ---

    /// Deliver a topic event carrying `replay_id` on `channel`.
    pub fn deliver(&self, channel: &str, replay_id: i64, payload: Value) -> bool {
        self.deliver_message(&json!({
            "channel": channel,
            "data": {
                "event": {
                    "replayId": replay_id,
                    "createdDate": DEFAULT_CREATED_DATE,
                },
                "payload": payload,
            },
        }))
    }

    /// Deliver an arbitrary JSON message.
    pub fn deliver_message(&self, message: &Value) -> bool {
        match serde_json::to_vec(message) {
            Ok(frame) => self.deliver_frame(frame),
            Err(_) => false,
        }
    }

    /// Deliver a raw frame. Returns false when no connection is open.
    pub fn deliver_frame(&self, frame: Vec<u8>) -> bool {
        self.emit(TransportEvent::Message(frame))
    }

    /// Report a connection-state change to the client.
    pub fn set_state(&self, state: ConnectionState) -> bool {
        self.state.lock().connected = state.is_connected();
        self.emit(TransportEvent::State(state))
    }

    pub fn drop_connection(&self) -> bool {
        self.set_state(ConnectionState::Disconnected)
    }

    pub fn restore_connection(&self) -> bool {
        self.set_state(ConnectionState::Connected)
    }

    /// End the session from the server side.
    pub fn end_session(&self) -> bool {
        let sent = self.emit(TransportEvent::Closed);
        let mut state = self.state.lock();
        state.connected = false;
        state.events = None;
        sent
    }

    /// Reject subscribes that resume before `floor` on `channel`.
    pub fn set_retention_floor(&self, channel: &str, floor: i64) {
        self.state
            .lock()
            .retention_floor
            .insert(channel.to_string(), floor);
    }

    /// Reject every subscribe to `channel` with `error`.
    pub fn reject_channel(&self, channel: &str, error: ServerError) {
        self.state
            .lock()
            .rejections
            .insert(channel.to_string(), error);
    }

    pub fn clear_rejection(&self, channel: &str) {
        self.state.lock().rejections.remove(channel);
    }

    pub fn fail_next_connect(&self, reason: &str) {
        self.state.lock().connect_failure = Some(reason.to_string());
    }

    /// Let `skip` subscribe requests through, then fail the next one in
    /// transit while the connection stays up.
    pub fn interrupt_subscribe(&self, skip: usize, reason: &str) {
        self.state.lock().subscribe_interruption = Some((skip, reason.to_string()));
    }

    // --- Inspection ---

    /// Subscribe requests in call order, rejected ones included.
    pub fn subscribe_calls(&self) -> Vec<(String, ReplayOption)> {
        self.state.lock().subscribes.clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.state.lock().unsubscribes.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().published.clone()
    }

    pub fn connects(&self) -> Vec<ConnectRequest> {
        self.state.lock().connects.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn emit(&self, event: TransportEvent) -> bool {
        let state = self.state.lock();
        match &state.events {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    fn check_connected(state: &MemoryState) -> Result<()> {
        if state.closed {
            return Err(StreamError::ConnectionClosed);
        }
        if !state.connected {
            return Err(StreamError::Transport("Not connected".into()));
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, request: &ConnectRequest) -> Result<Receiver<TransportEvent>> {
        let mut state = self.state.lock();
        state.connects.push(request.clone());

        if let Some(reason) = state.connect_failure.take() {
            return Err(StreamError::Transport(reason));
        }

        let (sender, receiver) = unbounded();
        state.events = Some(sender);
        state.connected = true;
        state.closed = false;

        debug!(url = %request.url, "Memory transport connected");
        Ok(receiver)
    }

    fn subscribe(&self, channel: &str, replay: ReplayOption) -> Result<()> {
        let mut state = self.state.lock();
        state.subscribes.push((channel.to_string(), replay));
        Self::check_connected(&state)?;

        if let Some((skip, reason)) = state.subscribe_interruption.take() {
            if skip == 0 {
                return Err(StreamError::Transport(reason));
            }
            state.subscribe_interruption = Some((skip - 1, reason));
        }

        if let Some(error) = state.rejections.get(channel) {
            return Err(StreamError::Server(error.clone()));
        }

        if let (ReplayOption::After(id), Some(floor)) =
            (replay, state.retention_floor.get(channel))
        {
            if id < *floor {
                return Err(StreamError::Server(ServerError::new(
                    400,
                    format!(
                        "The replayId {{{}}} you provided was invalid. Please provide a valid ID, \
                         -2 to replay all events, or -1 to replay only new events.",
                        id
                    ),
                )));
            }
        }

        Ok(())
    }

    fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.unsubscribes.push(channel.to_string());
        Self::check_connected(&state)
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        state.published.push((channel.to_string(), payload.to_vec()));

        serde_json::to_vec(&json!({"channel": channel, "successful": true}))
            .map_err(|e| StreamError::Serialization(e.to_string()))
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.connected = false;
        state.events = None;
        Ok(())
    }
}
