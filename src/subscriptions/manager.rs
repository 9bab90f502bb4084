//! Per-channel subscription state machine.

use crate::error::{ErrorKind, Result, StreamError};
use crate::replay::{ReplayOption, ReplayPolicy};
use crate::transport::Transport;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::types::{ChannelState, ChannelSummary, Freshness, Resubscription};

/// Internal per-channel entry.
struct ChannelEntry {
    state: ChannelState,
    /// Position in the desired set; reassigned each time the channel joins it.
    order: u64,
    /// Connection epoch of the last successful subscribe.
    epoch: u64,
    requested: Option<ReplayOption>,
    /// Member of the desired set, resubscribed after every reconnect.
    desired: bool,
}

impl ChannelEntry {
    fn new() -> Self {
        Self {
            state: ChannelState::Unsubscribed,
            order: 0,
            epoch: 0,
            requested: None,
            desired: false,
        }
    }
}

struct Table {
    channels: HashMap<String, ChannelEntry>,
    next_order: u64,
    /// Bumped on every reconnect.
    epoch: u64,
    connected: bool,
    shutdown: bool,
}

/// Drives subscribe, unsubscribe and resubscription for every channel.
///
/// The table lock is never held across a transport call. Waiters on
/// [`freshness`](Self::freshness) are woken whenever a channel settles.
pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    policy: ReplayPolicy,
    table: Mutex<Table>,
    settled: Condvar,
}

impl SubscriptionManager {
    /// Create a manager for a connected transport.
    pub fn new(transport: Arc<dyn Transport>, policy: ReplayPolicy) -> Self {
        Self {
            transport,
            policy,
            table: Mutex::new(Table {
                channels: HashMap::new(),
                next_order: 0,
                epoch: 0,
                connected: true,
                shutdown: false,
            }),
            settled: Condvar::new(),
        }
    }

    pub fn policy(&self) -> &ReplayPolicy {
        &self.policy
    }

    /// Subscribe to `channel`.
    ///
    /// A no-op when the channel is already subscribed or subscribing. On
    /// failure the channel is left unsubscribed and outside the desired set.
    pub fn subscribe(&self, channel: &str) -> Result<()> {
        {
            let mut table = self.table.lock();
            if table.shutdown {
                return Err(StreamError::ClientClosed);
            }
            let entry = table
                .channels
                .entry(channel.to_string())
                .or_insert_with(ChannelEntry::new);
            if entry.state.is_active() {
                debug!(channel = %channel, state = ?entry.state, "Already subscribed");
                return Ok(());
            }
            entry.state = ChannelState::Subscribing;
        }

        let result = self.establish(channel);
        self.settle(channel, &result, false);
        result.map(|_| ())
    }

    /// Unsubscribe from `channel`.
    ///
    /// The channel leaves the desired set whatever its state. Unknown
    /// channels are not an error.
    pub fn unsubscribe(&self, channel: &str) -> Result<()> {
        let notify_server = {
            let mut table = self.table.lock();
            if table.shutdown {
                return Err(StreamError::ClientClosed);
            }
            let connected = table.connected;
            let Some(entry) = table.channels.get_mut(channel) else {
                return Ok(());
            };
            entry.desired = false;
            if !entry.state.is_active() {
                return Ok(());
            }
            entry.state = ChannelState::Unsubscribing;
            // The server forgot the subscription with the lost session
            connected
        };

        let result = if notify_server {
            self.transport.unsubscribe(channel)
        } else {
            Ok(())
        };

        {
            let mut table = self.table.lock();
            if let Some(entry) = table.channels.get_mut(channel) {
                if entry.state == ChannelState::Unsubscribing {
                    entry.state = ChannelState::Unsubscribed;
                }
            }
        }
        self.settled.notify_all();

        info!(channel = %channel, "Unsubscribed");
        result
    }

    /// The transport lost its connection.
    ///
    /// Every desired channel goes back to subscribing until the next
    /// [`resubscribe_all`](Self::resubscribe_all).
    pub fn connection_lost(&self) {
        let mut table = self.table.lock();
        table.connected = false;
        for entry in table.channels.values_mut() {
            if entry.desired && entry.state == ChannelState::Subscribed {
                entry.state = ChannelState::Subscribing;
            }
        }
        debug!(epoch = table.epoch, "Connection lost, subscriptions suspended");
    }

    /// The transport reconnected: start a new epoch and resubscribe every
    /// desired channel in the order it joined the desired set.
    ///
    /// Replay positions are resolved again for each channel. Channels whose
    /// request failed in transit stay desired and are reported as
    /// interrupted; see [`retry_interrupted`](Self::retry_interrupted).
    pub fn resubscribe_all(&self) -> Resubscription {
        let channels = {
            let mut table = self.table.lock();
            if table.shutdown {
                return Resubscription::default();
            }
            table.connected = true;
            table.epoch += 1;

            for entry in table.channels.values_mut() {
                if entry.desired {
                    entry.state = ChannelState::Subscribing;
                }
            }
            let channels = Self::waiting(&table);
            info!(epoch = table.epoch, channels = channels.len(), "Resubscribing");
            channels
        };

        self.resubscribe(channels)
    }

    /// Resubscribe the desired channels still waiting after an interrupted
    /// [`resubscribe_all`](Self::resubscribe_all), within the same epoch.
    pub fn retry_interrupted(&self) -> Resubscription {
        let channels = {
            let table = self.table.lock();
            if table.shutdown || !table.connected {
                return Resubscription::default();
            }
            Self::waiting(&table)
        };
        if !channels.is_empty() {
            debug!(channels = channels.len(), "Retrying interrupted resubscriptions");
        }

        self.resubscribe(channels)
    }

    /// Classify a message taken in at connection epoch `epoch`.
    ///
    /// Blocks while the channel's resubscription for a newer epoch is in
    /// flight. Returns `None` if `deadline` passes first.
    pub fn freshness(
        &self,
        channel: &str,
        epoch: u64,
        deadline: Option<Instant>,
    ) -> Option<Freshness> {
        let mut table = self.table.lock();
        loop {
            if table.shutdown {
                return Some(if epoch < table.epoch {
                    Freshness::Closed
                } else {
                    Freshness::Current
                });
            }
            let Some((state, subscribed_at, requested)) = table
                .channels
                .get(channel)
                .map(|entry| (entry.state, entry.epoch, entry.requested))
            else {
                return Some(Freshness::Current);
            };
            match state {
                ChannelState::Subscribing if epoch < table.epoch => match deadline {
                    Some(deadline) => {
                        if self.settled.wait_until(&mut table, deadline).timed_out() {
                            return None;
                        }
                    }
                    None => self.settled.wait(&mut table),
                },
                ChannelState::Subscribed if epoch < subscribed_at => {
                    return Some(match requested {
                        Some(ReplayOption::NewEvents) => Freshness::Unreplayable,
                        _ => Freshness::Replayed,
                    });
                }
                // The resubscription failed; the stored marker still
                // precedes this message, so the server sends it again.
                ChannelState::Unsubscribed | ChannelState::Unsubscribing
                    if epoch < table.epoch =>
                {
                    return Some(Freshness::Replayed);
                }
                _ => return Some(Freshness::Current),
            }
        }
    }

    /// Current connection epoch.
    pub fn epoch(&self) -> u64 {
        self.table.lock().epoch
    }

    pub fn is_connected(&self) -> bool {
        self.table.lock().connected
    }

    /// Desired channels in the order they were subscribed.
    pub fn subscriptions(&self) -> Vec<String> {
        let table = self.table.lock();
        let mut desired: Vec<_> = table
            .channels
            .iter()
            .filter(|(_, entry)| entry.desired)
            .map(|(channel, entry)| (entry.order, channel.clone()))
            .collect();
        desired.sort();
        desired.into_iter().map(|(_, channel)| channel).collect()
    }

    pub fn state(&self, channel: &str) -> ChannelState {
        self.table
            .lock()
            .channels
            .get(channel)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    pub fn summary(&self, channel: &str) -> Option<ChannelSummary> {
        self.table
            .lock()
            .channels
            .get(channel)
            .map(|entry| ChannelSummary {
                channel: channel.to_string(),
                state: entry.state,
                requested: entry.requested,
                epoch: entry.epoch,
            })
    }

    /// Forget every channel and release all waiters.
    pub fn shutdown(&self) {
        {
            let mut table = self.table.lock();
            table.shutdown = true;
            table.connected = false;
            table.channels.clear();
        }
        self.settled.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.table.lock().shutdown
    }

    /// Desired channels waiting to be resubscribed, in subscription order.
    fn waiting(table: &Table) -> Vec<String> {
        let mut waiting: Vec<(u64, String)> = table
            .channels
            .iter()
            .filter(|(_, entry)| entry.desired && entry.state == ChannelState::Subscribing)
            .map(|(channel, entry)| (entry.order, channel.clone()))
            .collect();
        waiting.sort();
        waiting.into_iter().map(|(_, channel)| channel).collect()
    }

    fn resubscribe(&self, channels: Vec<String>) -> Resubscription {
        let mut outcome = Resubscription::default();
        for channel in channels {
            let result = self.establish(&channel);
            self.settle(&channel, &result, true);
            if let Err(e) = result {
                if e.kind() == ErrorKind::Transport {
                    warn!(channel = %channel, error = %e, "Resubscribe interrupted");
                    outcome.interrupted.push(channel);
                } else {
                    warn!(channel = %channel, error = %e, "Resubscribe failed");
                    outcome.failures.push((channel, e));
                }
            }
        }
        outcome
    }

    /// Subscribe at the resolved position, falling back once on a replay
    /// rejection. Returns the replay request that succeeded.
    ///
    /// Server refusals of the fallback are replay errors. Transport-kind
    /// failures of either attempt pass through unchanged, so a
    /// resubscription cut short by the connection stays retryable.
    fn establish(&self, channel: &str) -> Result<ReplayOption> {
        let replay = self.policy.resolve_replay_value(channel)?;
        debug!(channel = %channel, replay = ?replay, "Subscribing");

        let rejection = match self.transport.subscribe(channel, replay) {
            Ok(()) => return Ok(replay),
            Err(StreamError::Server(error)) if error.is_replay_rejection() => error,
            Err(e) => return Err(e),
        };

        let Some(fallback) = self.policy.resolve_fallback(channel) else {
            return Err(StreamError::Replay {
                channel: channel.to_string(),
                source: rejection,
            });
        };

        warn!(
            channel = %channel,
            replay = ?replay,
            fallback = ?fallback,
            error = %rejection,
            "Replay position rejected, retrying with fallback"
        );

        match self.transport.subscribe(channel, fallback) {
            Ok(()) => Ok(fallback),
            Err(StreamError::Server(source)) => Err(StreamError::Replay {
                channel: channel.to_string(),
                source,
            }),
            Err(e) => Err(e),
        }
    }

    /// Record the outcome of a subscribe attempt and wake waiters.
    fn settle(&self, channel: &str, result: &Result<ReplayOption>, resubscribing: bool) {
        {
            let mut table = self.table.lock();
            let epoch = table.epoch;
            let order = table.next_order;
            let Some(entry) = table.channels.get_mut(channel) else {
                return;
            };
            // Unsubscribed while the request was in flight
            if entry.state != ChannelState::Subscribing {
                return;
            }

            let mut joined = false;
            match result {
                Ok(replay) => {
                    entry.state = ChannelState::Subscribed;
                    entry.requested = Some(*replay);
                    entry.epoch = epoch;
                    if !entry.desired {
                        entry.desired = true;
                        entry.order = order;
                        joined = true;
                    }
                    info!(channel = %channel, replay = ?replay, epoch, "Subscribed");
                }
                Err(e) if resubscribing && e.kind() == ErrorKind::Transport => {
                    // Retried after the next reconnect
                }
                Err(_) => {
                    entry.state = ChannelState::Unsubscribed;
                    entry.desired = false;
                }
            }
            if joined {
                table.next_order += 1;
            }
        }
        self.settled.notify_all();
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("SubscriptionManager")
            .field("channels", &table.channels.len())
            .field("epoch", &table.epoch)
            .field("connected", &table.connected)
            .finish_non_exhaustive()
    }
}
