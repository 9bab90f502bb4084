//! Commit points for replay markers.

use super::marker::ReplayMarker;
use super::store::MarkerStore;
use crate::error::Result;
use crate::types::{Message, StoragePolicy};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a commit did to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The marker is now the channel's position.
    Stored,
    /// The store already holds a later position; nothing was written.
    Skipped { stored: i64 },
}

/// Writes markers to the store according to the storage policy.
///
/// Commits are serialized per channel; different channels never wait on
/// each other.
pub struct MarkerCommitter {
    store: Arc<dyn MarkerStore>,
    policy: StoragePolicy,
    channel_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MarkerCommitter {
    pub fn new(store: Arc<dyn MarkerStore>, policy: StoragePolicy) -> Self {
        Self {
            store,
            policy,
            channel_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> StoragePolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn MarkerStore> {
        &self.store
    }

    /// Store `marker` unless the channel is already past it.
    pub fn commit(&self, marker: ReplayMarker) -> Result<CommitOutcome> {
        let lock = self.channel_lock(&marker.channel);
        let _guard = lock.lock();

        if let Some(stored) = self.store.get_marker(&marker.channel)? {
            if !marker.supersedes(&stored) {
                debug!(
                    channel = %marker.channel,
                    replay_id = marker.replay_id,
                    stored = stored.replay_id,
                    "Skipping marker behind stored position"
                );
                return Ok(CommitOutcome::Skipped {
                    stored: stored.replay_id,
                });
            }
        }

        self.store.set_marker(marker)?;
        Ok(CommitOutcome::Stored)
    }

    /// Remove the channel's marker from the store.
    ///
    /// The channel's commit lock is released too unless another commit
    /// holds or waits on it.
    pub fn discard(&self, channel: &str) -> Result<()> {
        let lock = self.channel_lock(channel);
        let _guard = lock.lock();
        self.store.discard_marker(channel)?;

        let mut locks = self.channel_locks.lock();
        // One reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(channel);
        }
        Ok(())
    }

    /// Extract and commit the marker of a processed message.
    pub fn commit_message(&self, message: &Message) -> Result<CommitOutcome> {
        self.commit(ReplayMarker::extract(message)?)
    }

    /// Apply the storage policy to a message being handed to the consumer.
    ///
    /// Under [`StoragePolicy::Immediate`] the marker is committed now. A
    /// message without a readable marker is still delivered, uncommitted.
    pub fn on_delivery(&self, message: &Message) -> Result<()> {
        if self.policy != StoragePolicy::Immediate {
            return Ok(());
        }

        let marker = match ReplayMarker::extract(message) {
            Ok(marker) => marker,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "Delivering message without replay marker");
                return Ok(());
            }
        };
        self.commit(marker).map(|_| ())
    }

    /// Start a scoped commit for `message`.
    ///
    /// The marker is committed by [`CommitGuard::commit`]; dropping the
    /// guard or calling [`CommitGuard::abort`] leaves the store untouched.
    pub fn begin<'a>(&'a self, message: &'a Message) -> CommitGuard<'a> {
        CommitGuard {
            committer: self,
            message,
            finished: false,
        }
    }

    fn channel_lock(&self, channel: &str) -> Arc<Mutex<()>> {
        let mut locks = self.channel_locks.lock();
        Arc::clone(locks.entry(channel.to_string()).or_default())
    }
}

impl fmt::Debug for MarkerCommitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkerCommitter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Pending commit of one message's marker.
#[must_use = "dropping the guard discards the commit"]
pub struct CommitGuard<'a> {
    committer: &'a MarkerCommitter,
    message: &'a Message,
    finished: bool,
}

impl<'a> CommitGuard<'a> {
    pub fn message(&self) -> &Message {
        self.message
    }

    /// Commit the message's marker.
    pub fn commit(mut self) -> Result<CommitOutcome> {
        self.finished = true;
        self.committer.commit_message(self.message)
    }

    /// Give up without committing.
    pub fn abort(mut self) {
        self.finished = true;
        debug!(channel = %self.message.channel, "Commit aborted");
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(channel = %self.message.channel, "Commit guard dropped without commit");
        }
    }
}
