//! Decides which replay position a (re)subscription requests.

use super::marker::ReplayOption;
use super::store::MarkerStore;
use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// Replay resolution over a marker store.
///
/// Nothing is cached: the store is consulted on every call, since markers
/// advance between subscribe attempts.
#[derive(Clone)]
pub struct ReplayPolicy {
    store: Arc<dyn MarkerStore>,
    fallback: Option<ReplayOption>,
}

impl ReplayPolicy {
    pub fn new(store: Arc<dyn MarkerStore>, fallback: Option<ReplayOption>) -> Self {
        Self { store, fallback }
    }

    /// Replay request for the next subscribe attempt on `channel`.
    ///
    /// A stored marker resumes strictly after its id. Without one, the
    /// store's miss default applies, and new events only if it has none.
    pub fn resolve_replay_value(&self, channel: &str) -> Result<ReplayOption> {
        match self.store.get_marker(channel)? {
            Some(marker) => Ok(marker.resume_option()),
            None => Ok(self
                .store
                .default_on_miss()
                .unwrap_or(ReplayOption::NewEvents)),
        }
    }

    /// Option to retry with after the server rejects a replay position.
    pub fn resolve_fallback(&self, _channel: &str) -> Option<ReplayOption> {
        self.fallback
    }

    /// The configured fallback, if any.
    pub fn fallback(&self) -> Option<ReplayOption> {
        self.fallback
    }

    pub fn store(&self) -> &Arc<dyn MarkerStore> {
        &self.store
    }
}

impl fmt::Debug for ReplayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayPolicy")
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}
