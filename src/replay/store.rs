//! Replay marker storage.

use super::mapping::MarkerMapping;
use super::marker::{ReplayMarker, ReplayOption};
use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// Storage for the last committed marker of each channel.
///
/// A missing marker is not an error: `get_marker` returns `Ok(None)` and the
/// store's [`default_on_miss`](MarkerStore::default_on_miss) decides what a
/// subscription requests instead.
pub trait MarkerStore: Send + Sync {
    /// Get the stored marker for a channel.
    fn get_marker(&self, channel: &str) -> Result<Option<ReplayMarker>>;

    /// Store a marker under its channel.
    fn set_marker(&self, marker: ReplayMarker) -> Result<()>;

    /// Forget the marker of a channel.
    fn discard_marker(&self, channel: &str) -> Result<()>;

    /// Replay request used for channels without a marker.
    fn default_on_miss(&self) -> Option<ReplayOption> {
        None
    }
}

impl<S: MarkerStore + ?Sized> MarkerStore for Arc<S> {
    fn get_marker(&self, channel: &str) -> Result<Option<ReplayMarker>> {
        (**self).get_marker(channel)
    }

    fn set_marker(&self, marker: ReplayMarker) -> Result<()> {
        (**self).set_marker(marker)
    }

    fn discard_marker(&self, channel: &str) -> Result<()> {
        (**self).discard_marker(channel)
    }

    fn default_on_miss(&self) -> Option<ReplayOption> {
        (**self).default_on_miss()
    }
}

/// Store backed by any [`MarkerMapping`].
pub struct MappingStore<M> {
    mapping: M,
}

impl<M: MarkerMapping> MappingStore<M> {
    pub fn new(mapping: M) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &M {
        &self.mapping
    }

    pub fn into_inner(self) -> M {
        self.mapping
    }
}

impl<M: MarkerMapping> MarkerStore for MappingStore<M> {
    fn get_marker(&self, channel: &str) -> Result<Option<ReplayMarker>> {
        self.mapping.get(channel)
    }

    fn set_marker(&self, marker: ReplayMarker) -> Result<()> {
        let channel = marker.channel.clone();
        self.mapping.insert(&channel, marker)
    }

    fn discard_marker(&self, channel: &str) -> Result<()> {
        self.mapping.remove(channel)
    }
}

impl<M> fmt::Debug for MappingStore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingStore").finish_non_exhaustive()
    }
}

/// Decorator that requests a fixed option for channels without a marker.
///
/// Real markers still take precedence once committed.
pub struct DefaultOnMiss<S> {
    inner: S,
    default: ReplayOption,
}

impl<S: MarkerStore> DefaultOnMiss<S> {
    pub fn new(inner: S, default: ReplayOption) -> Self {
        Self { inner, default }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: MarkerStore> MarkerStore for DefaultOnMiss<S> {
    fn get_marker(&self, channel: &str) -> Result<Option<ReplayMarker>> {
        self.inner.get_marker(channel)
    }

    fn set_marker(&self, marker: ReplayMarker) -> Result<()> {
        self.inner.set_marker(marker)
    }

    fn discard_marker(&self, channel: &str) -> Result<()> {
        self.inner.discard_marker(channel)
    }

    fn default_on_miss(&self) -> Option<ReplayOption> {
        Some(self.default)
    }
}

impl<S> fmt::Debug for DefaultOnMiss<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultOnMiss")
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

/// Store that persists nothing and always requests the same option.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstantReplay {
    option: ReplayOption,
}

impl ConstantReplay {
    pub fn new(option: ReplayOption) -> Self {
        Self { option }
    }
}

impl MarkerStore for ConstantReplay {
    fn get_marker(&self, _channel: &str) -> Result<Option<ReplayMarker>> {
        Ok(None)
    }

    fn set_marker(&self, _marker: ReplayMarker) -> Result<()> {
        Ok(())
    }

    fn discard_marker(&self, _channel: &str) -> Result<()> {
        Ok(())
    }

    fn default_on_miss(&self) -> Option<ReplayOption> {
        Some(self.option)
    }
}
