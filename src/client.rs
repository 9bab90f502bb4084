//! Client facade tying credentials, transport, replay tracking and delivery
//! together.

use crate::auth::CredentialProvider;
use crate::codec::{JsonCodec, SerdeJsonCodec};
use crate::delivery::{
    DeliveryPipeline, PipelineParts, PipelineSettings, DEFAULT_CONNECTION_TIMEOUT,
    DEFAULT_MAX_PENDING, DEFAULT_RESUBSCRIBE_RETRY,
};
use crate::error::{Result, StreamError};
use crate::replay::{
    CommitGuard, CommitOutcome, ConstantReplay, MappingStore, MarkerCommitter, MarkerMapping,
    MarkerStore, ReplayMarker, ReplayOption, ReplayPolicy,
};
use crate::subscriptions::{ChannelState, SubscriptionManager};
use crate::transport::{ConnectRequest, Transport};
use crate::types::{Message, StoragePolicy};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where replay positions come from.
#[derive(Clone)]
pub enum ReplaySource {
    /// Always request this option; nothing is persisted.
    Option(ReplayOption),
    /// Resume from the markers in this store.
    Store(Arc<dyn MarkerStore>),
}

impl ReplaySource {
    /// Store markers in `mapping`.
    pub fn mapping<M: MarkerMapping + 'static>(mapping: M) -> Self {
        ReplaySource::Store(Arc::new(MappingStore::new(mapping)))
    }

    fn into_store(self) -> Arc<dyn MarkerStore> {
        match self {
            ReplaySource::Option(option) => Arc::new(ConstantReplay::new(option)),
            ReplaySource::Store(store) => store,
        }
    }
}

impl Default for ReplaySource {
    fn default() -> Self {
        ReplaySource::Option(ReplayOption::NewEvents)
    }
}

impl From<ReplayOption> for ReplaySource {
    fn from(option: ReplayOption) -> Self {
        ReplaySource::Option(option)
    }
}

impl From<Arc<dyn MarkerStore>> for ReplaySource {
    fn from(store: Arc<dyn MarkerStore>) -> Self {
        ReplaySource::Store(store)
    }
}

impl fmt::Debug for ReplaySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaySource::Option(option) => f.debug_tuple("Option").field(option).finish(),
            ReplaySource::Store(_) => f.write_str("Store(..)"),
        }
    }
}

/// Configuration for a client.
#[derive(Clone)]
pub struct ClientConfig {
    pub replay: ReplaySource,

    /// Retried once when the server rejects a replay position.
    /// Default: none
    pub replay_fallback: Option<ReplayOption>,

    pub storage_policy: StoragePolicy,

    /// Bound on a reconnect, including resubscribing every channel.
    /// `None` waits indefinitely.
    /// Default: 10 seconds
    pub connection_timeout: Option<Duration>,

    /// Pause before retrying a resubscription that failed in transit.
    /// Default: 250 milliseconds
    pub resubscribe_retry: Duration,

    /// Buffered messages before intake blocks. 0 means unbounded.
    /// Default: 100
    pub max_pending_count: usize,

    pub codec: Arc<dyn JsonCodec>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            replay: ReplaySource::default(),
            replay_fallback: None,
            storage_policy: StoragePolicy::Immediate,
            connection_timeout: Some(DEFAULT_CONNECTION_TIMEOUT),
            resubscribe_retry: DEFAULT_RESUBSCRIBE_RETRY,
            max_pending_count: DEFAULT_MAX_PENDING,
            codec: Arc::new(SerdeJsonCodec),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("replay", &self.replay)
            .field("replay_fallback", &self.replay_fallback)
            .field("storage_policy", &self.storage_policy)
            .field("connection_timeout", &self.connection_timeout)
            .field("resubscribe_retry", &self.resubscribe_retry)
            .field("max_pending_count", &self.max_pending_count)
            .finish_non_exhaustive()
    }
}

/// State that lives from `open` to `close`.
struct Session {
    manager: Arc<SubscriptionManager>,
    pipeline: DeliveryPipeline,
}

/// Streaming client.
///
/// All methods take `&self`; one thread can block in
/// [`receive`](Self::receive) while others subscribe, commit or close.
pub struct Client {
    credentials: Box<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn MarkerStore>,
    policy: ReplayPolicy,
    committer: Arc<MarkerCommitter>,
    settings: PipelineSettings,
    codec: Arc<dyn JsonCodec>,
    session: Mutex<Option<Arc<Session>>>,
}

impl Client {
    /// Create a closed client.
    pub fn new<C, T>(credentials: C, transport: T, config: ClientConfig) -> Self
    where
        C: CredentialProvider + 'static,
        T: Transport + 'static,
    {
        let store = config.replay.into_store();
        let policy = ReplayPolicy::new(Arc::clone(&store), config.replay_fallback);
        let committer = Arc::new(MarkerCommitter::new(
            Arc::clone(&store),
            config.storage_policy,
        ));
        debug!(
            replay_fallback = ?config.replay_fallback,
            storage_policy = ?config.storage_policy,
            "Client created"
        );

        Self {
            credentials: Box::new(credentials),
            transport: Arc::new(transport),
            store,
            policy,
            committer,
            settings: PipelineSettings {
                max_pending_count: config.max_pending_count,
                connection_timeout: config.connection_timeout,
                resubscribe_retry: config.resubscribe_retry,
            },
            codec: config.codec,
            session: Mutex::new(None),
        }
    }

    /// Authenticate and connect.
    ///
    /// Fails with [`StreamError::InvalidOperation`] if the client is open.
    pub fn open(&self) -> Result<()> {
        let mut session = self.session.lock();
        if let Some(current) = session.as_ref() {
            if !current.pipeline.is_closed() {
                return Err(StreamError::InvalidOperation(
                    "Client is already open".into(),
                ));
            }
        }
        // A session ended by the server is replaced
        if let Some(stale) = session.take() {
            stale.pipeline.shutdown();
            stale.pipeline.join();
        }

        debug!("Authenticating");
        let credentials = self.credentials.authenticate()?;
        let request = ConnectRequest {
            url: credentials.streaming_url(),
            authorization: credentials.authorization_header(),
        };

        let events = self.transport.connect(&request)?;
        let manager = Arc::new(SubscriptionManager::new(
            Arc::clone(&self.transport),
            self.policy.clone(),
        ));
        let pipeline = DeliveryPipeline::start(
            PipelineParts {
                events,
                transport: Arc::clone(&self.transport),
                manager: Arc::clone(&manager),
                committer: Arc::clone(&self.committer),
                codec: Arc::clone(&self.codec),
            },
            self.settings.clone(),
        )?;

        *session = Some(Arc::new(Session { manager, pipeline }));
        info!(url = %request.url, "Client opened");
        Ok(())
    }

    /// Disconnect and release the pending buffer.
    ///
    /// Subscriptions are forgotten; markers are kept. Closing a closed
    /// client does nothing.
    pub fn close(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };

        // Consumers woken by the manager must already see the pipeline closed
        session.pipeline.shutdown();
        session.manager.shutdown();
        let closed = self.transport.close();
        session.pipeline.join();

        info!("Client closed");
        closed
    }

    pub fn is_closed(&self) -> bool {
        match self.session.lock().as_ref() {
            Some(session) => session.pipeline.is_closed(),
            None => true,
        }
    }

    pub fn subscribe(&self, channel: &str) -> Result<()> {
        self.session()?.manager.subscribe(channel)
    }

    pub fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.session()?.manager.unsubscribe(channel)
    }

    /// Publish `data` to `channel` and return the server's response.
    pub fn publish(&self, channel: &str, data: &Value) -> Result<Value> {
        self.session()?;
        let payload = self.codec.encode(data)?;
        let response = self.transport.publish(channel, &payload)?;
        self.codec.decode(&response)
    }

    /// Wait for the next message.
    ///
    /// Buffered messages are still returned after the connection failed;
    /// the failure follows them, then [`StreamError::ClientClosed`].
    pub fn receive(&self) -> Result<Message> {
        self.session()?.pipeline.receive()
    }

    /// Like [`receive`](Self::receive), with `Ok(None)` after `timeout`.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        self.session()?.pipeline.receive_timeout(timeout)
    }

    /// Iterate over received messages until the client is closed.
    pub fn messages(&self) -> Messages<'_> {
        Messages { client: self }
    }

    /// Commit the marker of a processed message.
    pub fn commit(&self, message: &Message) -> Result<CommitOutcome> {
        self.committer.commit_message(message)
    }

    /// Begin a scoped commit for `message`.
    pub fn begin<'a>(&'a self, message: &'a Message) -> CommitGuard<'a> {
        self.committer.begin(message)
    }

    /// Run `process` on `message` and commit its marker only if it succeeds.
    pub fn process<T, E, F>(&self, message: &Message, process: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Message) -> std::result::Result<T, E>,
        E: From<StreamError>,
    {
        let guard = self.begin(message);
        match process(message) {
            Ok(value) => {
                guard.commit()?;
                Ok(value)
            }
            Err(e) => {
                guard.abort();
                Err(e)
            }
        }
    }

    /// Stored marker of `channel`.
    pub fn marker(&self, channel: &str) -> Result<Option<ReplayMarker>> {
        self.store.get_marker(channel)
    }

    /// Forget the stored marker of `channel`.
    pub fn discard_marker(&self, channel: &str) -> Result<()> {
        debug!(channel = %channel, "Discarding marker");
        self.committer.discard(channel)
    }

    /// Desired channels in subscription order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.current()
            .map(|session| session.manager.subscriptions())
            .unwrap_or_default()
    }

    pub fn subscription_state(&self, channel: &str) -> ChannelState {
        self.current()
            .map(|session| session.manager.state(channel))
            .unwrap_or_default()
    }

    /// Messages received from the server and not yet consumed.
    pub fn pending_count(&self) -> usize {
        self.current()
            .map(|session| session.pipeline.pending_count())
            .unwrap_or(0)
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn storage_policy(&self) -> StoragePolicy {
        self.committer.policy()
    }

    pub fn replay_fallback(&self) -> Option<ReplayOption> {
        self.policy.fallback()
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.current().ok_or(StreamError::ClientClosed)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Close on drop failed");
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("policy", &self.policy)
            .field("settings", &self.settings)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Iterator over a client's messages.
///
/// Errors are yielded and iteration continues; it ends once the client is
/// closed.
pub struct Messages<'a> {
    client: &'a Client,
}

impl Iterator for Messages<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.client.receive() {
            Err(StreamError::ClientClosed) => None,
            result => Some(result),
        }
    }
}
