//! Pending buffer between transport intake and the consumer.

use crate::codec::JsonCodec;
use crate::error::{Result, StreamError};
use crate::replay::MarkerCommitter;
use crate::subscriptions::{Freshness, Resubscription, SubscriptionManager};
use crate::transport::{Transport, TransportEvent};
use crate::types::Message;
use crossbeam_channel::{at, bounded, never, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default capacity of the pending buffer.
pub const DEFAULT_MAX_PENDING: usize = 100;

/// Default bound on a reconnect.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause before retrying resubscriptions cut short in transit.
pub const DEFAULT_RESUBSCRIBE_RETRY: Duration = Duration::from_millis(250);

/// Buffer and reconnect limits.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Buffered messages before intake blocks. 0 means unbounded.
    pub max_pending_count: usize,
    /// How long the transport may stay disconnected, or resubscription
    /// may stay incomplete. `None` waits forever.
    pub connection_timeout: Option<Duration>,
    /// Pause between attempts at resubscriptions that failed in transit.
    pub resubscribe_retry: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_pending_count: DEFAULT_MAX_PENDING,
            connection_timeout: Some(DEFAULT_CONNECTION_TIMEOUT),
            resubscribe_retry: DEFAULT_RESUBSCRIBE_RETRY,
        }
    }
}

/// An entry of the pending buffer.
#[derive(Debug)]
pub enum Pending {
    Message {
        message: Message,
        /// Connection epoch at intake.
        epoch: u64,
    },
    /// Surfaced from the next `receive`.
    Failure(StreamError),
}

/// Collaborators the pipeline delivers through.
pub struct PipelineParts {
    pub events: Receiver<TransportEvent>,
    pub transport: Arc<dyn Transport>,
    pub manager: Arc<SubscriptionManager>,
    pub committer: Arc<MarkerCommitter>,
    pub codec: Arc<dyn JsonCodec>,
}

/// Feeds transport messages into a bounded buffer on a background thread
/// and hands them to the consumer with the storage policy applied.
pub struct DeliveryPipeline {
    buffer: Receiver<Pending>,
    /// Message taken from the buffer but not handed over, with its intake
    /// epoch: its commit failed or its channel was still resubscribing.
    /// Retried before anything else.
    held: Mutex<Option<(Message, u64)>>,
    manager: Arc<SubscriptionManager>,
    committer: Arc<MarkerCommitter>,
    closed: AtomicBool,
    terminated: Arc<AtomicBool>,
    shutdown: Mutex<Option<Sender<()>>>,
    intake: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryPipeline {
    /// Start the intake thread.
    pub fn start(parts: PipelineParts, settings: PipelineSettings) -> Result<Self> {
        let (buffer_tx, buffer_rx) = if settings.max_pending_count == 0 {
            unbounded()
        } else {
            bounded(settings.max_pending_count)
        };
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let terminated = Arc::new(AtomicBool::new(false));

        let intake = Intake {
            events: parts.events,
            buffer: buffer_tx,
            shutdown: shutdown_rx,
            manager: Arc::clone(&parts.manager),
            transport: parts.transport,
            codec: parts.codec,
            connection_timeout: settings.connection_timeout,
            resubscribe_retry: settings.resubscribe_retry,
            terminated: Arc::clone(&terminated),
        };
        let handle = thread::Builder::new()
            .name("replay-stream-intake".into())
            .spawn(move || intake.run())?;

        Ok(Self {
            buffer: buffer_rx,
            held: Mutex::new(None),
            manager: parts.manager,
            committer: parts.committer,
            closed: AtomicBool::new(false),
            terminated,
            shutdown: Mutex::new(Some(shutdown_tx)),
            intake: Mutex::new(Some(handle)),
        })
    }

    /// Wait for the next message.
    ///
    /// Under [`StoragePolicy::Immediate`](crate::StoragePolicy::Immediate)
    /// the message's marker is committed before it is returned. If that
    /// commit fails the error is returned and the same message is retried
    /// on the next call.
    pub fn receive(&self) -> Result<Message> {
        match self.next(None)? {
            Some(message) => Ok(message),
            None => Err(StreamError::ClientClosed),
        }
    }

    /// Like [`receive`](Self::receive), giving up with `Ok(None)` after
    /// `timeout`. A message whose channel is still resubscribing when the
    /// time runs out stays first in line.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        self.next(Some(Instant::now() + timeout))
    }

    /// Messages buffered and not yet received.
    pub fn pending_count(&self) -> usize {
        self.buffer.len() + usize::from(self.held.lock().is_some())
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// Closed by the consumer, or ended by a fatal connection failure.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.terminated.load(Ordering::SeqCst)
    }

    /// Stop intake and release the buffer.
    ///
    /// Blocked `receive` calls return [`StreamError::ClientClosed`].
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.lock().take();
    }

    /// Wait for the intake thread after [`shutdown`](Self::shutdown).
    pub fn join(&self) {
        if let Some(handle) = self.intake.lock().take() {
            if handle.join().is_err() {
                warn!("Intake thread panicked");
            }
        }
        while self.buffer.try_recv().is_ok() {}
        self.held.lock().take();
    }

    fn next(&self, deadline: Option<Instant>) -> Result<Option<Message>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(StreamError::ClientClosed);
            }

            let held = self.held.lock().take();
            let (message, epoch) = match held {
                Some(held) => held,
                None => {
                    let timer = deadline.map(at).unwrap_or_else(never);
                    let pending = select! {
                        recv(self.buffer) -> pending => pending,
                        recv(timer) -> _ => return Ok(None),
                    };
                    match pending {
                        Ok(Pending::Message { message, epoch }) => (message, epoch),
                        Ok(Pending::Failure(e)) => return Err(e),
                        // Intake stopped and everything buffered was received
                        Err(_) => return Err(StreamError::ClientClosed),
                    }
                }
            };

            let Some(freshness) = self.manager.freshness(&message.channel, epoch, deadline) else {
                *self.held.lock() = Some((message, epoch));
                return Ok(None);
            };
            match freshness {
                Freshness::Current => return self.hand_over(message, epoch).map(Some),
                Freshness::Unreplayable => {
                    debug!(channel = %message.channel, "Delivering pre-reconnect message without commit");
                    return Ok(Some(message));
                }
                Freshness::Replayed => {
                    debug!(channel = %message.channel, "Dropping pre-reconnect message, server replays it");
                }
                Freshness::Closed => {
                    debug!(channel = %message.channel, "Dropping pre-reconnect message, subscriptions closed");
                }
            }
        }
    }

    fn hand_over(&self, message: Message, epoch: u64) -> Result<Message> {
        if let Err(e) = self.committer.on_delivery(&message) {
            warn!(channel = %message.channel, error = %e, "Marker commit failed, message held");
            *self.held.lock() = Some((message, epoch));
            return Err(e);
        }
        Ok(message)
    }
}

impl Drop for DeliveryPipeline {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

impl fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("pending", &self.buffer.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Background side of the pipeline.
struct Intake {
    events: Receiver<TransportEvent>,
    buffer: Sender<Pending>,
    shutdown: Receiver<()>,
    manager: Arc<SubscriptionManager>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn JsonCodec>,
    connection_timeout: Option<Duration>,
    resubscribe_retry: Duration,
    terminated: Arc<AtomicBool>,
}

impl Intake {
    fn run(self) {
        let mut lost = false;
        // Bound on the connection staying down or resubscription staying
        // incomplete
        let mut deadline: Option<Instant> = None;
        let mut retry: Option<Instant> = None;

        loop {
            let timer = deadline.map(at).unwrap_or_else(never);
            let retry_timer = retry.map(at).unwrap_or_else(never);
            select! {
                recv(self.shutdown) -> _ => break,
                recv(self.events) -> event => match event {
                    Ok(TransportEvent::Message(frame)) => {
                        if !self.take_in(&frame) {
                            break;
                        }
                    }
                    Ok(TransportEvent::State(state)) if state.is_connected() => {
                        if lost {
                            lost = false;
                            deadline = None;
                            info!("Connection restored");
                            let outcome = self.manager.resubscribe_all();
                            if !self.follow_up(outcome, &mut deadline, &mut retry) {
                                break;
                            }
                        }
                    }
                    Ok(TransportEvent::State(state)) => {
                        if !lost {
                            lost = true;
                            retry = None;
                            deadline = self.connection_timeout.map(|t| Instant::now() + t);
                            warn!(state = ?state, timeout = ?self.connection_timeout, "Connection lost");
                            self.manager.connection_lost();
                        }
                    }
                    Ok(TransportEvent::Closed) | Err(_) => {
                        warn!("Session closed by the server");
                        self.terminate(StreamError::ConnectionClosed);
                        break;
                    }
                },
                recv(retry_timer) -> _ => {
                    retry = None;
                    let outcome = self.manager.retry_interrupted();
                    if !self.follow_up(outcome, &mut deadline, &mut retry) {
                        break;
                    }
                }
                recv(timer) -> _ => {
                    let timeout = self.connection_timeout.unwrap_or_default();
                    warn!(timeout = ?timeout, "Reconnect timed out");
                    if let Err(e) = self.transport.close() {
                        warn!(error = %e, "Transport close failed");
                    }
                    self.terminate(StreamError::Timeout(timeout));
                    break;
                }
            }
        }
        debug!("Intake stopped");
    }

    /// Decode a frame and buffer it. Returns false once shut down.
    fn take_in(&self, frame: &[u8]) -> bool {
        let message = match self.codec.decode(frame).and_then(Message::from_value) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return true;
            }
        };
        if message.is_meta() {
            return true;
        }

        let epoch = self.manager.epoch();
        self.push(Pending::Message { message, epoch })
    }

    /// Surface channels the server refused and schedule another attempt
    /// for those interrupted in transit. Returns false once shut down.
    fn follow_up(
        &self,
        outcome: Resubscription,
        deadline: &mut Option<Instant>,
        retry: &mut Option<Instant>,
    ) -> bool {
        if outcome.interrupted.is_empty() {
            *deadline = None;
            *retry = None;
        } else {
            let now = Instant::now();
            *retry = Some(now + self.resubscribe_retry);
            if deadline.is_none() {
                *deadline = self.connection_timeout.map(|t| now + t);
            }
        }

        for (_, error) in outcome.failures {
            if !self.push(Pending::Failure(error)) {
                return false;
            }
        }
        true
    }

    /// Blocking enqueue that gives up on shutdown.
    fn push(&self, pending: Pending) -> bool {
        select! {
            send(self.buffer, pending) -> sent => sent.is_ok(),
            recv(self.shutdown) -> _ => false,
        }
    }

    fn terminate(&self, error: StreamError) {
        self.terminated.store(true, Ordering::SeqCst);
        self.manager.shutdown();
        self.push(Pending::Failure(error));
    }
}
