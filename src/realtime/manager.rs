//! Keeps one realtime channel alive per authenticated session.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::transport::{Channel, Transport};
use crate::backoff::BackoffPolicy;

const OUTGOING_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Connection status as seen by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Something that happened on the managed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    Status(ConnectionStatus),
    /// An inbound text frame
    Message(String),
}

/// Errors returned to the owner by [`RealtimeConnectionManager::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("outgoing queue is full")]
    QueueFull,
}

/// Read side of the connection status.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Wait for the next status change and return the new status.
    pub async fn changed(&mut self) -> ConnectionStatus {
        // The manager owns the sender, so an error only means it is gone.
        if self.status.changed().await.is_err() {
            return ConnectionStatus::Disconnected;
        }
        *self.status.borrow_and_update()
    }

    /// The current status followed by every change.
    pub fn into_stream(self) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.status)
    }
}

struct Session {
    token: String,
    task: JoinHandle<()>,
    outgoing: mpsc::Sender<String>,
}

struct Slot {
    /// Bumped on every connect and teardown; stale tasks compare against it
    generation: u64,
    active: Option<Session>,
}

struct Shared {
    endpoint: String,
    transport: Arc<dyn Transport>,
    policy: Arc<dyn BackoffPolicy>,
    max_attempts: Option<u32>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<RealtimeEvent>,
    slot: Mutex<Slot>,
}

enum PumpExit {
    Dropped(String),
    Stale,
}

impl Shared {
    /// Publish a status change on behalf of `generation`.
    ///
    /// Returns `false` once that generation has been torn down.
    fn publish(&self, generation: u64, status: ConnectionStatus) -> bool {
        let slot = self.slot.lock();
        if slot.generation != generation {
            return false;
        }
        self.set_status(status);
        true
    }

    /// Stop retrying: settle in `Disconnected` and release the session so
    /// the next `connect` starts over.
    fn give_up(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return;
        }
        slot.generation += 1;
        // Dropping our own join handle only detaches this task.
        slot.active = None;
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn deliver(&self, generation: u64, text: String) -> bool {
        let slot = self.slot.lock();
        if slot.generation != generation {
            return false;
        }
        let _ = self.events.send(RealtimeEvent::Message(text));
        true
    }

    /// Caller must hold the slot lock.
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
        let _ = self.events.send(RealtimeEvent::Status(status));
    }

    async fn supervise(self: Arc<Self>, generation: u64, token: String, mut outgoing: mpsc::Receiver<String>) {
        let mut retries: u32 = 0;
        let mut failures: u32 = 0;

        loop {
            if !self.publish(generation, ConnectionStatus::Connecting) {
                return;
            }

            match self.transport.open(&self.endpoint, &token).await {
                Ok(mut channel) => {
                    retries = 0;
                    failures = 0;
                    if !self.publish(generation, ConnectionStatus::Connected) {
                        return;
                    }
                    info!(transport = self.transport.name(), "Realtime channel connected");

                    match self.pump(generation, channel.as_mut(), &mut outgoing).await {
                        PumpExit::Dropped(reason) => {
                            warn!(%reason, "Realtime channel dropped");
                            if !self.publish(generation, ConnectionStatus::Connecting) {
                                return;
                            }
                        }
                        PumpExit::Stale => return,
                    }
                }
                Err(error) => {
                    failures += 1;
                    warn!(%error, failures, "Realtime connect attempt failed");

                    if self.max_attempts.is_some_and(|max| failures >= max) {
                        warn!(failures, "Giving up on realtime connection");
                        self.give_up(generation);
                        return;
                    }
                }
            }

            let delay = self.policy.next_delay(retries);
            retries = retries.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "Scheduling realtime reconnect");
            tokio::time::sleep(delay).await;
        }
    }

    async fn pump(
        &self,
        generation: u64,
        channel: &mut dyn Channel,
        outgoing: &mut mpsc::Receiver<String>,
    ) -> PumpExit {
        loop {
            tokio::select! {
                inbound = channel.recv() => match inbound {
                    Some(Ok(text)) => {
                        if !self.deliver(generation, text) {
                            return PumpExit::Stale;
                        }
                    }
                    Some(Err(error)) => return PumpExit::Dropped(error.to_string()),
                    None => return PumpExit::Dropped("closed by peer".to_string()),
                },
                outbound = outgoing.recv() => match outbound {
                    Some(text) => {
                        if let Err(error) = channel.send(text).await {
                            return PumpExit::Dropped(error.to_string());
                        }
                    }
                    // The session's sender is gone, so the session is too.
                    None => return PumpExit::Stale,
                },
            }
        }
    }
}

/// Maintains a single persistent realtime channel and reconnects it when
/// it drops.
///
/// Transport failures never reach the owner as errors; they show up as
/// status changes on the [`ConnectionHandle`] while the manager retries
/// with growing delays.
pub struct RealtimeConnectionManager {
    shared: Arc<Shared>,
}

impl RealtimeConnectionManager {
    /// `max_attempts` bounds consecutive failed connects; `None` retries forever.
    pub fn new(
        endpoint: &str,
        transport: Arc<dyn Transport>,
        policy: Arc<dyn BackoffPolicy>,
        max_attempts: Option<u32>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                endpoint: endpoint.to_string(),
                transport,
                policy,
                max_attempts: max_attempts.map(|max| max.max(1)),
                status,
                events,
                slot: Mutex::new(Slot {
                    generation: 0,
                    active: None,
                }),
            }),
        }
    }

    /// Connect for `session_token`. Must be called inside a tokio runtime.
    ///
    /// Connecting again with the same token keeps the existing channel. A
    /// different token tears the old channel down first.
    pub fn connect(&self, session_token: &str) -> ConnectionHandle {
        let mut slot = self.shared.slot.lock();

        if let Some(session) = &slot.active {
            if session.token == session_token && !session.task.is_finished() {
                debug!("Realtime session already active");
                return self.handle();
            }
        }
        self.teardown(&mut slot);

        let generation = slot.generation;
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let task = tokio::spawn(
            self.shared
                .clone()
                .supervise(generation, session_token.to_string(), outgoing_rx)
                .instrument(info_span!("realtime", session_id = %Uuid::new_v4())),
        );

        slot.active = Some(Session {
            token: session_token.to_string(),
            task,
            outgoing: outgoing_tx,
        });
        self.handle()
    }

    /// Close the channel and cancel any pending reconnect.
    pub fn disconnect(&self) {
        let mut slot = self.shared.slot.lock();
        self.teardown(&mut slot);
    }

    /// Queue a text frame on the connected channel.
    pub fn send(&self, text: impl Into<String>) -> Result<(), RealtimeError> {
        let slot = self.shared.slot.lock();
        let session = slot.active.as_ref().ok_or(RealtimeError::NotConnected)?;
        if *self.shared.status.borrow() != ConnectionStatus::Connected {
            return Err(RealtimeError::NotConnected);
        }

        session.outgoing.try_send(text.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RealtimeError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RealtimeError::NotConnected,
        })
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            status: self.shared.status.subscribe(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Subscribe to status changes and inbound messages.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.shared.events.subscribe()
    }

    fn teardown(&self, slot: &mut Slot) {
        slot.generation += 1;
        if let Some(session) = slot.active.take() {
            session.task.abort();
            info!("Realtime session torn down");
        }
        if *self.shared.status.borrow() != ConnectionStatus::Disconnected {
            self.shared.set_status(ConnectionStatus::Disconnected);
        }
    }
}

impl Drop for RealtimeConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.shared.slot.lock().active.take() {
            session.task.abort();
        }
    }
}
