//! Broadcast room.
//!
//! # Responsibilities
//! - Registry of connected clients, guarded by one reader-writer lock
//! - A single event loop consuming enter, leave and message events in order
//! - Fan-out of a frame to every registered client
//! - Teardown that close-frames every client
//!
//! # Design Decisions
//! - Producers hand events to the loop through a one-slot queue and wait until
//!   the event has been fully processed
//! - `broadcast` takes the lock in write mode so membership cannot change
//!   mid fan-out
//! - Failure policy is fixed at construction: restricted broadcast stops at
//!   the first failing client and returns its error; otherwise every failure
//!   goes to the error callback and the fan-out continues
//! - `close` is one-way: later events are refused with `RoomError::Closed`
//! - Callbacks run on the loop task and must not wait on this room's events

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;

use super::client::{closed_signal, Client, ClientId};
use super::frame::{self, CloseCode, Opcode};
use super::handshake::WsError;
use crate::observability::metrics::WS_BROADCAST_FAILURES_TOTAL;

/// Errors reported by a room.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room {0:?} is closed")]
    Closed(String),

    #[error("room event loop is already running")]
    AlreadyRunning,

    #[error("client {client}: {source}")]
    Client {
        client: ClientId,
        #[source]
        source: WsError,
    },
}

/// An event payload together with the client it concerns.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub client: Arc<Client>,
    pub data: Vec<u8>,
}

impl RoomMessage {
    pub fn new(client: Arc<Client>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            client,
            data: data.into(),
        }
    }
}

type EventCallback = Arc<dyn Fn(&RoomMessage) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&RoomError) + Send + Sync>;

/// Callbacks and failure policy, fixed when the room is created.
#[derive(Clone)]
pub struct RoomOptions {
    restricted_broadcast: bool,
    on_enter: Option<EventCallback>,
    on_leave: Option<EventCallback>,
    on_message: Option<EventCallback>,
    on_error: ErrorCallback,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            restricted_broadcast: false,
            on_enter: None,
            on_leave: None,
            on_message: None,
            on_error: Arc::new(|err: &RoomError| tracing::warn!(error = %err, "Room error")),
        }
    }
}

impl fmt::Debug for RoomOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomOptions")
            .field("restricted_broadcast", &self.restricted_broadcast)
            .finish_non_exhaustive()
    }
}

impl RoomOptions {
    pub fn restricted_broadcast(mut self, restricted: bool) -> Self {
        self.restricted_broadcast = restricted;
        self
    }

    pub fn on_enter(mut self, f: impl Fn(&RoomMessage) + Send + Sync + 'static) -> Self {
        self.on_enter = Some(Arc::new(f));
        self
    }

    pub fn on_leave(mut self, f: impl Fn(&RoomMessage) + Send + Sync + 'static) -> Self {
        self.on_leave = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(&RoomMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&RoomError) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(f);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Enter,
    Leave,
    Message,
}

struct Command {
    event: Event,
    message: RoomMessage,
    done: oneshot::Sender<()>,
}

/// A named group of clients sharing broadcasts.
pub struct Room {
    name: String,
    clients: RwLock<BTreeMap<ClientId, Arc<Client>>>,
    options: RoomOptions,
    queue: mpsc::Sender<Command>,
    inbox: StdMutex<Option<mpsc::Receiver<Command>>>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Room {
    /// Create an empty room. Events are only processed once [`Room::run`] is
    /// driven, usually through [`Room::spawn`].
    pub fn new(name: impl Into<String>, options: RoomOptions) -> Arc<Self> {
        let (queue, inbox) = mpsc::channel(1);
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            clients: RwLock::new(BTreeMap::new()),
            options,
            queue,
            inbox: StdMutex::new(Some(inbox)),
            closed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Run the event loop on a new task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<(), RoomError>> {
        let room = Arc::clone(self);
        tokio::spawn(async move { room.run().await })
    }

    /// Consume events until the room is closed.
    pub async fn run(&self) -> Result<(), RoomError> {
        let mut inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RoomError::AlreadyRunning)?;
        let mut closed = self.closed.subscribe();

        tracing::debug!(room = %self.name, "Room event loop started");
        loop {
            let command = tokio::select! {
                biased;
                _ = closed_signal(&mut closed) => None,
                command = inbox.recv() => command,
            };
            // A command dequeued after close is dropped unprocessed; its
            // producer sees `RoomError::Closed`.
            let Some(command) = command.filter(|_| !self.is_closed()) else {
                break;
            };
            if !self.process(command.event, &command.message).await {
                break;
            }
            let _ = command.done.send(());
        }
        tracing::debug!(room = %self.name, "Room event loop stopped");
        Ok(())
    }

    /// Returns false when the room closed before the event took effect.
    async fn process(&self, event: Event, message: &RoomMessage) -> bool {
        match event {
            Event::Enter => {
                let mut clients = self.clients.write().await;
                // `close` raises the flag before it empties the registry
                // under this lock.
                if self.is_closed() {
                    return false;
                }
                clients.insert(message.client.id(), Arc::clone(&message.client));
                drop(clients);
                tracing::debug!(room = %self.name, client_id = %message.client.id(), "Client entered");
            }
            Event::Leave => {
                self.remove(&message.client).await;
                tracing::debug!(room = %self.name, client_id = %message.client.id(), "Client left");
            }
            Event::Message => {}
        }

        if let Err(err) = self.broadcast(&message.data, Opcode::Text).await {
            (self.options.on_error)(&err);
        }

        let callback = match event {
            Event::Enter => &self.options.on_enter,
            Event::Leave => &self.options.on_leave,
            Event::Message => &self.options.on_message,
        };
        if let Some(callback) = callback {
            callback(message);
        }
        true
    }

    async fn submit(&self, event: Event, message: RoomMessage) -> Result<(), RoomError> {
        if self.is_closed() {
            return Err(RoomError::Closed(self.name.clone()));
        }
        let (done, processed) = oneshot::channel();
        self.queue
            .send(Command {
                event,
                message,
                done,
            })
            .await
            .map_err(|_| RoomError::Closed(self.name.clone()))?;
        processed
            .await
            .map_err(|_| RoomError::Closed(self.name.clone()))
    }

    /// Register the client, then broadcast the payload to everyone.
    pub async fn broadcast_enter(&self, message: RoomMessage) -> Result<(), RoomError> {
        self.submit(Event::Enter, message).await
    }

    /// Unregister the client, then broadcast the payload to everyone left.
    pub async fn broadcast_leave(&self, message: RoomMessage) -> Result<(), RoomError> {
        self.submit(Event::Leave, message).await
    }

    /// Broadcast the payload without changing membership.
    pub async fn broadcast_message(&self, message: RoomMessage) -> Result<(), RoomError> {
        self.submit(Event::Message, message).await
    }

    /// Write one frame to every registered client, in registry order.
    pub async fn broadcast(&self, payload: &[u8], opcode: Opcode) -> Result<(), RoomError> {
        let encoded = frame::encode(payload, opcode);
        let clients = self.clients.write().await;
        for client in clients.values() {
            if let Err(source) = client.send_encoded(&encoded).await {
                metrics::counter!(WS_BROADCAST_FAILURES_TOTAL).increment(1);
                let err = RoomError::Client {
                    client: client.id(),
                    source,
                };
                if self.options.restricted_broadcast {
                    return Err(err);
                }
                (self.options.on_error)(&err);
            }
        }
        Ok(())
    }

    /// Register a client directly, bypassing the event loop.
    pub async fn add(&self, client: Arc<Client>) {
        self.clients.write().await.insert(client.id(), client);
    }

    /// Unregister a client directly. Returns whether it was registered.
    pub async fn remove(&self, client: &Client) -> bool {
        self.clients.write().await.remove(&client.id()).is_some()
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn has(&self, client: &Client) -> bool {
        self.clients.read().await.contains_key(&client.id())
    }

    /// Snapshot of the registered clients.
    pub async fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Close the room: stop the loop, send every client a normal-closure
    /// frame with no reason, and drop them.
    ///
    /// Calling it again does nothing.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        // Releases producers waiting on a loop that never started.
        drop(
            self.inbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let clients = std::mem::take(&mut *self.clients.write().await);
        for client in clients.into_values() {
            match client.close("", CloseCode::NORMAL).await {
                Ok(()) | Err(WsError::Closed) => {}
                Err(source) => (self.options.on_error)(&RoomError::Client {
                    client: client.id(),
                    source,
                }),
            }
        }
        tracing::debug!(room = %self.name, "Room closed");
    }
}
