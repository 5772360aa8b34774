use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use common::{ClientMessage, PlayerId, PlayerIdentity, ProtocolError, ServerMessage};
use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, RetryPolicy};
use crate::dispatcher::Dispatcher;
use crate::error::{ClientError, ClientResult};
use crate::storage::SettingsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Identified,
    Reconnecting,
}

/// Fire-and-forget sink for outbound protocol messages
pub trait Outbound: Send + Sync {
    fn send(&self, message: ClientMessage);
}

type AttemptFuture = Shared<BoxFuture<'static, ClientResult<PlayerIdentity>>>;

/// One open WebSocket and its handshake bookkeeping
struct Transport {
    generation: u64,
    outgoing: mpsc::UnboundedSender<Message>,
    handshake_started: bool,
    identity_resolved: bool,
    fallback_requested: bool,
    identity_tx: Option<oneshot::Sender<PlayerIdentity>>,
}

impl Transport {
    fn push(&self, message: &ClientMessage) -> ClientResult<()> {
        let text = message.encode()?;
        self.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| ClientError::ConnectionClosed)
    }

    fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }
}

#[derive(Default)]
struct Slots {
    transport: Option<Transport>,
    next_generation: u64,
    attempt: Option<(u64, AttemptFuture)>,
    next_attempt: u64,
}

impl Slots {
    fn current(&self, generation: u64) -> Option<&Transport> {
        self.transport
            .as_ref()
            .filter(|transport| transport.generation == generation)
    }

    fn current_mut(&mut self, generation: u64) -> Option<&mut Transport> {
        self.transport
            .as_mut()
            .filter(|transport| transport.generation == generation)
    }
}

struct Inner {
    config: ClientConfig,
    settings: Arc<SettingsStore>,
    dispatcher: Dispatcher<ServerMessage>,
    slots: Mutex<Slots>,
    state: watch::Sender<ConnectionState>,
    identity: Mutex<Option<PlayerIdentity>>,
    offline: AtomicBool,
    // Bumped by an explicit disconnect so running retry loops stand down
    epoch: AtomicU64,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    shutdown: CancellationToken,
}

/// Owns the single relay session and the player's identity with it.
///
/// At most one transport is open and at most one retry loop runs; callers
/// that need connectivity while an attempt is in flight join that attempt.
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        settings: Arc<SettingsStore>,
        dispatcher: Dispatcher<ServerMessage>,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            config,
            settings,
            dispatcher,
            slots: Mutex::new(Slots::default()),
            state: state_tx,
            identity: Mutex::new(None),
            offline: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            outbox: outbox_tx,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(run_outbox(Arc::downgrade(&inner), outbox_rx));
        Self { inner }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_identity(&self) -> MutexGuard<'_, Option<PlayerIdentity>> {
        self.inner.identity.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Identified
    }

    /// True after a retry budget ran out, until an identity is obtained again
    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// The last identity confirmed by the relay; retained across drops
    pub fn identity(&self) -> Option<PlayerIdentity> {
        self.lock_identity().clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher<ServerMessage> {
        &self.inner.dispatcher
    }

    fn connected_identity(&self) -> Option<PlayerIdentity> {
        if self.is_connected() {
            self.identity()
        } else {
            None
        }
    }

    /// Resolves once identified, joining an in-flight attempt or starting
    /// the short retry loop, bounded by the connect timeout
    pub async fn connect(&self) -> ClientResult<PlayerIdentity> {
        if let Some(identity) = self.connected_identity() {
            return Ok(identity);
        }
        let config = &self.inner.config;
        match timeout(config.connect_timeout, self.join_or_start(config.short_retry)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("No identity from relay within {:?}", config.connect_timeout);
                Err(ClientError::ConnectionTimeout)
            }
        }
    }

    /// Long-running connect that only gives up once `policy` is spent
    pub async fn connect_with_retry(&self, policy: RetryPolicy) -> ClientResult<PlayerIdentity> {
        if let Some(identity) = self.connected_identity() {
            return Ok(identity);
        }
        self.join_or_start(policy).await
    }

    /// Waits, without starting a connection, until the session is identified.
    /// Returns `None` once the manager shuts down.
    pub async fn wait_identified(&self) -> Option<PlayerIdentity> {
        let mut state = self.watch_state();
        let identified = tokio::select! {
            result = state.wait_for(|state| *state == ConnectionState::Identified) => result.is_ok(),
            _ = self.inner.shutdown.cancelled() => false,
        };
        if identified {
            self.identity()
        } else {
            None
        }
    }

    /// Queues `message` for the relay. Never fails; undeliverable messages are logged and dropped.
    pub fn send(&self, message: ClientMessage) {
        if let Err(e) = self.inner.outbox.send(message) {
            warn!("Failed to queue {}: outbox closed", e.0.kind());
        }
    }

    pub fn update_name(&self, name: &str) {
        let name = name.to_string();
        self.inner.settings.update(|settings| settings.name = name.clone());
        if let Some(identity) = self.lock_identity().as_mut() {
            identity.name = name.clone();
        }
        self.send(ClientMessage::UpdateName { name });
    }

    /// Closes the session without scheduling a reconnect
    pub fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let transport = {
            let mut slots = self.lock_slots();
            slots.attempt = None;
            slots.transport.take()
        };
        if let Some(transport) = transport {
            info!("Disconnecting from relay");
            transport.close();
        }
        self.inner.dispatcher.fail_pending();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Disconnects and stops every background task for good
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.disconnect();
    }

    async fn join_or_start(&self, policy: RetryPolicy) -> ClientResult<PlayerIdentity> {
        let attempt = {
            let mut slots = self.lock_slots();
            match &slots.attempt {
                // A finished attempt still in the slot is history, not in flight
                Some((_, attempt)) if attempt.peek().is_none() => {
                    debug!("Joining in-flight connection attempt");
                    attempt.clone()
                }
                _ => {
                    slots.next_attempt += 1;
                    let attempt_id = slots.next_attempt;
                    let manager = self.clone();
                    let attempt = async move { manager.retry_loop(policy, attempt_id).await }
                        .boxed()
                        .shared();
                    slots.attempt = Some((attempt_id, attempt.clone()));

                    // Drive the loop even if every caller stops waiting on it
                    let driver = attempt.clone();
                    tokio::spawn(async move {
                        let _ = driver.await;
                    });
                    attempt
                }
            }
        };
        attempt.await
    }

    async fn retry_loop(self, policy: RetryPolicy, attempt_id: u64) -> ClientResult<PlayerIdentity> {
        let result = self.run_attempts(policy).await;
        {
            let mut slots = self.lock_slots();
            if slots
                .attempt
                .as_ref()
                .is_some_and(|(id, _)| *id == attempt_id)
            {
                slots.attempt = None;
            }
        }
        result
    }

    fn is_stopped(&self, epoch: u64) -> bool {
        self.inner.shutdown.is_cancelled() || self.inner.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn run_attempts(&self, policy: RetryPolicy) -> ClientResult<PlayerIdentity> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        for attempt in 1..=policy.max_attempts {
            if self.is_stopped(epoch) {
                return Err(ClientError::ConnectionClosed);
            }
            if let Some(identity) = self.connected_identity() {
                return Ok(identity);
            }

            match self.open_session(epoch).await {
                Ok(identity) => return Ok(identity),
                Err(e) => debug!(
                    "Connection attempt {}/{} failed: {}",
                    attempt, policy.max_attempts, e
                ),
            }

            if attempt < policy.max_attempts {
                self.set_state(ConnectionState::Reconnecting);
                tokio::select! {
                    _ = sleep(policy.interval) => {}
                    _ = self.inner.shutdown.cancelled() => return Err(ClientError::ConnectionClosed),
                }
            }
        }

        if self.is_stopped(epoch) {
            return Err(ClientError::ConnectionClosed);
        }
        warn!(
            "Relay unreachable after {} attempts, working offline",
            policy.max_attempts
        );
        self.inner.offline.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        Err(ClientError::ConnectionExhausted {
            attempts: policy.max_attempts,
        })
    }

    /// Opens one transport and waits for the relay to hand over an identity
    async fn open_session(&self, epoch: u64) -> ClientResult<PlayerIdentity> {
        let config = &self.inner.config;
        self.set_state(ConnectionState::Connecting);

        let (ws_stream, _) = timeout(
            config.handshake_timeout,
            connect_async(config.relay_url.as_str()),
        )
        .await
        .map_err(|_| ClientError::ConnectionTimeout)??;
        let (ws_sink, ws_stream) = ws_stream.split();

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (identity_tx, identity_rx) = oneshot::channel();

        let generation = {
            let mut slots = self.lock_slots();
            if self.is_stopped(epoch) {
                return Err(ClientError::ConnectionClosed);
            }
            if let Some(stale) = slots.transport.take() {
                stale.close();
            }
            slots.next_generation += 1;
            let generation = slots.next_generation;
            slots.transport = Some(Transport {
                generation,
                outgoing: outgoing_tx,
                handshake_started: false,
                identity_resolved: false,
                fallback_requested: false,
                identity_tx: Some(identity_tx),
            });
            generation
        };
        self.set_state(ConnectionState::Handshaking);
        debug!("Transport {} open to {}", generation, config.relay_url);

        tokio::spawn(write_loop(ws_sink, outgoing_rx, self.inner.shutdown.clone()));
        tokio::spawn(read_loop(Arc::downgrade(&self.inner), generation, ws_stream));

        match timeout(config.handshake_timeout, identity_rx).await {
            Ok(Ok(identity)) => Ok(identity),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                warn!(
                    "No identity on transport {} within {:?}",
                    generation, config.handshake_timeout
                );
                self.drop_transport(generation);
                Err(ClientError::ConnectionTimeout)
            }
        }
    }

    fn drop_transport(&self, generation: u64) {
        let transport = {
            let mut slots = self.lock_slots();
            if slots.current(generation).is_some() {
                slots.transport.take()
            } else {
                None
            }
        };
        if let Some(transport) = transport {
            transport.close();
            self.inner.dispatcher.fail_pending();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_slots().current(generation).is_some()
    }

    fn handle_frame(&self, generation: u64, text: &str) {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(kind)) => {
                debug!("Ignoring unknown message type {}", kind);
                return;
            }
            Err(e) => {
                warn!("Failed to decode frame from relay: {}", e);
                return;
            }
        };

        if !self.is_current(generation) {
            debug!("Ignoring {:?} from closed transport {}", message.tag(), generation);
            return;
        }

        // Handshake bookkeeping happens before any subscriber sees the message
        match &message {
            ServerMessage::ConnectionEstablished {} => self.on_established(generation),
            ServerMessage::IdAssigned { player_id } | ServerMessage::Reconnected { player_id } => {
                self.on_identity(generation, player_id)
            }
            ServerMessage::InvalidId {} => self.on_invalid_id(generation),
            _ => {}
        }

        self.inner.dispatcher.publish(&message);
    }

    fn on_established(&self, generation: u64) {
        let settings = &self.inner.settings;
        let request = match settings.player_id() {
            Some(player_id) if player_id.is_well_formed() => ClientMessage::Reconnect {
                player_id,
                name: settings.name(),
            },
            _ => ClientMessage::RequestId {
                name: settings.name(),
            },
        };

        let mut slots = self.lock_slots();
        let Some(transport) = slots.current_mut(generation) else {
            return;
        };
        if transport.handshake_started {
            debug!(
                "Ignoring duplicate connection:established on transport {}",
                generation
            );
            return;
        }
        transport.handshake_started = true;
        debug!("Sending {} on transport {}", request.kind(), generation);
        if let Err(e) = transport.push(&request) {
            warn!("Failed to send {}: {}", request.kind(), e);
        }
    }

    fn on_identity(&self, generation: u64, player_id: &PlayerId) {
        let identity_tx = {
            let mut slots = self.lock_slots();
            let Some(transport) = slots.current_mut(generation) else {
                return;
            };
            if transport.identity_resolved {
                debug!(
                    "Ignoring duplicate identity confirmation on transport {}",
                    generation
                );
                return;
            }
            transport.identity_resolved = true;
            transport.identity_tx.take()
        };

        let settings = &self.inner.settings;
        if settings.player_id().as_ref() != Some(player_id) {
            settings.set_player_id(Some(player_id.clone()));
        }
        let identity = PlayerIdentity {
            id: player_id.clone(),
            name: settings.name(),
        };
        *self.lock_identity() = Some(identity.clone());
        self.inner.offline.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Identified);
        info!("Identified with relay as {}", identity.id);

        if let Some(identity_tx) = identity_tx {
            let _ = identity_tx.send(identity);
        }
    }

    fn on_invalid_id(&self, generation: u64) {
        {
            let mut slots = self.lock_slots();
            let Some(transport) = slots.current_mut(generation) else {
                return;
            };
            // Only the first rejection before an identity arrives counts
            if transport.identity_resolved || transport.fallback_requested {
                debug!(
                    "Ignoring player:invalid_id on transport {} after the handshake moved on",
                    generation
                );
                return;
            }
            transport.fallback_requested = true;
        }

        warn!("Relay rejected the stored player id, requesting a new one");
        let settings = &self.inner.settings;
        settings.set_player_id(None);
        *self.lock_identity() = None;
        let request = ClientMessage::RequestId {
            name: settings.name(),
        };

        let slots = self.lock_slots();
        let Some(transport) = slots.current(generation) else {
            return;
        };
        if let Err(e) = transport.push(&request) {
            warn!("Failed to send {}: {}", request.kind(), e);
        }
    }

    fn on_transport_closed(&self, generation: u64) {
        let transport = {
            let mut slots = self.lock_slots();
            if slots.current(generation).is_some() {
                slots.transport.take()
            } else {
                None
            }
        };
        // Explicitly closed transports were already taken out of the slot
        let Some(transport) = transport else {
            return;
        };
        self.inner.dispatcher.fail_pending();

        if transport.identity_resolved && !self.inner.shutdown.is_cancelled() {
            info!("Lost connection to relay, reconnecting");
            self.set_state(ConnectionState::Reconnecting);
            let manager = self.clone();
            tokio::spawn(async move {
                let policy = manager.inner.config.short_retry;
                if let Err(e) = manager.join_or_start(policy).await {
                    warn!("Failed to reconnect to relay: {}", e);
                }
            });
        } else {
            debug!("Transport {} closed before an identity arrived", generation);
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn write(&self, message: &ClientMessage) -> ClientResult<()> {
        let slots = self.lock_slots();
        match slots.transport.as_ref() {
            Some(transport) if transport.identity_resolved => transport.push(message),
            _ => Err(ClientError::ConnectionClosed),
        }
    }

    async fn deliver(&self, message: ClientMessage) {
        if !self.is_connected() {
            if self.is_offline() {
                warn!("Working offline, dropping {}", message.kind());
                return;
            }
            let policy = self.inner.config.short_retry;
            if let Err(e) = self.join_or_start(policy).await {
                warn!("Failed to reconnect, dropping {}: {}", message.kind(), e);
                return;
            }
        }
        match self.write(&message) {
            Ok(()) => debug!("Sent {}", message.kind()),
            Err(e) => warn!("Failed to send {}, dropping it: {}", message.kind(), e),
        }
    }
}

impl Outbound for ConnectionManager {
    fn send(&self, message: ClientMessage) {
        ConnectionManager::send(self, message);
    }
}

// Sends leave in the order they were queued; a send that has to wait for a
// reconnect holds back everything behind it.
async fn run_outbox(inner: Weak<Inner>, mut outbox: mpsc::UnboundedReceiver<ClientMessage>) {
    while let Some(message) = outbox.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        ConnectionManager { inner }.deliver(message).await;
    }
}

async fn write_loop<K>(
    mut ws_sink: K,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
) where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let message = tokio::select! {
            message = outgoing.recv() => message,
            _ = shutdown.cancelled() => None,
        };
        let Some(message) = message else {
            break;
        };
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = ws_sink.send(message).await {
            warn!("Failed to write to relay: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = ws_sink.close().await;
}

async fn read_loop<S>(inner: Weak<Inner>, generation: u64, mut ws_stream: S)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = ws_stream.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = ConnectionManager { inner };
        match frame {
            Ok(Message::Text(text)) => manager.handle_frame(generation, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Transport {} read failed: {}", generation, e);
                break;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        ConnectionManager { inner }.on_transport_closed(generation);
    }
}
