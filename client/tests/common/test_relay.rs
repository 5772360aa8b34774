use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use ::common::{ClientMessage, PlayerId, PlayerSummary, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the relay treats the next connections it accepts
#[derive(Debug, Clone, Default)]
pub struct RelayBehavior {
    /// Send `connection:established` twice on every new socket
    pub duplicate_established: bool,
    /// Accept sockets but never send `connection:established`
    pub silent: bool,
    /// Answer an unknown `player:reconnect` with two `player:invalid_id` frames
    pub duplicate_invalid_id: bool,
    /// Answer to `players:search` and `players:nearby`; `None` leaves them unanswered
    pub search_results: Option<Vec<PlayerSummary>>,
}

struct Session {
    player_id: Option<PlayerId>,
    name: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct RelayState {
    behavior: Mutex<RelayBehavior>,
    next_id: AtomicU64,
    known_ids: Mutex<HashSet<PlayerId>>,
    sessions: Mutex<HashMap<usize, Session>>,
    received: Mutex<Vec<ClientMessage>>,
    connections: AtomicUsize,
}

impl RelayState {
    fn send_to_connection(&self, conn_id: usize, message: &ServerMessage) {
        let sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&conn_id) {
            send_frame(&session.tx, message);
        }
    }

    // Most recent session of a player wins; an older one may still be closing
    fn send_to_player(&self, player_id: &PlayerId, message: &ServerMessage) {
        let sessions = self.sessions.lock().unwrap();
        let target = sessions
            .iter()
            .filter(|(_, session)| session.player_id.as_ref() == Some(player_id))
            .max_by_key(|(conn_id, _)| **conn_id);
        match target {
            Some((_, session)) => send_frame(&session.tx, message),
            None => debug!("Relay has no session for {}", player_id),
        }
    }

    fn session_identity(&self, conn_id: usize) -> Option<(PlayerId, String)> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&conn_id)?;
        Some((session.player_id.clone()?, session.name.clone()))
    }

    fn player_name(&self, player_id: &PlayerId) -> String {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .find(|session| session.player_id.as_ref() == Some(player_id))
            .map(|session| session.name.clone())
            .unwrap_or_default()
    }

    fn bind(&self, conn_id: usize, player_id: &PlayerId, name: &str) {
        self.known_ids.lock().unwrap().insert(player_id.clone());
        if let Some(session) = self.sessions.lock().unwrap().get_mut(&conn_id) {
            session.player_id = Some(player_id.clone());
            session.name = name.to_string();
        }
    }

    fn handle(&self, conn_id: usize, text: &str) {
        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Relay failed to decode client frame: {}", e);
                return;
            }
        };
        debug!("Relay received {} on connection {}", message.kind(), conn_id);
        self.received.lock().unwrap().push(message.clone());

        match message {
            ClientMessage::RequestId { name } => {
                let player_id =
                    PlayerId::from(self.next_id.fetch_add(1, Ordering::SeqCst).to_string().as_str());
                self.bind(conn_id, &player_id, &name);
                self.send_to_connection(conn_id, &ServerMessage::IdAssigned { player_id });
            }
            ClientMessage::Reconnect { player_id, name } => {
                let known = self.known_ids.lock().unwrap().contains(&player_id);
                if known {
                    self.bind(conn_id, &player_id, &name);
                    self.send_to_connection(conn_id, &ServerMessage::Reconnected { player_id });
                } else {
                    self.send_to_connection(conn_id, &ServerMessage::InvalidId {});
                    if self.behavior.lock().unwrap().duplicate_invalid_id {
                        self.send_to_connection(conn_id, &ServerMessage::InvalidId {});
                    }
                }
            }
            ClientMessage::UpdateName { name } => {
                if let Some(session) = self.sessions.lock().unwrap().get_mut(&conn_id) {
                    session.name = name;
                }
            }
            ClientMessage::Search { .. } => {
                let results = self.behavior.lock().unwrap().search_results.clone();
                if let Some(players) = results {
                    self.send_to_connection(conn_id, &ServerMessage::SearchResults { players });
                }
            }
            ClientMessage::Nearby { .. } => {
                let results = self.behavior.lock().unwrap().search_results.clone();
                if let Some(players) = results {
                    self.send_to_connection(conn_id, &ServerMessage::NearbyResults { players });
                }
            }
            ClientMessage::StartGame {
                opponent_id,
                win_threshold,
            } => {
                let Some((player_id, name)) = self.session_identity(conn_id) else {
                    return;
                };
                let win_threshold = win_threshold.map(|threshold| threshold as f64);
                self.send_to_connection(
                    conn_id,
                    &ServerMessage::AutoJoined {
                        opponent_id: opponent_id.clone(),
                        opponent_name: self.player_name(&opponent_id),
                        win_threshold,
                    },
                );
                self.send_to_player(
                    &opponent_id,
                    &ServerMessage::AutoJoined {
                        opponent_id: player_id,
                        opponent_name: name,
                        win_threshold,
                    },
                );
            }
            ClientMessage::ScoreUpdate { opponent_id, score } => {
                self.send_to_player(&opponent_id, &ServerMessage::OpponentScored { score });
            }
            ClientMessage::ApplyBrisks {
                opponent_id,
                brisk_count,
            } => {
                self.send_to_player(&opponent_id, &ServerMessage::ApplyBrisks { brisk_count });
            }
            ClientMessage::OpponentUndo {
                opponent_id,
                points,
                brisk_value,
            } => {
                self.send_to_player(
                    &opponent_id,
                    &ServerMessage::OpponentUndo {
                        points,
                        brisk_value,
                    },
                );
            }
            ClientMessage::Reset { opponent_id } => {
                let sender = self.session_identity(conn_id).map(|(player_id, _)| player_id);
                self.send_to_player(
                    &opponent_id,
                    &ServerMessage::Reset {
                        opponent_id: sender,
                    },
                );
            }
            ClientMessage::StateUpdate { .. } | ClientMessage::UpdateLocation { .. } => {}
        }
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, message: &ServerMessage) {
    match message.encode() {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into()));
        }
        Err(e) => warn!("Relay failed to encode {:?}: {}", message.tag(), e),
    }
}

/// In-process stand-in for the relay: assigns ids from 1000, pairs players
/// on `game:start` and forwards game messages to the named opponent.
pub struct TestRelay {
    pub url: String,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TestRelay {
    pub async fn start() -> Result<Self> {
        Self::start_with(RelayBehavior::default()).await
    }

    pub async fn start_with(behavior: RelayBehavior) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(RelayState {
            behavior: Mutex::new(behavior),
            next_id: AtomicU64::new(1000),
            ..RelayState::default()
        });
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(accept_loop(listener, state.clone(), shutdown.clone()));
        info!("Test relay listening on {}", addr);

        Ok(Self {
            url: format!("ws://{}", addr),
            state,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn set_behavior(&self, behavior: RelayBehavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    /// Lets `player:reconnect` succeed for an id the relay did not assign
    pub fn register_known(&self, player_id: &str) {
        self.state
            .known_ids
            .lock()
            .unwrap()
            .insert(PlayerId::from(player_id));
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<ClientMessage> {
        self.state.received.lock().unwrap().clone()
    }

    /// Number of received messages with the given wire type
    pub fn count(&self, kind: &str) -> usize {
        self.received()
            .iter()
            .filter(|message| message.kind() == kind)
            .count()
    }

    pub fn push_to_player(&self, player_id: &PlayerId, message: &ServerMessage) {
        self.state.send_to_player(player_id, message);
    }

    /// Closes every open socket from the relay side
    pub fn drop_connections(&self) {
        let sessions = self.state.sessions.lock().unwrap();
        for session in sessions.values() {
            let _ = session.tx.send(Message::Close(None));
        }
    }

    /// Waits until a received message matches `predicate`
    pub async fn wait_for(
        &self,
        wait: Duration,
        predicate: impl Fn(&ClientMessage) -> bool,
    ) -> Result<ClientMessage> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(message) = self.received().into_iter().find(|m| predicate(m)) {
                return Ok(message);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "Relay did not receive the expected message within {:?}, got {:?}",
                    wait,
                    self.received()
                ));
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<RelayState>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };
        match accepted {
            Ok((stream, _)) => {
                let conn_id = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(serve_connection(stream, conn_id, state.clone(), shutdown.clone()));
            }
            Err(e) => warn!("Relay failed to accept connection: {}", e),
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    conn_id: usize,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("Relay failed WebSocket handshake: {}", e);
            return;
        }
    };
    let (mut ws_sink, mut ws_source) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    state.sessions.lock().unwrap().insert(
        conn_id,
        Session {
            player_id: None,
            name: String::new(),
            tx: tx.clone(),
        },
    );

    let behavior = state.behavior.lock().unwrap().clone();
    if !behavior.silent {
        send_frame(&tx, &ServerMessage::ConnectionEstablished {});
        if behavior.duplicate_established {
            send_frame(&tx, &ServerMessage::ConnectionEstablished {});
        }
    }

    loop {
        tokio::select! {
            frame = ws_source.next() => match frame {
                Some(Ok(Message::Text(text))) => state.handle(conn_id, text.as_str()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if ws_sink.send(message).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    state.sessions.lock().unwrap().remove(&conn_id);
    debug!("Relay connection {} closed", conn_id);
}
