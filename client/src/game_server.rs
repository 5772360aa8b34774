use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Result;
use common::{
    ClientMessage, Dealer, EntryOrigin, GameHistory, Location, Opponent, PlayerId, PlayerIdentity,
    PlayerSummary, ScoreEntry, ScoreError, ScoreKind, ServerMessage, ServerTag,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::dispatcher::{Dispatcher, SubscriptionId};
use crate::engine::{EngineSettings, GameEvent, ScoreEngine, clamp_win_threshold};
use crate::error::{ClientError, ClientResult};
use crate::invite::{invite_link, parse_invite};
use crate::snapshot_store::{SnapshotStore, SnapshotWriter};
use crate::storage::{FileStorage, PlayerSettings, SettingsStore, Storage};

pub const DEFAULT_NEARBY_RADIUS_KM: f64 = 5.0;

type SharedEngine = Arc<Mutex<ScoreEngine>>;

fn lock(engine: &Mutex<ScoreEngine>) -> MutexGuard<'_, ScoreEngine> {
    engine.lock().unwrap_or_else(|e| e.into_inner())
}

/// The surface the UI talks to: scoring, pairing, search and invites on top
/// of one relay connection.
pub struct GameServer {
    config: ClientConfig,
    settings: Arc<SettingsStore>,
    dispatcher: Dispatcher<ServerMessage>,
    connection: ConnectionManager,
    engine: SharedEngine,
    snapshots: SnapshotWriter,
    online: Arc<Mutex<Vec<PlayerSummary>>>,
    subscriptions: Vec<SubscriptionId>,
}

impl GameServer {
    /// File-backed storage under `config.data_dir` and the system clock
    pub fn open(config: ClientConfig) -> Result<Self> {
        let storage = FileStorage::new(&config.data_dir)?;
        Ok(Self::start(config, Arc::new(storage), Arc::new(SystemClock)))
    }

    /// Restores any fresh snapshot, wires the protocol handlers and starts
    /// connecting in the background. Must be called inside a Tokio runtime.
    pub fn start(config: ClientConfig, storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        let settings = Arc::new(SettingsStore::load(storage.clone()));
        let player = settings.get();
        let dispatcher = Dispatcher::new();
        let connection =
            ConnectionManager::new(config.clone(), settings.clone(), dispatcher.clone());

        let store = SnapshotStore::new(storage, config.snapshot_ttl);
        let restored = store.load(clock.now());
        let snapshots = SnapshotWriter::spawn(store, config.snapshot_debounce);

        let mut engine = ScoreEngine::new(
            EngineSettings {
                variant: player.variant,
                win_threshold: player.effective_win_threshold(),
                input_debounce: config.local_input_debounce,
            },
            clock,
            Arc::new(connection.clone()),
            Arc::new(snapshots.clone()),
        );
        let has_restored_state = restored.is_some();
        if let Some(snapshot) = restored {
            engine.restore(snapshot);
        }
        let engine = Arc::new(Mutex::new(engine));

        let online = Arc::new(Mutex::new(Vec::new()));
        let subscriptions = register_handlers(&dispatcher, Arc::downgrade(&engine), online.clone());

        let server = Self {
            config,
            settings,
            dispatcher,
            connection,
            engine,
            snapshots,
            online,
            subscriptions,
        };
        if has_restored_state {
            server.announce_restored_state();
        }
        server.connect_in_background();
        server
    }

    fn engine(&self) -> MutexGuard<'_, ScoreEngine> {
        lock(&self.engine)
    }

    // The relay learns about a restored hand once, as soon as we are identified
    fn announce_restored_state(&self) {
        let connection = self.connection.clone();
        let engine = Arc::downgrade(&self.engine);
        tokio::spawn(async move {
            let Some(identity) = connection.wait_identified().await else {
                return;
            };
            let Some(engine) = engine.upgrade() else {
                return;
            };
            let message = lock(&engine).state_update(&identity);
            info!("Announcing restored game state to relay");
            connection.send(message);
        });
    }

    fn connect_in_background(&self) {
        let connection = self.connection.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.connect().await {
                warn!("Failed to connect to relay, playing offline for now: {}", e);
            }
        });
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub async fn connect(&self) -> ClientResult<PlayerIdentity> {
        self.connection.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn identity(&self) -> Option<PlayerIdentity> {
        self.connection.identity()
    }

    pub fn settings(&self) -> PlayerSettings {
        self.settings.get()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GameEvent> {
        self.engine().subscribe()
    }

    pub fn total(&self) -> i64 {
        self.engine().total()
    }

    pub fn history(&self) -> GameHistory {
        self.engine().history().clone()
    }

    pub fn last_three(&self) -> Vec<i64> {
        self.engine().last_three()
    }

    pub fn dealer(&self) -> Dealer {
        self.engine().dealer()
    }

    pub fn opponent(&self) -> Option<Opponent> {
        self.engine().opponent().cloned()
    }

    pub fn win_threshold(&self) -> i64 {
        self.engine().win_threshold()
    }

    pub fn point_values(&self) -> &'static [i64] {
        self.engine().variant().point_values()
    }

    /// Latest `players:list` presence snapshot from the relay
    pub fn online_players(&self) -> Vec<PlayerSummary> {
        self.online
            .lock()
            .map(|players| players.clone())
            .unwrap_or_default()
    }

    pub fn add_points(&self, value: i64) -> Result<i64, ScoreError> {
        self.engine()
            .add_points(value, ScoreKind::Point, EntryOrigin::Local)
    }

    pub fn declare_brisk(&self, count: u32) -> Result<i64, ScoreError> {
        self.engine().declare_brisk(count)
    }

    pub fn undo(&self) -> Option<ScoreEntry> {
        self.engine().undo()
    }

    /// Resets the hand. `confirm` is asked only when `skip_confirm` is false.
    /// Returns whether the reset happened.
    pub fn reset(&self, skip_confirm: bool, confirm: impl FnOnce() -> bool) -> bool {
        if !skip_confirm && !confirm() {
            debug!("Reset not confirmed");
            return false;
        }
        self.engine().reset(EntryOrigin::Local);
        true
    }

    pub fn set_win_threshold(&self, threshold: i64) {
        let settings = self
            .settings
            .update(|settings| settings.win_threshold = threshold);
        self.engine()
            .set_settings_threshold(settings.effective_win_threshold());
    }

    pub fn update_name(&self, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            warn!("Ignoring empty player name");
            return;
        }
        self.connection.update_name(name);
    }

    pub fn update_location(&self, location: Location) {
        self.connection.send(ClientMessage::UpdateLocation {
            latitude: location.latitude,
            longitude: location.longitude,
        });
    }

    pub async fn search_players(&self, term: &str) -> ClientResult<Vec<PlayerSummary>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        self.connection.connect().await?;

        let connection = self.connection.clone();
        let search_term = term.to_string();
        let response = self
            .dispatcher
            .request(
                ServerTag::SearchResults,
                move || connection.send(ClientMessage::Search { search_term }),
                self.config.request_timeout,
                "search results",
            )
            .await?;
        match response {
            ServerMessage::SearchResults { players } => Ok(players),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn nearby_players(
        &self,
        location: Location,
        radius_km: Option<f64>,
    ) -> ClientResult<Vec<PlayerSummary>> {
        self.connection.connect().await?;

        let connection = self.connection.clone();
        let radius_km = radius_km.unwrap_or(DEFAULT_NEARBY_RADIUS_KM);
        let response = self
            .dispatcher
            .request(
                ServerTag::NearbyResults,
                move || {
                    connection.send(ClientMessage::Nearby {
                        latitude: location.latitude,
                        longitude: location.longitude,
                        radius_km,
                    })
                },
                self.config.request_timeout,
                "nearby results",
            )
            .await?;
        match response {
            ServerMessage::NearbyResults { players } => Ok(players),
            _ => Ok(Vec::new()),
        }
    }

    /// Asks the relay to pair us with `opponent_id`. The pairing itself
    /// arrives as `game:auto_joined`.
    pub async fn start_game(&self, opponent_id: &PlayerId) -> ClientResult<()> {
        if !opponent_id.is_well_formed() {
            return Err(ClientError::InvalidPlayerId(opponent_id.to_string()));
        }
        let identity = self.connection.connect().await?;
        self.request_pairing(&identity, opponent_id)
    }

    fn request_pairing(&self, identity: &PlayerIdentity, opponent_id: &PlayerId) -> ClientResult<()> {
        if &identity.id == opponent_id {
            return Err(ClientError::SelfInvite);
        }
        let threshold = self.settings.get().effective_win_threshold();
        self.engine().set_session_threshold(Some(threshold));
        info!("Requesting a game with {}", opponent_id);
        self.connection.send(ClientMessage::StartGame {
            opponent_id: opponent_id.clone(),
            win_threshold: Some(threshold),
        });
        Ok(())
    }

    pub fn invite_link(&self, base: &str) -> ClientResult<String> {
        let identity = self.connection.identity().ok_or(ClientError::NotIdentified)?;
        invite_link(base, &identity.id)
    }

    /// Pairs with the player an invite link points at and returns the link
    /// with the invite parameter removed
    pub async fn accept_invite(&self, url: &str) -> ClientResult<String> {
        let invite = parse_invite(url)?;
        let Some(inviter) = invite.inviter else {
            debug!("No usable invite in {}", url);
            return Ok(invite.cleaned_url);
        };

        let known_id = self
            .connection
            .identity()
            .map(|identity| identity.id)
            .or_else(|| self.settings.player_id());
        if known_id.as_ref() == Some(&inviter) {
            return Err(ClientError::SelfInvite);
        }

        let identity = self
            .connection
            .connect_with_retry(self.config.long_retry)
            .await?;
        self.request_pairing(&identity, &inviter)?;
        Ok(invite.cleaned_url)
    }

    /// Leaves the pairing and closes the relay session without reconnecting
    pub fn disconnect(&self) {
        self.engine().set_current_opponent(None);
        self.connection.disconnect();
    }

    /// Writes any pending snapshot and stops the connection
    pub async fn shutdown(&self) {
        self.snapshots.flush().await;
        self.connection.shutdown();
    }

    pub async fn flush_snapshot(&self) {
        self.snapshots.flush().await;
    }
}

impl Drop for GameServer {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.dispatcher.unsubscribe(id);
        }
        self.connection.shutdown();
    }
}

fn with_engine(
    engine: &Weak<Mutex<ScoreEngine>>,
    apply: impl FnOnce(&mut ScoreEngine) -> Result<()>,
) -> Result<()> {
    match engine.upgrade() {
        Some(engine) => apply(&mut lock(&engine)),
        None => Ok(()),
    }
}

fn register_handlers(
    dispatcher: &Dispatcher<ServerMessage>,
    engine: Weak<Mutex<ScoreEngine>>,
    online: Arc<Mutex<Vec<PlayerSummary>>>,
) -> Vec<SubscriptionId> {
    let mut subscriptions = Vec::new();

    let weak = engine.clone();
    subscriptions.push(dispatcher.subscribe(ServerTag::AutoJoined, move |message| {
        let ServerMessage::AutoJoined {
            opponent_id,
            opponent_name,
            win_threshold,
        } = message
        else {
            return Ok(());
        };
        with_engine(&weak, |engine| {
            engine.set_current_opponent(Some(Opponent::new(
                opponent_id.clone(),
                opponent_name.clone(),
            )));
            if let Some(threshold) = win_threshold.and_then(clamp_win_threshold) {
                engine.set_session_threshold(Some(threshold));
            }
            Ok(())
        })
    }));

    let weak = engine.clone();
    subscriptions.push(dispatcher.subscribe(ServerTag::Resume, move |message| {
        let ServerMessage::Resume {
            opponent_id,
            opponent_name,
            game_state,
            win_threshold,
        } = message
        else {
            return Ok(());
        };
        with_engine(&weak, |engine| {
            let mut opponent = Opponent::new(opponent_id.clone(), opponent_name.clone());
            if let Some(total) = game_state.as_ref().and_then(|state| state.total) {
                opponent.score = total;
            }
            engine.set_current_opponent(Some(opponent));

            let threshold = win_threshold
                .or_else(|| game_state.as_ref().and_then(|state| state.win_threshold))
                .and_then(clamp_win_threshold);
            if let Some(threshold) = threshold {
                engine.set_session_threshold(Some(threshold));
            }
            Ok(())
        })
    }));

    let weak = engine.clone();
    subscriptions.push(dispatcher.subscribe(ServerTag::OpponentScored, move |message| {
        let ServerMessage::OpponentScored { score } = message else {
            return Ok(());
        };
        with_engine(&weak, |engine| {
            engine.update_opponent_score(*score);
            Ok(())
        })
    }));

    let weak = engine.clone();
    subscriptions.push(dispatcher.subscribe(ServerTag::ApplyBrisks, move |message| {
        let ServerMessage::ApplyBrisks { brisk_count } = message else {
            return Ok(());
        };
        with_engine(&weak, |engine| {
            engine.apply_remote_brisks(*brisk_count)?;
            Ok(())
        })
    }));

    let weak = engine.clone();
    subscriptions.push(dispatcher.subscribe(ServerTag::OpponentUndo, move |message| {
        let ServerMessage::OpponentUndo {
            points,
            brisk_value,
        } = message
        else {
            return Ok(());
        };
        with_engine(&weak, |engine| {
            engine.apply_remote_undo(*points, *brisk_value);
            Ok(())
        })
    }));

    let weak = engine.clone();
    subscriptions.push(dispatcher.subscribe(ServerTag::Reset, move |_| {
        with_engine(&weak, |engine| {
            engine.reset(EntryOrigin::Remote);
            Ok(())
        })
    }));

    let weak = engine.clone();
    subscriptions.push(dispatcher.subscribe(ServerTag::NameChanged, move |message| {
        let ServerMessage::NameChanged { player_id, name } = message else {
            return Ok(());
        };
        with_engine(&weak, |engine| {
            if engine.rename_opponent(player_id, name) {
                info!("Opponent is now called {}", name);
            }
            Ok(())
        })
    }));

    let weak = engine;
    subscriptions.push(dispatcher.subscribe(ServerTag::PlayersList, move |message| {
        let ServerMessage::PlayersList { players } = message else {
            return Ok(());
        };
        *online.lock().unwrap_or_else(|e| e.into_inner()) = players.clone();
        with_engine(&weak, |engine| {
            let opponent_id = engine.opponent().map(|opponent| opponent.id.clone());
            if let Some(opponent_id) = opponent_id {
                let is_online = players.iter().any(|player| player.id == opponent_id);
                engine.set_opponent_online(is_online);
            }
            Ok(())
        })
    }));

    subscriptions
}
