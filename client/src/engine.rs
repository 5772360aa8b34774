use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use common::{
    BriskRules, ClientMessage, Dealer, EntryOrigin, GameHistory, MIN_WIN_THRESHOLD, Opponent,
    PlayerId, PlayerIdentity, ScoreEntry, ScoreError, ScoreKind, Snapshot, Variant,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::connection::Outbound;
use crate::snapshot_store::SnapshotSink;

const EVENT_CAPACITY: usize = 64;

/// Notifications for whatever presents the game
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    ScoreChanged { total: i64, last_three: Vec<i64> },
    Congratulations { total: i64, threshold: i64 },
    OpponentChanged(Option<Opponent>),
    OpponentScored { score: i64 },
    UndoRejected { reason: String },
    Reset { remote: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub variant: Variant,
    pub win_threshold: i64,
    pub input_debounce: Duration,
}

/// Rounds and floors a relay-supplied threshold
pub fn clamp_win_threshold(raw: f64) -> Option<i64> {
    if !raw.is_finite() {
        return None;
    }
    Some((raw.round() as i64).max(MIN_WIN_THRESHOLD))
}

/// The authoritative score state for this device.
///
/// Local input, remote instructions and restored snapshots all mutate the same
/// history. Every mutation is followed by a snapshot save and, while paired,
/// a score update carrying the new total.
pub struct ScoreEngine {
    history: GameHistory,
    opponent: Option<Opponent>,
    variant: Variant,
    rules: BriskRules,
    settings_threshold: i64,
    session_threshold: Option<i64>,
    input_debounce: TimeDelta,
    busy_until: Option<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
    outbound: Arc<dyn Outbound>,
    snapshots: Arc<dyn SnapshotSink>,
    events: broadcast::Sender<GameEvent>,
}

impl ScoreEngine {
    pub fn new(
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
        outbound: Arc<dyn Outbound>,
        snapshots: Arc<dyn SnapshotSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            history: GameHistory::new(),
            opponent: None,
            variant: settings.variant,
            rules: settings.variant.brisk_rules(),
            settings_threshold: settings.win_threshold.max(MIN_WIN_THRESHOLD),
            session_threshold: None,
            input_debounce: TimeDelta::from_std(settings.input_debounce)
                .unwrap_or_else(|_| TimeDelta::zero()),
            busy_until: None,
            clock,
            outbound,
            snapshots,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> &GameHistory {
        &self.history
    }

    pub fn total(&self) -> i64 {
        self.history.total()
    }

    pub fn last_three(&self) -> Vec<i64> {
        self.history.last_three()
    }

    pub fn dealer(&self) -> Dealer {
        self.history.dealer()
    }

    pub fn opponent(&self) -> Option<&Opponent> {
        self.opponent.as_ref()
    }

    pub fn is_paired(&self) -> bool {
        self.opponent.is_some()
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn rules(&self) -> BriskRules {
        self.rules
    }

    pub fn win_threshold(&self) -> i64 {
        self.session_threshold.unwrap_or(self.settings_threshold)
    }

    pub fn set_settings_threshold(&mut self, threshold: i64) {
        self.settings_threshold = threshold.max(MIN_WIN_THRESHOLD);
    }

    /// Threshold agreed for the current pairing; `None` falls back to settings
    pub fn set_session_threshold(&mut self, threshold: Option<i64>) {
        self.session_threshold = threshold.map(|t| t.max(MIN_WIN_THRESHOLD));
    }

    fn emit(&self, event: GameEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn opponent_id(&self) -> Option<PlayerId> {
        self.opponent.as_ref().map(|opponent| opponent.id.clone())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            history: self.history.clone(),
            opponent: self.opponent.clone(),
            last_event_at: self.clock.now(),
        }
    }

    // Rejects local input arriving inside the debounce window of the previous one
    fn claim_local_input(&mut self) -> Result<(), ScoreError> {
        let now = self.clock.now();
        if self.busy_until.is_some_and(|until| now < until) {
            debug!("Rejecting local input inside the debounce window");
            return Err(ScoreError::Busy);
        }
        self.busy_until = Some(now + self.input_debounce);
        Ok(())
    }

    /// Appends an entry and returns the new total.
    ///
    /// Local calls are debounced; remote calls always apply.
    pub fn add_points(
        &mut self,
        value: i64,
        kind: ScoreKind,
        origin: EntryOrigin,
    ) -> Result<i64, ScoreError> {
        if origin.is_local() {
            self.claim_local_input()?;
        }
        Ok(self.append(value, kind, origin))
    }

    fn append(&mut self, value: i64, kind: ScoreKind, origin: EntryOrigin) -> i64 {
        let previous_total = self.history.total();
        self.history
            .push(ScoreEntry::new(value, kind, origin, self.clock.now()));
        debug!("Applied {:?} {:?} entry of {}", origin, kind, value);
        self.after_history_change(previous_total)
    }

    /// Declares `count` brisks: this side gets `count × p`, the opponent is
    /// told to apply the complementary count
    pub fn declare_brisk(&mut self, count: u32) -> Result<i64, ScoreError> {
        let value = self.rules.points_for(count)?;
        let complement = self.rules.complement(count)?;
        self.claim_local_input()?;
        let total = self.append(value, ScoreKind::Brisk, EntryOrigin::Local);

        if let Some(opponent_id) = self.opponent_id() {
            self.outbound.send(ClientMessage::ApplyBrisks {
                opponent_id,
                brisk_count: complement,
            });
        }
        Ok(total)
    }

    /// Applies a brisk count sent by the opponent using our own per-brisk value
    pub fn apply_remote_brisks(&mut self, count: u32) -> Result<i64, ScoreError> {
        let value = self.rules.points_for(count)?;
        Ok(self.append(value, ScoreKind::Brisk, EntryOrigin::Remote))
    }

    /// Removes the last entry. Undoing a brisk while paired asks the opponent
    /// to drop their complementary brisk too.
    pub fn undo(&mut self) -> Option<ScoreEntry> {
        let last = self.history.last()?.clone();

        if last.is_brisk() {
            if let Some(opponent_id) = self.opponent_id() {
                let own_count = u32::try_from(last.value / self.rules.points_per_brisk.max(1))
                    .unwrap_or(0)
                    .min(self.rules.max_brisks);
                self.outbound.send(ClientMessage::OpponentUndo {
                    opponent_id,
                    points: last.value,
                    brisk_value: Some(self.rules.max_brisks - own_count),
                });
            }
        }

        self.pop_last()
    }

    /// Honors an opponent's undo only when our last entry has the type they
    /// claim (`brisk_value` present means a brisk)
    pub fn apply_remote_undo(&mut self, points: i64, brisk_value: Option<u32>) -> Option<ScoreEntry> {
        let claimed = if brisk_value.is_some() {
            ScoreKind::Brisk
        } else {
            ScoreKind::Point
        };

        let Some(last) = self.history.last() else {
            debug!("Ignoring remote undo on empty history");
            return None;
        };
        if last.kind != claimed {
            let reason = format!(
                "opponent undid a {:?} of {} but our last entry is a {:?} of {}",
                claimed, points, last.kind, last.value
            );
            warn!("Rejecting remote undo: {}", reason);
            self.emit(GameEvent::UndoRejected { reason });
            return None;
        }
        if let Some(count) = brisk_value {
            debug!("Remote undo of brisk count {} ({} points on their side)", count, points);
        }

        self.pop_last()
    }

    fn pop_last(&mut self) -> Option<ScoreEntry> {
        let previous_total = self.history.total();
        let removed = self.history.pop()?;
        debug!("Removed {:?} entry of {}", removed.kind, removed.value);
        self.after_history_change(previous_total);
        Some(removed)
    }

    fn after_history_change(&mut self, previous_total: i64) -> i64 {
        let total = self.history.total();

        if let Some(opponent_id) = self.opponent_id() {
            self.outbound.send(ClientMessage::ScoreUpdate {
                opponent_id,
                score: total,
            });
        }
        self.snapshots.save(self.snapshot());
        self.emit(GameEvent::ScoreChanged {
            total,
            last_three: self.history.last_three(),
        });

        let threshold = self.win_threshold();
        if previous_total < threshold && total >= threshold {
            info!("Total {} reached the win threshold {}", total, threshold);
            self.emit(GameEvent::Congratulations { total, threshold });
        }
        total
    }

    /// Starts a new hand: empty history, zero scores, same opponent.
    ///
    /// Only a local reset is forwarded to the opponent.
    pub fn reset(&mut self, origin: EntryOrigin) {
        self.history = GameHistory::new();
        self.busy_until = None;
        if let Some(opponent) = self.opponent.as_mut() {
            opponent.score = 0;
        }
        self.snapshots.clear();

        if origin.is_local() {
            if let Some(opponent_id) = self.opponent_id() {
                self.outbound.send(ClientMessage::Reset {
                    opponent_id: opponent_id.clone(),
                });
                self.outbound.send(ClientMessage::ScoreUpdate {
                    opponent_id,
                    score: 0,
                });
            }
        }

        info!(
            "Game reset ({})",
            if origin.is_local() { "local" } else { "remote" }
        );
        self.emit(GameEvent::ScoreChanged {
            total: 0,
            last_three: Vec::new(),
        });
        self.emit(GameEvent::Reset {
            remote: !origin.is_local(),
        });
    }

    /// Replaces the pairing wholesale
    pub fn set_current_opponent(&mut self, opponent: Option<Opponent>) {
        if opponent.is_none() {
            self.session_threshold = None;
        }
        match &opponent {
            Some(opponent) => info!("Paired with {} ({})", opponent.name, opponent.id),
            None if self.opponent.is_some() => info!("Pairing ended"),
            None => {}
        }
        self.opponent = opponent;
        self.snapshots.save(self.snapshot());
        self.emit(GameEvent::OpponentChanged(self.opponent.clone()));
    }

    /// Mirrors the opponent's authoritative total
    pub fn update_opponent_score(&mut self, score: i64) {
        let Some(opponent) = self.opponent.as_mut() else {
            debug!("Ignoring opponent score {} while solo", score);
            return;
        };
        opponent.score = score;
        self.snapshots.save(self.snapshot());
        self.emit(GameEvent::OpponentScored { score });
    }

    pub fn rename_opponent(&mut self, id: &PlayerId, name: &str) -> bool {
        match self.opponent.as_mut() {
            Some(opponent) if &opponent.id == id => {
                opponent.name = name.to_string();
                opponent.is_online = true;
            }
            _ => return false,
        }
        self.emit(GameEvent::OpponentChanged(self.opponent.clone()));
        true
    }

    pub fn set_opponent_online(&mut self, is_online: bool) {
        let changed = match self.opponent.as_mut() {
            Some(opponent) if opponent.is_online != is_online => {
                opponent.is_online = is_online;
                true
            }
            _ => false,
        };
        if changed {
            self.emit(GameEvent::OpponentChanged(self.opponent.clone()));
        }
    }

    /// Loads a restored snapshot without echoing anything to the relay
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.history = snapshot.history;
        self.opponent = snapshot.opponent;
        self.emit(GameEvent::ScoreChanged {
            total: self.history.total(),
            last_three: self.history.last_three(),
        });
        self.emit(GameEvent::OpponentChanged(self.opponent.clone()));
    }

    pub fn state_update(&self, identity: &PlayerIdentity) -> ClientMessage {
        ClientMessage::StateUpdate {
            player_id: identity.id.clone(),
            name: identity.name.clone(),
            history: self.history.clone(),
            total: self.history.total(),
            opponent_id: self.opponent_id(),
            location: None,
        }
    }
}
