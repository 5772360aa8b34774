use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::SNAPSHOT_TTL_SECS;
use crate::player::Opponent;
use crate::score::GameHistory;

/// In-progress game state persisted locally so a reload can pick the hand back up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub history: GameHistory,
    pub opponent: Option<Opponent>,
    pub last_event_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn ttl() -> TimeDelta {
        TimeDelta::seconds(SNAPSHOT_TTL_SECS)
    }

    /// A snapshot exactly `ttl` old is still fresh
    pub fn is_fresh_at(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now.signed_duration_since(self.last_event_at) <= ttl
    }

    pub fn total(&self) -> i64 {
        self.history.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::{EntryOrigin, ScoreEntry, ScoreKind};

    fn snapshot_at(last_event_at: DateTime<Utc>) -> Snapshot {
        let mut history = GameHistory::new();
        history.push(ScoreEntry::new(
            100,
            ScoreKind::Point,
            EntryOrigin::Local,
            last_event_at,
        ));
        Snapshot {
            history,
            opponent: None,
            last_event_at,
        }
    }

    #[test]
    fn test_freshness_boundary() {
        let now = Utc::now();
        let ttl = Snapshot::ttl();

        assert!(snapshot_at(now - ttl).is_fresh_at(now, ttl));
        assert!(!snapshot_at(now - ttl - TimeDelta::microseconds(1)).is_fresh_at(now, ttl));
        assert!(snapshot_at(now).is_fresh_at(now, ttl));
    }

    #[test]
    fn test_wire_names() {
        let snapshot = snapshot_at(Utc::now());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("lastEventAt").is_some());
        assert!(json["history"].is_array());
        assert!(json["opponent"].is_null());
    }
}
