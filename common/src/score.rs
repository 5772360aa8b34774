use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    Point,
    Brisk,
}

/// Which device produced an entry. Remote entries were appended on an opponent's instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryOrigin {
    #[default]
    Local,
    Remote,
}

impl EntryOrigin {
    pub fn is_local(&self) -> bool {
        matches!(self, EntryOrigin::Local)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub value: i64,
    #[serde(rename = "type")]
    pub kind: ScoreKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "EntryOrigin::is_local")]
    pub origin: EntryOrigin,
}

impl ScoreEntry {
    pub fn new(value: i64, kind: ScoreKind, origin: EntryOrigin, timestamp: DateTime<Utc>) -> Self {
        ScoreEntry {
            value,
            kind,
            timestamp,
            origin,
        }
    }

    pub fn is_brisk(&self) -> bool {
        self.kind == ScoreKind::Brisk
    }
}

/// Who deals the next hand, as shown next to the opponent's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dealer {
    #[default]
    Neutral,
    Me,
    Opponent,
}

/// Append-only sequence of score entries. The total is always the sum over
/// the entries, never a separately maintained counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameHistory(Vec<ScoreEntry>);

impl GameHistory {
    pub fn new() -> Self {
        GameHistory(Vec::new())
    }

    pub fn push(&mut self, entry: ScoreEntry) {
        self.0.push(entry);
    }

    pub fn pop(&mut self) -> Option<ScoreEntry> {
        self.0.pop()
    }

    pub fn last(&self) -> Option<&ScoreEntry> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[ScoreEntry] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoreEntry> {
        self.0.iter()
    }

    pub fn total(&self) -> i64 {
        self.0.iter().map(|entry| entry.value).sum()
    }

    /// Values of the most recent (up to three) entries, oldest first
    pub fn last_three(&self) -> Vec<i64> {
        let start = self.0.len().saturating_sub(3);
        self.0[start..].iter().map(|entry| entry.value).collect()
    }

    pub fn has_brisk(&self) -> bool {
        self.0.iter().any(ScoreEntry::is_brisk)
    }

    /// The dealer follows the most recent brisk still in history: a brisk we
    /// declared hands the deal to the opponent, one they declared hands it to us.
    pub fn dealer(&self) -> Dealer {
        match self.0.iter().rev().find(|entry| entry.is_brisk()) {
            Some(entry) if entry.origin.is_local() => Dealer::Opponent,
            Some(_) => Dealer::Me,
            None => Dealer::Neutral,
        }
    }
}

impl From<Vec<ScoreEntry>> for GameHistory {
    fn from(entries: Vec<ScoreEntry>) -> Self {
        GameHistory(entries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("a local score entry is still being processed")]
    Busy,
    #[error("brisk count {count} is out of range (max {max})")]
    BriskOutOfRange { count: u32, max: u32 },
}
