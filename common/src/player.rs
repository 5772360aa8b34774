use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{PLAYER_ID_MAX_DIGITS, PLAYER_ID_MIN_DIGITS};

/// Relay-assigned player handle. Used for reconnection and invites.
///
/// Deserialization does not validate (frames from the relay are trusted);
/// use [`PlayerId::parse`] for anything read from storage or a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn parse(raw: &str) -> Option<PlayerId> {
        let trimmed = raw.trim();
        if is_well_formed(trimmed) {
            Some(PlayerId(trimmed.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        is_well_formed(&self.0)
    }
}

fn is_well_formed(raw: &str) -> bool {
    (PLAYER_ID_MIN_DIGITS..=PLAYER_ID_MAX_DIGITS).contains(&raw.len())
        && raw.bytes().all(|b| b.is_ascii_digit())
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(raw: &str) -> Self {
        PlayerId(raw.to_string())
    }
}

/// The identity this device holds with the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerIdentity {
    pub id: PlayerId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opponent {
    #[serde(rename = "playerID")]
    pub id: PlayerId,
    pub name: String,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub score: i64,
}

impl Opponent {
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Opponent {
            id,
            name: name.into(),
            is_online: true,
            score: 0,
        }
    }
}

/// A player as listed by search, nearby or presence results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    #[serde(rename = "playerID")]
    pub id: PlayerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}
