/// Score a player has to reach before the congratulations fire
pub const DEFAULT_WIN_THRESHOLD: i64 = 10_000;

/// Lowest win threshold a session will accept, local or negotiated
pub const MIN_WIN_THRESHOLD: i64 = 100;

/// Number of brisks in a deck; a declaration of k leaves MAX_BRISKS - k to the opponent
pub const MAX_BRISKS: u32 = 32;

/// Relay-assigned player ids are numeric strings within this length range
pub const PLAYER_ID_MIN_DIGITS: usize = 4;
pub const PLAYER_ID_MAX_DIGITS: usize = 12;

/// Snapshots older than this are discarded on load
pub const SNAPSHOT_TTL_SECS: i64 = 10 * 60;

pub const DEFAULT_PLAYER_NAME: &str = "Player";
