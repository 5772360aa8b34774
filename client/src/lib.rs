pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod game_server;
pub mod invite;
pub mod snapshot_store;
pub mod storage;

pub use config::{ClientConfig, RetryPolicy};
pub use connection::{ConnectionManager, ConnectionState, Outbound};
pub use engine::{GameEvent, ScoreEngine};
pub use error::{ClientError, ClientResult};
pub use game_server::GameServer;
