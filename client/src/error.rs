use common::ProtocolError;
use thiserror::Error;

/// Failures surfaced by the connection and facade layers.
///
/// `Clone` because one in-flight connection attempt is awaited by every caller
/// that joined it, and each of them receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("no identity from the relay within the connect timeout")]
    ConnectionTimeout,
    #[error("relay unreachable after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },
    #[error("timed out waiting for {what}")]
    RequestTimeout { what: &'static str },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid player id: {0:?}")]
    InvalidPlayerId(String),
    #[error("an invite link cannot point at this player")]
    SelfInvite,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("no player identity yet")]
    NotIdentified,
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
