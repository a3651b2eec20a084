use thiserror::Error;

use crate::{protocol::DecodeError, session::SessionId};

/// Request failures. The `Display` text is what the originating client sees
/// in its `error` message.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("user was not in a room")]
    NotInRoom,
    #[error("user {0} is not on the server")]
    TargetNotFound(String),
    #[error("room {0} does not exist")]
    RoomNotFound(String),
    #[error(transparent)]
    Malformed(#[from] DecodeError),
    /// The acting session has already been disconnected. Never reported to
    /// a client.
    #[error("session {0} is no longer connected")]
    UnknownSession(SessionId),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("relay is shutting down")]
    ShuttingDown,
}
