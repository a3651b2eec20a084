use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Route the relay accepts WebSocket upgrades on.
pub const CONNECT_PATH: &str = "/chatserver/connect";

/// Tag carried by every system message in both directions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Connection,
    Join,
    Leave,
    Error,
    PrivateMessage,
    RoomMessage,
    Rooms,
    Participants,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Connection => "connection",
            Action::Join => "join",
            Action::Leave => "leave",
            Action::Error => "error",
            Action::PrivateMessage => "private_message",
            Action::RoomMessage => "room_message",
            Action::Rooms => "rooms",
            Action::Participants => "participants",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON envelope exchanged with clients. One envelope per text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<String>>,
}

impl SystemMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            user_id: None,
            room: None,
            message: None,
            rooms: None,
            participants: None,
        }
    }

    pub fn with_user(mut self, user_id: impl ToString) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_rooms(mut self, rooms: Vec<String>) -> Self {
        self.rooms = Some(rooms);
        self
    }

    pub fn with_participants<I, T>(mut self, participants: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        self.participants = Some(participants.into_iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Action::Error).with_message(message)
    }
}

/// An inbound client action after validation. Server-only actions never
/// make it this far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Join { room: String },
    Leave,
    PrivateMessage { target: String, body: String },
    RoomMessage { body: String },
    Rooms,
    Participants { room: String },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed message: binary frames are not supported")]
    BinaryFrame,
    #[error("malformed message: `{0}` cannot be sent by clients")]
    ServerOnly(Action),
    #[error("malformed message: `{action}` requires a non-empty `{field}`")]
    MissingField {
        action: Action,
        field: &'static str,
    },
}

impl TryFrom<SystemMessage> for Request {
    type Error = DecodeError;

    fn try_from(message: SystemMessage) -> Result<Self, Self::Error> {
        let action = message.action;
        let require = |value: Option<String>, field: &'static str| {
            value
                .filter(|v| !v.is_empty())
                .ok_or(DecodeError::MissingField { action, field })
        };

        match action {
            Action::Join => Ok(Request::Join {
                room: require(message.room, "room")?,
            }),
            Action::Leave => Ok(Request::Leave),
            Action::PrivateMessage => Ok(Request::PrivateMessage {
                target: require(message.user_id, "user_id")?,
                body: require(message.message, "message")?,
            }),
            Action::RoomMessage => Ok(Request::RoomMessage {
                body: require(message.message, "message")?,
            }),
            Action::Rooms => Ok(Request::Rooms),
            Action::Participants => Ok(Request::Participants {
                room: require(message.room, "room")?,
            }),
            Action::Connection | Action::Error => Err(DecodeError::ServerOnly(action)),
        }
    }
}

/// Decodes one text frame into a request.
pub fn decode(frame: &str) -> Result<Request, DecodeError> {
    let message: SystemMessage = serde_json::from_str(frame)?;
    Request::try_from(message)
}

pub fn encode(message: &SystemMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
