use std::{fmt, num::ParseIntError, str::FromStr};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::protocol::SystemMessage;

/// Sequentially assigned session identity. Shown to clients as a decimal
/// string; ordering follows connection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Session table entry: where the session currently is and how to reach it.
pub(crate) struct Session {
    pub(crate) room: Option<String>,
    outbound: Outbound,
}

impl Session {
    pub(crate) fn new(outbound: mpsc::Sender<SystemMessage>) -> Self {
        Self {
            room: None,
            outbound: Outbound {
                sender: outbound,
                dropped: 0,
            },
        }
    }

    /// Queues a message without waiting. Returns `false` if it was dropped.
    pub(crate) fn deliver(&mut self, id: SessionId, message: SystemMessage) -> bool {
        self.outbound.push(id, message)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.outbound.dropped
    }
}

struct Outbound {
    sender: mpsc::Sender<SystemMessage>,
    dropped: u64,
}

impl Outbound {
    fn push(&mut self, id: SessionId, message: SystemMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                self.dropped += 1;
                warn!(
                    session = %id,
                    action = %message.action,
                    total_dropped = self.dropped,
                    "outbound queue full, dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                // Writer already gone; the session task is about to disconnect.
                debug!(session = %id, "outbound queue closed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Action;

    #[test]
    fn ids_render_as_decimal_and_parse_back() {
        let id = SessionId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<SessionId>().unwrap(), id);
        assert!("abc".parse::<SessionId>().is_err());
        assert!("-1".parse::<SessionId>().is_err());
    }

    #[test]
    fn ids_order_by_connection_sequence() {
        assert!(SessionId::new(2) < SessionId::new(10));
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut session = Session::new(tx);
        let id = SessionId::new(0);

        assert!(session.deliver(id, SystemMessage::new(Action::Rooms)));
        assert!(!session.deliver(id, SystemMessage::new(Action::Leave)));
        assert_eq!(session.dropped(), 1);

        assert_eq!(rx.try_recv().unwrap().action, Action::Rooms);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_queue_is_not_counted_as_drop() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut session = Session::new(tx);
        assert!(!session.deliver(SessionId::new(3), SystemMessage::new(Action::Rooms)));
        assert_eq!(session.dropped(), 0);
    }
}
