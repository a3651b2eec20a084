use std::sync::Arc;

use tracing::debug;

use crate::{
    error::RouteError,
    protocol::{self, Action, DecodeError, Request, SystemMessage},
    registry::Registry,
    session::SessionId,
};

/// Turns inbound requests into registry mutations and deliveries. Failures
/// go back to the requesting session as `error` messages.
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<Registry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Decodes and handles one inbound text frame.
    pub async fn dispatch(&self, session: SessionId, frame: &str) {
        let outcome = match protocol::decode(frame) {
            Ok(request) => self.handle(session, request).await,
            Err(err) => Err(err.into()),
        };
        self.settle(session, outcome).await;
    }

    pub async fn reject(&self, session: SessionId, error: DecodeError) {
        self.settle(session, Err(error.into())).await;
    }

    pub async fn handle(&self, session: SessionId, request: Request) -> Result<(), RouteError> {
        debug!(%session, ?request, "routing request");
        match request {
            Request::Join { room } => {
                self.registry.join(session, &room).await?;
            }
            Request::Leave => {
                self.registry.leave(session).await?;
            }
            Request::PrivateMessage { target, body } => {
                self.registry.direct_message(session, &target, body).await?;
            }
            Request::RoomMessage { body } => {
                self.registry.room_message(session, body).await?;
            }
            Request::Rooms => {
                let rooms = self.registry.rooms().await;
                self.registry
                    .send(session, SystemMessage::new(Action::Rooms).with_rooms(rooms))
                    .await;
            }
            Request::Participants { room } => {
                let members = self.registry.participants(&room).await?;
                let reply = SystemMessage::new(Action::Participants)
                    .with_room(room)
                    .with_participants(members);
                self.registry.send(session, reply).await;
            }
        }
        Ok(())
    }

    async fn settle(&self, session: SessionId, outcome: Result<(), RouteError>) {
        match outcome {
            Ok(()) => {}
            Err(RouteError::UnknownSession(_)) => {
                debug!(%session, "dropping request from disconnected session");
            }
            Err(err) => {
                debug!(%session, error = %err, "request failed");
                self.registry
                    .send(session, SystemMessage::error(err.to_string()))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    struct Client {
        id: SessionId,
        rx: mpsc::Receiver<SystemMessage>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<SystemMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                out.push(message);
            }
            out
        }

        fn only(&mut self) -> SystemMessage {
            let mut messages = self.drain();
            assert_eq!(messages.len(), 1, "expected one message, got {messages:?}");
            messages.remove(0)
        }
    }

    fn router() -> MessageRouter {
        MessageRouter::new(Arc::new(Registry::new()))
    }

    async fn connect(router: &MessageRouter) -> Client {
        let (tx, rx) = mpsc::channel(32);
        let id = router.registry().connect(tx).await.unwrap();
        let mut client = Client { id, rx };
        assert_eq!(client.only().action, Action::Connection);
        client
    }

    async fn send(router: &MessageRouter, client: &Client, frame: &str) {
        router.dispatch(client.id, frame).await;
    }

    #[tokio::test]
    async fn join_then_list_participants() {
        let router = router();
        let mut alice = connect(&router).await;

        send(&router, &alice, r#"{"action":"join","room":"lobby"}"#).await;
        let joined = alice.only();
        assert_eq!(joined.action, Action::Join);
        assert_eq!(joined.room.as_deref(), Some("lobby"));

        send(&router, &alice, r#"{"action":"participants","room":"lobby"}"#).await;
        let listing = alice.only();
        assert_eq!(listing.action, Action::Participants);
        assert_eq!(listing.participants, Some(vec!["0".to_string()]));
    }

    #[tokio::test]
    async fn participants_of_missing_room() {
        let router = router();
        let mut alice = connect(&router).await;

        send(&router, &alice, r#"{"action":"participants","room":"nowhere"}"#).await;
        assert_eq!(
            alice.only(),
            SystemMessage::error("room nowhere does not exist")
        );
    }

    #[tokio::test]
    async fn rooms_lists_only_populated_rooms() {
        let router = router();
        let mut alice = connect(&router).await;
        let mut bob = connect(&router).await;

        send(&router, &alice, r#"{"action":"join","room":"b"}"#).await;
        send(&router, &bob, r#"{"action":"join","room":"a"}"#).await;
        send(&router, &bob, r#"{"action":"leave"}"#).await;
        alice.drain();
        bob.drain();

        send(&router, &alice, r#"{"action":"rooms"}"#).await;
        assert_eq!(alice.only().rooms, Some(vec!["b".to_string()]));
    }

    #[tokio::test]
    async fn room_message_skips_sender() {
        let router = router();
        let mut alice = connect(&router).await;
        let mut bob = connect(&router).await;
        let mut carol = connect(&router).await;
        for client in [&alice, &bob, &carol] {
            send(&router, client, r#"{"action":"join","room":"lobby"}"#).await;
        }
        alice.drain();
        bob.drain();
        carol.drain();

        send(&router, &alice, r#"{"action":"room_message","message":"hi"}"#).await;

        for peer in [&mut bob, &mut carol] {
            let heard = peer.only();
            assert_eq!(heard.action, Action::RoomMessage);
            assert_eq!(heard.room.as_deref(), Some("lobby"));
            assert_eq!(heard.user_id.as_deref(), Some("0"));
            assert_eq!(heard.message.as_deref(), Some("hi"));
        }

        let confirmation = alice.only();
        assert_eq!(confirmation.action, Action::RoomMessage);
        assert_eq!(confirmation.room.as_deref(), Some("lobby"));
        assert_eq!(confirmation.user_id, None);
    }

    #[tokio::test]
    async fn room_message_outside_room() {
        let router = router();
        let mut alice = connect(&router).await;

        send(&router, &alice, r#"{"action":"room_message","message":"hi"}"#).await;
        assert_eq!(alice.only(), SystemMessage::error("user was not in a room"));
    }

    #[tokio::test]
    async fn direct_message_crosses_rooms() {
        let router = router();
        let mut alice = connect(&router).await;
        let mut bob = connect(&router).await;
        send(&router, &alice, r#"{"action":"join","room":"a"}"#).await;
        alice.drain();

        send(
            &router,
            &alice,
            r#"{"action":"private_message","user_id":"1","message":"psst"}"#,
        )
        .await;

        let delivered = bob.only();
        assert_eq!(delivered.action, Action::PrivateMessage);
        assert_eq!(delivered.user_id.as_deref(), Some("0"));
        assert_eq!(delivered.message.as_deref(), Some("psst"));

        let echo = alice.only();
        assert_eq!(echo.user_id.as_deref(), Some("1"));
        assert_eq!(echo.message.as_deref(), Some("psst"));
    }

    #[tokio::test]
    async fn direct_message_to_unknown_targets() {
        let router = router();
        let mut alice = connect(&router).await;
        let bob = connect(&router).await;
        router.registry().disconnect(bob.id).await;

        for target in ["9", "1", "01", "bob"] {
            let frame = format!(
                r#"{{"action":"private_message","user_id":"{target}","message":"hi"}}"#
            );
            send(&router, &alice, &frame).await;
            assert_eq!(
                alice.only(),
                SystemMessage::error(format!("user {target} is not on the server"))
            );
        }
    }

    #[tokio::test]
    async fn leave_outside_room_changes_nothing() {
        let router = router();
        let mut alice = connect(&router).await;

        send(&router, &alice, r#"{"action":"leave"}"#).await;
        assert_eq!(alice.only(), SystemMessage::error("user was not in a room"));
        assert_eq!(router.registry().room_of(alice.id).await, None);
        assert!(router.registry().rooms().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_keep_session_alive() {
        let router = router();
        let mut alice = connect(&router).await;

        for frame in [
            "garbage",
            r#"{"action":"teleport"}"#,
            r#"{"action":"connection"}"#,
            r#"{"action":"join"}"#,
        ] {
            send(&router, &alice, frame).await;
            let reply = alice.only();
            assert_eq!(reply.action, Action::Error);
            assert!(reply.message.unwrap().starts_with("malformed message"));
        }

        router.reject(alice.id, DecodeError::BinaryFrame).await;
        assert_eq!(alice.only().action, Action::Error);
        assert!(router.registry().is_connected(alice.id).await);
    }

    #[tokio::test]
    async fn requests_after_disconnect_are_silent() {
        let router = router();
        let mut alice = connect(&router).await;
        router.registry().disconnect(alice.id).await;

        send(&router, &alice, r#"{"action":"join","room":"lobby"}"#).await;
        send(&router, &alice, r#"{"action":"leave"}"#).await;
        assert!(alice.drain().is_empty());
        assert!(router.registry().rooms().await.is_empty());
    }
}
