use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{select, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    protocol::{self, DecodeError, SystemMessage},
    router::MessageRouter,
    session::SessionId,
};

/// Runs one client from just after the WebSocket upgrade until it is gone.
///
/// The reader half decodes and dispatches frames in arrival order. The writer
/// half drains the session's outbound queue. Whichever finishes first ends the
/// session, and disconnect runs exactly once on the way out.
pub(crate) async fn serve_connection(
    socket: WebSocket,
    peer: SocketAddr,
    router: MessageRouter,
    queue_capacity: usize,
) {
    let (outbound, queue) = mpsc::channel(queue_capacity);
    let session = match router.registry().connect(outbound).await {
        Ok(session) => session,
        Err(err) => {
            info!(?peer, error = %err, "refusing connection");
            if let Err(err) = socket.close().await {
                debug!(?peer, error = %err, "close after refusal failed");
            }
            return;
        }
    };
    info!(%session, ?peer, "session connected");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_outbound(sink, queue, session));

    select! {
        result = read_inbound(stream, &router, session) => {
            if let Err(err) = result {
                debug!(%session, ?peer, error = %err, "read failed");
            }
        }
        result = &mut writer => {
            match result {
                Ok(Ok(())) => debug!(%session, "outbound queue closed"),
                Ok(Err(err)) => debug!(%session, error = %err, "write failed"),
                Err(err) => warn!(%session, ?peer, error = %err, "writer task failed"),
            }
        }
    }

    if router.registry().disconnect(session).await {
        info!(%session, ?peer, "session disconnected");
    }
    writer.abort();
}

async fn read_inbound(
    mut stream: SplitStream<WebSocket>,
    router: &MessageRouter,
    session: SessionId,
) -> Result<(), axum::Error> {
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => router.dispatch(session, &text).await,
            Message::Binary(_) => router.reject(session, DecodeError::BinaryFrame).await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Ok(())
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<SystemMessage>,
    session: SessionId,
) -> Result<(), axum::Error> {
    while let Some(message) = queue.recv().await {
        let text = match protocol::encode(&message) {
            Ok(text) => text,
            Err(err) => {
                warn!(%session, error = %err, "failed to encode outbound message");
                continue;
            }
        };
        sink.send(Message::Text(text)).await?;
    }

    // The registry dropped our sender: say goodbye so the client stops reading.
    sink.close().await
}
