use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    Router,
    extract::{ConnectInfo, State, ws::WebSocketUpgrade},
    response::Response,
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    connection::serve_connection, protocol::CONNECT_PATH, registry::Registry,
    router::MessageRouter,
};

const SHUTDOWN_NOTICE: &str = "relay shutting down";

/// Tunables for a running relay.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Outbound messages buffered per session before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
    registry: Arc<Registry>,
}

#[derive(Clone)]
struct RelayState {
    router: MessageRouter,
    queue_capacity: usize,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            config,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Relay {
            listener,
            config,
            registry,
        } = self;

        let state = RelayState {
            router: MessageRouter::new(Arc::clone(&registry)),
            queue_capacity: config.queue_capacity.max(1),
        };
        let app = Router::new()
            .route(CONNECT_PATH, get(upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let signal = async move {
            shutdown.await;
            handle_shutdown(&registry).await;
        };

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await?;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(registry: &Registry) {
    let sessions = registry.shutdown(SHUTDOWN_NOTICE).await;
    info!(sessions, "relay shutting down");
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_failed_upgrade(move |error| warn!(?peer, error = %error, "websocket handshake failed"))
        .on_upgrade(move |socket| {
            serve_connection(socket, peer, state.router, state.queue_capacity)
        })
}
