//! WebSocket gateway.
//!
//! Speaks the same JSON-RPC 2.0 methods as the TCP server and pushes every
//! orchestration event to connected sockets as an `event` notification.
//!
//! ## Endpoints
//!
//! - `GET /devices` - Current device snapshot as JSON
//! - `WS /ws` - JSON-RPC requests in, responses and event notifications out

mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{Json, Router, extract::State, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core::{Device, Orchestrator};
use crate::rpc::MethodHandler;

#[derive(Clone)]
pub struct WebState {
    pub handler: Arc<MethodHandler>,
}

pub struct WebServer {
    bind_addr: SocketAddr,
    state: WebState,
}

impl WebServer {
    pub fn new(orchestrator: Orchestrator, bind_addr: SocketAddr) -> Self {
        let handler = Arc::new(MethodHandler::new(orchestrator));
        Self {
            bind_addr,
            state: WebState { handler },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/devices", get(list_devices))
            .route("/ws", get(websocket::ws_handler))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` fires.
    pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind web server to {}", self.bind_addr))?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "Web gateway listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

async fn list_devices(State(state): State<WebState>) -> Json<Vec<Device>> {
    Json(state.handler.orchestrator().list_devices())
}
