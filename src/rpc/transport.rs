//! TCP transport layer for the RPC server.
//!
//! Newline-delimited JSON framing, one task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::methods::MethodHandler;

pub struct Transport {
    bind_addr: SocketAddr,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub fn new(bind_addr: SocketAddr, handler: MethodHandler) -> Self {
        Self {
            bind_addr,
            handler: Arc::new(handler),
        }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn listen(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind RPC server to {}", self.bind_addr))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "RPC server listening");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            debug!(%peer, "Client connected");
            let handler = self.handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = handle_connection(stream, handler) => {
                        if let Err(e) = result {
                            debug!(%peer, error = %e, "Connection error");
                        }
                    }
                    _ = shutdown.cancelled() => {}
                }
                debug!(%peer, "Client disconnected");
            });
        }

        info!("RPC server shutting down");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<MethodHandler>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(response) = handler.handle_text(line).await else {
            continue;
        };

        let mut reply = serde_json::to_string(&response)?;
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
    }

    Ok(())
}
