//! RPC server for client communication.
//!
//! A JSON-RPC 2.0 interface over TCP exposing the orchestrator: device
//! queries, feature flags, transfers, backups, device control and jobs.
//!
//! - `protocol`: JSON-RPC 2.0 request/response/notification types
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: Method dispatcher and handlers
//! - `client`: Client for connecting to the daemon

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{Notification, Request, Response, RpcError, error_code};

pub struct RpcServer {
    transport: Transport,
}

impl RpcServer {
    pub fn new(orchestrator: Orchestrator, bind_addr: SocketAddr) -> Self {
        let handler = MethodHandler::new(orchestrator);
        Self {
            transport: Transport::new(bind_addr, handler),
        }
    }

    /// Serve until `shutdown` fires.
    pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transport.listen(shutdown).await
    }

    /// Serve on a listener the caller already bound, e.g. to port 0.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transport.serve(listener, shutdown).await
    }
}
