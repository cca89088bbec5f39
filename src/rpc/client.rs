//! RPC client for connecting to the daemon.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{Request, Response, RpcError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens a fresh connection for every call.
pub struct RpcClient {
    addr: SocketAddr,
    timeout: Duration,
    next_id: AtomicU64,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Communication error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to parse response: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Daemon closed the connection")]
    Closed,

    #[error("No reply from daemon within {0:?}")]
    Timeout(Duration),

    #[error("Reply id {got} does not match request id {expected}")]
    IdMismatch { expected: u64, got: Value },

    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_TIMEOUT,
            next_id: AtomicU64::new(1),
        }
    }

    /// Covers the whole exchange, not just connecting.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Call an RPC method and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(method, params, Value::from(id));

        let response = tokio::time::timeout(self.timeout, self.exchange(&request))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;

        if response.id != Value::from(id) {
            return Err(ClientError::IdMismatch {
                expected: id,
                got: response.id,
            });
        }
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }

        serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(ClientError::Parse)
    }

    pub async fn call_no_params<T: DeserializeOwned>(
        &self,
        method: &str,
    ) -> Result<T, ClientError> {
        self.call(method, None).await
    }

    async fn exchange(&self, request: &Request) -> Result<Response, ClientError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(ClientError::Connect)?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(request).map_err(ClientError::Serialize)?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(ClientError::Io)?;

        let reply = BufReader::new(reader)
            .lines()
            .next_line()
            .await
            .map_err(ClientError::Io)?
            .ok_or(ClientError::Closed)?;

        serde_json::from_str(&reply).map_err(ClientError::Parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let err = RpcClient::new(addr)
            .with_timeout(Duration::from_millis(50))
            .call_no_params::<Value>("daemon.status")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        server.abort();
    }

    #[tokio::test]
    async fn test_server_hanging_up_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let _ = lines.next_line().await;
        });

        let err = RpcClient::new(addr)
            .call_no_params::<Value>("daemon.status")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Closed));
    }
}
