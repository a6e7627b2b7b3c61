//! JSON-RPC over the daemon's Unix-domain socket

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, trace};

use super::RpcBackend;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::{Error, Result};

/// Read buffer growth step
const READ_CHUNK: usize = 64 * 1024;

/// JSON-RPC client opening one connection per call.
///
/// The daemon terminates each response with a blank line but the reader
/// does not rely on it: bytes are accumulated until one complete JSON value
/// parses.
pub struct UnixSocketRpc {
    /// Socket path
    path: PathBuf,
    /// Request ID counter
    request_id: AtomicI64,
}

impl UnixSocketRpc {
    /// Create a client for the socket at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            request_id: AtomicI64::new(1),
        }
    }

    fn next_id(&self) -> RequestId {
        RequestId::String(format!(
            "rune-gateway:{}",
            self.request_id.fetch_add(1, Ordering::Relaxed)
        ))
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.path).await.map_err(|e| {
            Error::Transport(format!(
                "Cannot connect to RPC socket '{}': {e}",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl RpcBackend for UnixSocketRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        let message = serde_json::to_vec(&request)?;

        let mut stream = self.connect().await?;
        stream
            .write_all(&message)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        trace!(id = %request.id, method = %method, "RPC request sent");
        let response = read_response(&mut stream).await?;

        if response.id.as_ref() != Some(&request.id) {
            debug!(
                expected = %request.id,
                got = ?response.id,
                "RPC response id mismatch"
            );
        }

        response.into_result()
    }
}

/// Read from `stream` until a full response object has arrived.
async fn read_response<R>(stream: &mut R) -> Result<JsonRpcResponse>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    loop {
        let start = buf.len();
        buf.resize(start + READ_CHUNK, 0);
        let n = stream
            .read(&mut buf[start..])
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        buf.truncate(start + n);

        if n == 0 {
            return Err(Error::Transport(
                "RPC socket closed before a complete response".to_string(),
            ));
        }

        let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<JsonRpcResponse>();
        match values.next() {
            Some(Ok(response)) => return Ok(response),
            Some(Err(e)) if e.is_eof() => {}
            Some(Err(e)) => return Err(Error::Transport(format!("Malformed RPC response: {e}"))),
            None => {}
        }
    }
}
