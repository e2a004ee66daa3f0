use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
};
use tracing::debug;

use super::protocol::{Reply, Request, Response};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// One request per connection.
#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub async fn send(&self, request: &Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| anyhow!("Daemon didn't answer within {:?}", self.timeout))?
    }

    /// Like [ControlClient::send], but turns an error response into an
    /// [ErrorInfo](super::protocol::ErrorInfo) error.
    pub async fn call(&self, request: &Request) -> Result<Reply> {
        Ok(self.send(request).await?.into_result()?)
    }

    async fn exchange(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.path)
            .await
            .with_context(|| format!("Daemon is not listening on {:?}", self.path))?;
        let (read, mut write) = stream.into_split();

        let mut frame = serde_json::to_vec(request)?;
        frame.push(b'\n');
        write.write_all(&frame).await?;
        write.shutdown().await?;
        debug!("Sent {request:?}");

        let mut line = String::new();
        BufReader::new(read).read_line(&mut line).await?;
        if line.trim().is_empty() {
            return Err(anyhow!("Daemon closed the connection without answering"));
        }
        Ok(serde_json::from_str(&line)?)
    }
}
