use std::{
    fs::{self, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{unix::OwnedWriteHalf, UnixListener, UnixStream},
    select,
    sync::{mpsc, oneshot, watch},
};
use tokio_stream::{wrappers::UnixListenerStream, StreamExt};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{daemon::tracking::EngineMessage, error::TrackerError};

use super::protocol::{parse_request, Reply, Request, Response, StatusReport, MAX_REQUEST_BYTES};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_EXCHANGES: usize = 16;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Accepts control connections and serves each one on its own task.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    engine: mpsc::Sender<EngineMessage>,
    status: watch::Receiver<Arc<StatusReport>>,
    cancellation: CancellationToken,
    connections: TaskTracker,
}

impl ControlServer {
    /// Binds the socket, replacing a stale one left by a previous run. The socket is only
    /// accessible by the owning user.
    pub fn bind(
        path: impl Into<PathBuf>,
        engine: mpsc::Sender<EngineMessage>,
        status: watch::Receiver<Arc<StatusReport>>,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {path:?}"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(e).with_context(|| format!("Failed to remove {path:?}")),
        }

        let listener =
            UnixListener::bind(&path).with_context(|| format!("Failed to bind {path:?}"))?;
        fs::set_permissions(&path, Permissions::from_mode(0o600))?;

        Ok(Self {
            listener,
            path,
            engine,
            status,
            cancellation,
            connections: TaskTracker::new(),
        })
    }

    pub async fn run(self) -> Result<()> {
        info!("Listening on {:?}", self.path);
        let mut incoming = UnixListenerStream::new(self.listener);

        loop {
            let stream = select! {
                _ = self.cancellation.cancelled() => break,
                stream = incoming.next() => stream,
            };
            let stream = match stream {
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    warn!("Failed to accept control connection {e:?}");
                    continue;
                }
                None => break,
            };

            let connection = Connection {
                engine: self.engine.clone(),
                status: self.status.clone(),
                cancellation: self.cancellation.clone(),
            };
            self.connections.spawn(async move {
                if let Err(e) = connection.serve(stream).await {
                    debug!("Control connection ended with {e:?}");
                }
            });
        }

        drop(incoming);
        self.connections.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.connections.wait())
            .await
            .is_err()
        {
            warn!("Abandoning {} control connections", self.connections.len());
        }
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                warn!("Failed to remove socket {:?} {e:?}", self.path)
            }
            _ => info!("Control socket closed"),
        }
        Ok(())
    }
}

struct Connection {
    engine: mpsc::Sender<EngineMessage>,
    status: watch::Receiver<Arc<StatusReport>>,
    cancellation: CancellationToken,
}

impl Connection {
    async fn serve(self, stream: UnixStream) -> Result<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        for _ in 0..MAX_EXCHANGES {
            let mut line = vec![];
            let limited = (&mut reader).take(MAX_REQUEST_BYTES as u64 + 1);
            let read = select! {
                _ = self.cancellation.cancelled() => break,
                read = tokio::time::timeout(READ_TIMEOUT, read_frame(limited, &mut line)) => read,
            };
            let Ok(read) = read else {
                debug!("Control client was silent for {READ_TIMEOUT:?}");
                break;
            };
            if read? == 0 {
                break;
            }

            let truncated = !line.ends_with(b"\n");
            let frame = line.trim_ascii();
            if frame.is_empty() {
                continue;
            }
            let result = match parse_request(frame) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => Err(e),
            };
            respond(&mut write, result.into()).await?;
            if truncated {
                // Either an oversized frame or a final line without a newline.
                break;
            }
        }
        write.shutdown().await?;
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Result<Reply, TrackerError> {
        if request.is_read() {
            let report = self.status.borrow().as_ref().clone();
            return Ok(Reply::Status(report));
        }
        if self.cancellation.is_cancelled() {
            return Err(unavailable());
        }

        let (reply, receiver) = oneshot::channel();
        self.engine
            .send(EngineMessage::Control { request, reply })
            .await
            .map_err(|_| unavailable())?;
        receiver.await.map_err(|_| unavailable())?
    }
}

async fn read_frame(
    mut reader: impl tokio::io::AsyncBufRead + Unpin,
    line: &mut Vec<u8>,
) -> io::Result<usize> {
    reader.read_until(b'\n', line).await
}

async fn respond(write: &mut OwnedWriteHalf, response: Response) -> Result<()> {
    let mut frame = serde_json::to_vec(&response)?;
    frame.push(b'\n');
    write.write_all(&frame).await?;
    Ok(())
}

fn unavailable() -> TrackerError {
    TrackerError::Unavailable("daemon is shutting down".into())
}

#[cfg(test)]
mod tests {
    use std::{os::unix::fs::PermissionsExt, sync::Arc, time::Duration};

    use anyhow::Result;
    use chrono::Utc;
    use tempfile::tempdir;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::UnixStream,
        sync::{mpsc, watch},
    };
    use tokio_util::sync::CancellationToken;

    use crate::{
        control::{
            client::ControlClient,
            protocol::{ErrorKind, Health, Reply, Request, Response, StatusReport},
        },
        daemon::{storage::entities::Session, tracking::EngineMessage},
        utils::logging::TEST_LOGGING,
    };

    use super::ControlServer;

    fn report() -> StatusReport {
        StatusReport {
            health: Health::Running,
            degraded_reason: None,
            session: None,
            open_span: None,
            work_item: None,
            idle: false,
            pending_writes: 0,
            last_observation_at: None,
        }
    }

    /// Answers every write with a fresh session, like an engine that has nothing running.
    async fn fake_engine(mut receiver: mpsc::Receiver<EngineMessage>) {
        while let Some(message) = receiver.recv().await {
            if let EngineMessage::Control { request, reply } = message {
                let project = match request {
                    Request::Start { project } => project,
                    _ => None,
                };
                let session = Session::start("s1".into(), project, Utc::now());
                let _ = reply.send(Ok(Reply::Session(session)));
            }
        }
    }

    #[tokio::test]
    async fn test_reads_use_snapshot_and_writes_go_through_engine() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let path = dir.path().join("worktally.sock");
        let (sender, receiver) = mpsc::channel(4);
        let (_status_tx, status) = watch::channel(Arc::new(report()));
        let cancellation = CancellationToken::new();
        let server = ControlServer::bind(&path, sender, status, cancellation.clone())?;

        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let client = ControlClient::new(&path);
        let (server_result, client_result, _) = tokio::join!(
            server.run(),
            async {
                let status = client.call(&Request::Status).await?;
                assert_eq!(status, Reply::Status(report()));

                let started = client
                    .call(&Request::Start {
                        project: Some("api".into()),
                    })
                    .await?;
                let Reply::Session(session) = started else {
                    panic!("expected a session, got {started:?}");
                };
                assert_eq!(session.project.as_deref(), Some("api"));
                cancellation.cancel();
                anyhow::Ok(())
            },
            fake_engine(receiver),
        );
        server_result?;
        client_result?;
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_usable() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let path = dir.path().join("worktally.sock");
        let (sender, receiver) = mpsc::channel(4);
        drop(receiver);
        let (_status_tx, status) = watch::channel(Arc::new(report()));
        let cancellation = CancellationToken::new();
        let server = ControlServer::bind(&path, sender, status, cancellation.clone())?;

        let (server_result, client_result) = tokio::join!(server.run(), async {
            let stream = UnixStream::connect(&path).await?;
            let (read, mut write) = stream.into_split();
            write
                .write_all(b"garbage\n{\"command\":\"status\"}\n{\"command\":\"stop\"}\n")
                .await?;
            write.shutdown().await?;

            let mut lines = BufReader::new(read).lines();
            let mut responses = vec![];
            while let Some(line) = lines.next_line().await? {
                responses.push(serde_json::from_str::<Response>(&line)?);
            }
            cancellation.cancel();

            assert_eq!(responses.len(), 3);
            assert_eq!(
                responses[0].error.as_ref().map(|v| v.kind),
                Some(ErrorKind::InvalidRequest)
            );
            assert!(responses[1].ok);
            // Nobody consumes writes anymore.
            assert_eq!(
                responses[2].error.as_ref().map(|v| v.kind),
                Some(ErrorKind::Unavailable)
            );
            anyhow::Ok(())
        });
        server_result?;
        client_result?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let path = dir.path().join("worktally.sock");
        std::fs::write(&path, b"left over")?;

        let (sender, _receiver) = mpsc::channel(4);
        let (_status_tx, status) = watch::channel(Arc::new(report()));
        let cancellation = CancellationToken::new();
        let server = ControlServer::bind(&path, sender, status, cancellation.clone())?;

        let (server_result, reply) = tokio::join!(server.run(), async {
            let reply = ControlClient::new(&path)
                .with_timeout(Duration::from_secs(1))
                .call(&Request::Status)
                .await;
            cancellation.cancel();
            reply
        });
        server_result?;
        assert!(matches!(reply?, Reply::Status(_)));
        Ok(())
    }
}
