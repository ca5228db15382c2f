//! Transport over a local Docker container.
//!
//! The CLI runs under `docker exec` with stdin attached and no TTY. The
//! exec is started by hand over the daemon's unix socket with an HTTP
//! upgrade so we own the raw attach stream: writes go straight to the
//! socket, reads come back in the runtime's 8-byte multiplexing frames
//! and are demuxed by [`FrameDecoder`]. Stdin EOF is a half-close of
//! the socket's write side.

use std::sync::Arc;

use async_trait::async_trait;
use bollard::exec::CreateExecOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;

use crate::sandbox::docker::{DockerProvider, SANDBOX_USER};
use crate::sandbox::error::SandboxError;
use crate::sandbox::provider::{HOME_DIR, SandboxProvider};

use super::framing::{FrameDecoder, StreamKind};
use super::options::AgentOptions;
use super::{
    CommandTransport, EXIT_POLL_INTERVAL, EventStream, TransportCore, TransportState,
    record_exit_error,
};

pub struct DockerTransport {
    provider: Arc<DockerProvider>,
    sandbox_id: String,
    options: AgentOptions,
    core: TransportCore,
    exec_id: Option<String>,
    writer: Option<OwnedWriteHalf>,
}

impl DockerTransport {
    pub fn new(provider: Arc<DockerProvider>, sandbox_id: String, options: AgentOptions) -> Self {
        let core = TransportCore::new(options.max_buffer_size());
        DockerTransport {
            provider,
            sandbox_id,
            options,
            core,
            exec_id: None,
            writer: None,
        }
    }
}

#[async_trait]
impl CommandTransport for DockerTransport {
    async fn connect(&mut self) -> Result<(), SandboxError> {
        match self.core.state {
            TransportState::Unconnected => {}
            // Already live; nothing to do.
            TransportState::Ready => return Ok(()),
            // Connecting, closing or closed: this transport is spent.
            _ => return Err(SandboxError::NotReady),
        }
        self.core.state = TransportState::Connecting;

        if !self.provider.connect(&self.sandbox_id).await? {
            self.core.state = TransportState::Closed;
            return Err(SandboxError::NotFound(format!(
                "sandbox {}",
                self.sandbox_id
            )));
        }

        let container = DockerProvider::container_name(&self.sandbox_id);
        let exec = self
            .provider
            .docker()
            .create_exec(
                &container,
                CreateExecOptions {
                    cmd: Some(vec![
                        "bash".to_string(),
                        "-lc".to_string(),
                        self.options.build_command(),
                    ]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    user: Some(SANDBOX_USER.to_string()),
                    working_dir: Some(HOME_DIR.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Backend(format!("agent exec create failed: {e}")))?;
        self.exec_id = Some(exec.id.clone());
        tracing::info!(sandbox_id = %self.sandbox_id, exec_id = %exec.id, "agent CLI started");

        let (stream, leftover) = attach_exec(self.provider.socket_path(), &exec.id).await?;
        let (mut read_half, write_half) = stream.into_split();
        self.writer = Some(write_half);

        let tx = self
            .core
            .take_sender()
            .ok_or(SandboxError::ConnectionLost("transport reused".into()))?;
        let exit_error = self.core.exit_error.clone();
        let max_buffer_size = self.options.max_buffer_size();
        let reader = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(max_buffer_size);
            let mut pending = leftover;
            let mut buf = [0u8; 8192];
            loop {
                let frames = match decoder.feed(&pending) {
                    Ok(frames) => frames,
                    Err(err) => {
                        record_exit_error(&exit_error, err);
                        return;
                    }
                };
                pending.clear();
                for frame in frames {
                    match frame.kind {
                        StreamKind::Stdout => {
                            let text = String::from_utf8_lossy(&frame.payload).into_owned();
                            if tx.send(text).await.is_err() {
                                return;
                            }
                        }
                        StreamKind::Stderr => {
                            let text = String::from_utf8_lossy(&frame.payload);
                            tracing::debug!(target: "agent_stderr", "{}", text.trim_end());
                        }
                        StreamKind::Stdin => {}
                    }
                }
                match read_half.read(&mut buf).await {
                    Ok(0) => return,
                    Ok(n) => pending.extend_from_slice(&buf[..n]),
                    Err(err) => {
                        record_exit_error(
                            &exit_error,
                            SandboxError::ConnectionLost(format!("attach read failed: {err}")),
                        );
                        return;
                    }
                }
            }
        });
        self.core.track(reader);

        let docker = self.provider.docker().clone();
        let exec_id = exec.id.clone();
        let exit_error = self.core.exit_error.clone();
        let monitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXIT_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let inspect = match docker.inspect_exec(&exec_id).await {
                    Ok(inspect) => inspect,
                    Err(err) => {
                        record_exit_error(
                            &exit_error,
                            SandboxError::ConnectionLost(format!(
                                "agent process disappeared: {err}"
                            )),
                        );
                        return;
                    }
                };
                if inspect.running == Some(false) {
                    let exit_code = inspect.exit_code.unwrap_or(-1);
                    if exit_code != 0 {
                        tracing::warn!(exec_id = %exec_id, exit_code, "agent CLI exited abnormally");
                        record_exit_error(&exit_error, SandboxError::Process { exit_code });
                    }
                    return;
                }
            }
        });
        self.core.track(monitor);

        self.core.state = TransportState::Ready;
        Ok(())
    }

    async fn write(&mut self, data: &str) -> Result<(), SandboxError> {
        self.core.ensure_writable()?;
        let writer = self.writer.as_mut().ok_or(SandboxError::NotReady)?;
        writer.write_all(data.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn end_input(&mut self) -> Result<(), SandboxError> {
        self.core.mark_input_closed()?;
        // Half-close; the exec sees EOF on stdin while stdout stays open.
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    fn read_messages(&mut self) -> EventStream {
        self.core.take_stream()
    }

    async fn close(&mut self) {
        if self.core.state == TransportState::Closed {
            return;
        }
        self.core.close();
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.shutdown().await {
                tracing::debug!(error = %err, "attach shutdown on close failed");
            }
        }
        self.exec_id = None;
    }

    fn state(&self) -> TransportState {
        self.core.state
    }
}

/// Start the exec over the daemon socket with an HTTP upgrade, returning
/// the raw stream plus any payload bytes read past the response headers.
async fn attach_exec(
    socket_path: &str,
    exec_id: &str,
) -> Result<(UnixStream, Vec<u8>), SandboxError> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| SandboxError::ConnectionLost(format!("docker socket connect failed: {e}")))?;

    let body = r#"{"Detach":false,"Tty":false}"#;
    let request = format!(
        "POST /v1.41/exec/{exec_id}/start HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Connection: Upgrade\r\n\
         Upgrade: tcp\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 16 * 1024 {
            return Err(SandboxError::MalformedOutput(
                "oversized attach response headers".into(),
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SandboxError::ConnectionLost(
                "docker closed the attach socket during handshake".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]);
    let status_line = head.lines().next().unwrap_or_default();
    if !(status_line.contains(" 101 ") || status_line.contains(" 200 ")) {
        return Err(SandboxError::ConnectionLost(format!(
            "exec attach rejected: {status_line}"
        )));
    }
    Ok((stream, buf[header_end..].to_vec()))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_end_detection() {
        assert_eq!(find_header_end(b"HTTP/1.1 101\r\n\r\n"), Some(16));
        assert_eq!(
            find_header_end(b"HTTP/1.1 101\r\nUpgrade: tcp\r\n\r\n\x01rest"),
            Some(30)
        );
        assert_eq!(find_header_end(b"HTTP/1.1 101\r\n"), None);
    }

    #[tokio::test]
    async fn attach_handshake_against_scripted_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut req = vec![0u8; 4096];
            let n = conn.read(&mut req).await.unwrap();
            let req = String::from_utf8_lossy(&req[..n]).into_owned();
            // Upgrade response with the first frame already in the same write.
            let mut resp =
                b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n".to_vec();
            resp.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 2]);
            resp.extend_from_slice(b"hi");
            conn.write_all(&resp).await.unwrap();
            req
        });

        let (_stream, leftover) = attach_exec(path.to_str().unwrap(), "abc123").await.unwrap();
        let req = server.await.unwrap();
        assert!(req.starts_with("POST /v1.41/exec/abc123/start HTTP/1.1\r\n"));
        assert!(req.contains("Upgrade: tcp\r\n"));
        assert!(req.contains(r#"{"Detach":false,"Tty":false}"#));

        let mut decoder = FrameDecoder::new(1024);
        let frames = decoder.feed(&leftover).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, StreamKind::Stdout);
        assert_eq!(&frames[0].payload[..], b"hi");
    }

    #[tokio::test]
    async fn connect_after_close_is_rejected() {
        let provider =
            Arc::new(DockerProvider::new(crate::config::DockerConfig::default()).unwrap());
        let mut t = DockerTransport::new(provider, "sbx".into(), AgentOptions::default());
        t.close().await;
        assert!(matches!(t.connect().await, Err(SandboxError::NotReady)));
        assert_eq!(t.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn attach_rejects_non_upgrade_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut req = vec![0u8; 4096];
            let _ = conn.read(&mut req).await.unwrap();
            conn.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let err = attach_exec(path.to_str().unwrap(), "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ConnectionLost(_)));
    }
}
