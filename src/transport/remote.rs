//! Transport over the managed-VM service.
//!
//! The CLI runs as a backgrounded process in the VM; stdout comes back
//! as the service's ndjson output stream and stdin goes through the
//! process stdin endpoint. Exit detection rides the service's long-poll
//! wait endpoint instead of a local poll loop.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use crate::sandbox::error::SandboxError;
use crate::sandbox::provider::{HOME_DIR, SandboxProvider};
use crate::sandbox::remote::{CommandRequest, OutputLine, RemoteVmProvider, ndjson_lines};

use super::options::AgentOptions;
use super::{CommandTransport, EventStream, TransportCore, TransportState, record_exit_error};

pub struct RemoteVmTransport {
    provider: Arc<RemoteVmProvider>,
    sandbox_id: String,
    options: AgentOptions,
    core: TransportCore,
    pid: Option<i64>,
}

impl RemoteVmTransport {
    pub fn new(provider: Arc<RemoteVmProvider>, sandbox_id: String, options: AgentOptions) -> Self {
        let core = TransportCore::new(options.max_buffer_size());
        RemoteVmTransport {
            provider,
            sandbox_id,
            options,
            core,
            pid: None,
        }
    }
}

#[async_trait]
impl CommandTransport for RemoteVmTransport {
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

        let client = self.provider.client().clone();
        let req = CommandRequest {
            command: self.options.build_command(),
            background: true,
            envs: Default::default(),
            cwd: Some(HOME_DIR.to_string()),
            user: None,
            timeout_secs: Some(0),
        };
        let resp = client.run_command(&self.sandbox_id, &req).await?;
        let pid = resp.pid.ok_or_else(|| {
            SandboxError::Backend("service returned no pid for background command".into())
        })?;
        self.pid = Some(pid);
        tracing::info!(sandbox_id = %self.sandbox_id, pid, "agent CLI started");

        let output_resp = client.process_output(&self.sandbox_id, pid).await?;
        let tx = self
            .core
            .take_sender()
            .ok_or(SandboxError::ConnectionLost("transport reused".into()))?;
        let exit_error = self.core.exit_error.clone();
        let reader = tokio::spawn(async move {
            let lines = ndjson_lines(output_resp);
            futures::pin_mut!(lines);
            while let Some(line) = lines.next().await {
                match line {
                    Ok(OutputLine {
                        stream,
                        data: Some(data),
                    }) => match stream.as_deref() {
                        Some("stderr") => {
                            tracing::debug!(target: "agent_stderr", "{}", data.trim_end())
                        }
                        _ => {
                            if tx.send(data).await.is_err() {
                                break;
                            }
                        }
                    },
                    Ok(_) => {}
                    Err(err) => {
                        record_exit_error(&exit_error, err);
                        break;
                    }
                }
            }
        });
        self.core.track(reader);

        let monitor_client = client.clone();
        let sandbox_id = self.sandbox_id.clone();
        let exit_error = self.core.exit_error.clone();
        let monitor = tokio::spawn(async move {
            match monitor_client.wait_process(&sandbox_id, pid).await {
                Ok(wait) if wait.exit_code != 0 => {
                    tracing::warn!(pid, exit_code = wait.exit_code, stderr = %wait.stderr, "agent CLI exited abnormally");
                    record_exit_error(
                        &exit_error,
                        SandboxError::Process {
                            exit_code: wait.exit_code,
                        },
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    record_exit_error(
                        &exit_error,
                        SandboxError::ConnectionLost(format!("process wait failed: {err}")),
                    );
                }
            }
        });
        self.core.track(monitor);

        self.core.state = TransportState::Ready;
        Ok(())
    }

    async fn write(&mut self, data: &str) -> Result<(), SandboxError> {
        self.core.ensure_writable()?;
        let pid = self.pid.ok_or(SandboxError::NotReady)?;
        self.provider
            .client()
            .send_stdin(&self.sandbox_id, pid, data.as_bytes())
            .await
    }

    async fn end_input(&mut self) -> Result<(), SandboxError> {
        self.core.mark_input_closed()?;
        let pid = self.pid.ok_or(SandboxError::NotReady)?;
        // EOT makes the CLI treat stdin as closed.
        self.provider
            .client()
            .send_stdin(&self.sandbox_id, pid, "\u{0004}".as_bytes())
            .await
    }

    fn read_messages(&mut self) -> EventStream {
        self.core.take_stream()
    }

    async fn close(&mut self) {
        if self.core.state == TransportState::Closed {
            return;
        }
        self.core.close();
        if let Some(pid) = self.pid.take() {
            if let Err(err) = self.provider.client().kill_process(&self.sandbox_id, pid).await {
                tracing::debug!(pid, error = %err, "kill on close failed");
            }
        }
    }

    fn state(&self) -> TransportState {
        self.core.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteVmConfig;

    fn transport() -> RemoteVmTransport {
        let provider = Arc::new(RemoteVmProvider::new(RemoteVmConfig {
            api_base_url: "http://127.0.0.1:1".into(),
            api_key: "k".into(),
            template: "base".into(),
            preview_domain: "example.dev".into(),
            auto_pause_secs: 3000,
        }));
        RemoteVmTransport::new(provider, "sbx-1".into(), AgentOptions::default())
    }

    #[tokio::test]
    async fn write_before_connect_is_not_ready() {
        let mut t = transport();
        assert!(matches!(
            t.write("data").await,
            Err(SandboxError::NotReady)
        ));
        assert!(!t.is_ready());
    }

    #[tokio::test]
    async fn close_without_connect_is_safe() {
        let mut t = transport();
        t.close().await;
        t.close().await;
        assert_eq!(t.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn connect_after_close_is_rejected() {
        let mut t = transport();
        t.close().await;
        assert!(matches!(t.connect().await, Err(SandboxError::NotReady)));
        assert_eq!(t.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn stream_after_close_still_terminates() {
        let mut t = transport();
        t.close().await;
        let items: Vec<_> = t.read_messages().collect::<Vec<_>>().await;
        assert!(items.is_empty());
    }
}
