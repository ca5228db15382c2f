//! Remote managed-VM sandbox backend.
//!
//! Talks to the sandbox service's REST API: sandbox lifecycle, command
//! execution (foreground and backgrounded with streamed output), file
//! transfer, and PTYs. All calls go through the retry wrapper; auth
//! rejections surface immediately.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::RemoteVmConfig;
use crate::retry;

use super::error::SandboxError;
use super::provider::{
    self, DEFAULT_COMMAND_TIMEOUT_SECS, HOME_DIR, IDE_PORT, PtyOutput, SandboxProvider,
    enforce_timeout,
};
use super::types::{
    CommandResult, ExecOptions, FileContent, ProviderKind, PtySession, PtySize,
};

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SandboxCreateRequest {
    pub template: String,
    /// Seconds of inactivity before the service pauses the VM.
    pub auto_pause_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxResponse {
    pub sandbox_id: String,
    pub status: SandboxStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRequest {
    pub command: String,
    pub background: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub envs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i64,
    /// Present only for background commands.
    #[serde(default)]
    pub pid: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaitResponse {
    pub exit_code: i64,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PtyCreateRequest {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PtyResponse {
    pub pid: i64,
}

/// One line of a streamed process/PTY output body (newline-delimited JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct OutputLine {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

// ── Client ──────────────────────────────────────────────────────────

/// HTTP client for the managed sandbox service REST API.
#[derive(Debug, Clone)]
pub struct RemoteVmClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl RemoteVmClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("X-API-Key", &self.api_key)
    }

    async fn check(
        resp: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response, SandboxError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(error_for_status(context, status.as_u16(), &body))
    }

    pub async fn create_sandbox(
        &self,
        req: &SandboxCreateRequest,
    ) -> Result<SandboxResponse, SandboxError> {
        tracing::info!(template = %req.template, "creating sandbox");
        let resp = self
            .auth(self.client.post(self.url("/sandboxes")))
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::CreateFailed(format!("sandbox create failed: {e}")))?;
        let resp = Self::check(resp, "create").await?;
        let sandbox = resp
            .json::<SandboxResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse sandbox response: {e}")))?;
        tracing::info!(sandbox_id = %sandbox.sandbox_id, "sandbox created");
        Ok(sandbox)
    }

    pub async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxResponse, SandboxError> {
        let resp = self
            .auth(self.client.get(self.url(&format!("/sandboxes/{sandbox_id}"))))
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("sandbox get failed: {e}")))?;
        if resp.status().as_u16() == 404 {
            return Err(SandboxError::NotFound(format!("sandbox {sandbox_id}")));
        }
        let resp = Self::check(resp, "get").await?;
        resp.json::<SandboxResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse sandbox response: {e}")))
    }

    /// Resume a paused sandbox. Idempotent on the service side.
    pub async fn resume_sandbox(&self, sandbox_id: &str) -> Result<SandboxResponse, SandboxError> {
        let resp = self
            .auth(
                self.client
                    .post(self.url(&format!("/sandboxes/{sandbox_id}/resume"))),
            )
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("sandbox resume failed: {e}")))?;
        if resp.status().as_u16() == 404 {
            return Err(SandboxError::NotFound(format!("sandbox {sandbox_id}")));
        }
        let resp = Self::check(resp, "resume").await?;
        resp.json::<SandboxResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse sandbox response: {e}")))
    }

    pub async fn delete_sandbox(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let resp = self
            .auth(
                self.client
                    .delete(self.url(&format!("/sandboxes/{sandbox_id}"))),
            )
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("sandbox delete failed: {e}")))?;
        if resp.status().as_u16() == 404 {
            // Already gone, not an error
            tracing::warn!(sandbox_id = %sandbox_id, "sandbox already deleted");
            return Ok(());
        }
        Self::check(resp, "delete").await?;
        tracing::info!(sandbox_id = %sandbox_id, "sandbox deleted");
        Ok(())
    }

    pub async fn run_command(
        &self,
        sandbox_id: &str,
        req: &CommandRequest,
    ) -> Result<CommandResponse, SandboxError> {
        let resp = self
            .auth(
                self.client
                    .post(self.url(&format!("/sandboxes/{sandbox_id}/commands"))),
            )
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("command failed: {e}")))?;
        if resp.status().as_u16() == 404 {
            return Err(SandboxError::NotFound(format!("sandbox {sandbox_id}")));
        }
        let resp = Self::check(resp, "command").await?;
        resp.json::<CommandResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse command response: {e}")))
    }

    /// Streamed output of a backgrounded process, as ndjson lines.
    pub async fn process_output(
        &self,
        sandbox_id: &str,
        pid: i64,
    ) -> Result<reqwest::Response, SandboxError> {
        let resp = self
            .auth(self.client.get(self.url(&format!(
                "/sandboxes/{sandbox_id}/processes/{pid}/output"
            ))))
            .send()
            .await
            .map_err(|e| SandboxError::ConnectionLost(format!("output stream failed: {e}")))?;
        Self::check(resp, "process output").await
    }

    /// Long-polls until the process exits.
    pub async fn wait_process(
        &self,
        sandbox_id: &str,
        pid: i64,
    ) -> Result<WaitResponse, SandboxError> {
        let resp = self
            .auth(self.client.get(self.url(&format!(
                "/sandboxes/{sandbox_id}/processes/{pid}/wait"
            ))))
            .send()
            .await
            .map_err(|e| SandboxError::ConnectionLost(format!("process wait failed: {e}")))?;
        let resp = Self::check(resp, "process wait").await?;
        resp.json::<WaitResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse wait response: {e}")))
    }

    pub async fn send_stdin(
        &self,
        sandbox_id: &str,
        pid: i64,
        data: &[u8],
    ) -> Result<(), SandboxError> {
        let resp = self
            .auth(self.client.post(self.url(&format!(
                "/sandboxes/{sandbox_id}/processes/{pid}/stdin"
            ))))
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("stdin write failed: {e}")))?;
        Self::check(resp, "stdin").await?;
        Ok(())
    }

    pub async fn kill_process(&self, sandbox_id: &str, pid: i64) -> Result<(), SandboxError> {
        let resp = self
            .auth(
                self.client
                    .delete(self.url(&format!("/sandboxes/{sandbox_id}/processes/{pid}"))),
            )
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("process kill failed: {e}")))?;
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(resp, "process kill").await?;
        Ok(())
    }

    pub async fn put_file(
        &self,
        sandbox_id: &str,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), SandboxError> {
        let resp = self
            .auth(
                self.client
                    .put(self.url(&format!("/sandboxes/{sandbox_id}/files")))
                    .query(&[("path", path)]),
            )
            .body(bytes)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("file write failed: {e}")))?;
        Self::check(resp, "file write").await?;
        Ok(())
    }

    pub async fn get_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        let resp = self
            .auth(
                self.client
                    .get(self.url(&format!("/sandboxes/{sandbox_id}/files")))
                    .query(&[("path", path)]),
            )
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("file read failed: {e}")))?;
        if resp.status().as_u16() == 404 {
            return Err(SandboxError::NotFound(format!("file {path}")));
        }
        let resp = Self::check(resp, "file read").await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SandboxError::Backend(format!("file read body failed: {e}")))?;
        Ok(bytes.to_vec())
    }

    pub async fn create_pty(
        &self,
        sandbox_id: &str,
        req: &PtyCreateRequest,
    ) -> Result<PtyResponse, SandboxError> {
        let resp = self
            .auth(
                self.client
                    .post(self.url(&format!("/sandboxes/{sandbox_id}/pty"))),
            )
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("pty create failed: {e}")))?;
        let resp = Self::check(resp, "pty create").await?;
        resp.json::<PtyResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse pty response: {e}")))
    }

    pub async fn pty_output(
        &self,
        sandbox_id: &str,
        pid: i64,
    ) -> Result<reqwest::Response, SandboxError> {
        let resp = self
            .auth(
                self.client
                    .get(self.url(&format!("/sandboxes/{sandbox_id}/pty/{pid}/output"))),
            )
            .send()
            .await
            .map_err(|e| SandboxError::ConnectionLost(format!("pty stream failed: {e}")))?;
        Self::check(resp, "pty output").await
    }

    pub async fn pty_input(
        &self,
        sandbox_id: &str,
        pid: i64,
        data: &[u8],
    ) -> Result<(), SandboxError> {
        let resp = self
            .auth(
                self.client
                    .post(self.url(&format!("/sandboxes/{sandbox_id}/pty/{pid}/input"))),
            )
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("pty input failed: {e}")))?;
        Self::check(resp, "pty input").await?;
        Ok(())
    }

    pub async fn resize_pty_process(
        &self,
        sandbox_id: &str,
        pid: i64,
        size: PtySize,
    ) -> Result<(), SandboxError> {
        let resp = self
            .auth(
                self.client
                    .patch(self.url(&format!("/sandboxes/{sandbox_id}/pty/{pid}"))),
            )
            .json(&PtyCreateRequest {
                rows: size.rows,
                cols: size.cols,
            })
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("pty resize failed: {e}")))?;
        Self::check(resp, "pty resize").await?;
        Ok(())
    }

    pub async fn kill_pty_process(&self, sandbox_id: &str, pid: i64) -> Result<(), SandboxError> {
        let resp = self
            .auth(
                self.client
                    .delete(self.url(&format!("/sandboxes/{sandbox_id}/pty/{pid}"))),
            )
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("pty kill failed: {e}")))?;
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(resp, "pty kill").await?;
        Ok(())
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn error_for_status(context: &str, status: u16, body: &str) -> SandboxError {
    let detail = format!("{context} returned {status}: {body}");
    match status {
        401 | 403 => SandboxError::Auth(detail),
        404 => SandboxError::NotFound(detail),
        429 => SandboxError::RateLimited(detail),
        _ if body.to_ascii_lowercase().contains("rate limit") => SandboxError::RateLimited(detail),
        _ if context == "create" => SandboxError::CreateFailed(detail),
        _ => SandboxError::Backend(detail),
    }
}

/// Split a streamed ndjson response body into parsed lines.
pub(crate) fn ndjson_lines(
    resp: reqwest::Response,
) -> impl futures::Stream<Item = Result<OutputLine, SandboxError>> + Send {
    async_stream::try_stream! {
        let mut body = resp.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| SandboxError::ConnectionLost(format!("stream read failed: {e}")))?;
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: OutputLine = serde_json::from_str(line.trim())
                    .map_err(|e| SandboxError::Serde(format!("bad stream line: {e}")))?;
                yield parsed;
            }
        }
    }
}

// ── Provider ────────────────────────────────────────────────────────

struct RemotePty {
    pid: i64,
    reader: JoinHandle<()>,
}

pub struct RemoteVmProvider {
    client: RemoteVmClient,
    config: RemoteVmConfig,
    /// Sandboxes we have verified alive this process lifetime.
    handles: RwLock<BTreeMap<String, SandboxStatus>>,
    ptys: RwLock<BTreeMap<String, RemotePty>>,
}

impl RemoteVmProvider {
    pub fn new(config: RemoteVmConfig) -> Self {
        let client = RemoteVmClient::new(config.api_base_url.clone(), config.api_key.clone());
        Self {
            client,
            config,
            handles: RwLock::new(BTreeMap::new()),
            ptys: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn client(&self) -> &RemoteVmClient {
        &self.client
    }

    fn preview_host(&self, sandbox_id: &str, port: u16) -> String {
        format!("https://{port}-{sandbox_id}.{}", self.config.preview_domain)
    }

    /// Verify liveness, resuming a paused sandbox transparently. A
    /// cached handle still gets one cheap status probe; sandboxes pause
    /// and die underneath us, so a failed probe evicts the entry and
    /// falls through to the full resume path.
    async fn ensure_running(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        if let Some(SandboxStatus::Running) = self.handles.read().await.get(sandbox_id).copied() {
            match self.client.get_sandbox(sandbox_id).await {
                Ok(current) if current.status == SandboxStatus::Running => return Ok(()),
                Ok(_) | Err(_) => {
                    self.handles.write().await.remove(sandbox_id);
                }
            }
        }
        let state = match retry::with_backoff("connect", || async {
            let current = self.client.get_sandbox(sandbox_id).await?;
            if current.status == SandboxStatus::Running {
                return Ok(current);
            }
            self.client.resume_sandbox(sandbox_id).await
        })
        .await
        {
            Ok(state) => state,
            Err(err) => {
                self.handles.write().await.remove(sandbox_id);
                return Err(err);
            }
        };
        self.handles
            .write()
            .await
            .insert(sandbox_id.to_string(), state.status);
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for RemoteVmProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::RemoteVm
    }

    async fn create(&self) -> Result<String, SandboxError> {
        let req = SandboxCreateRequest {
            template: self.config.template.clone(),
            auto_pause_secs: self.config.auto_pause_secs,
        };
        let sandbox =
            retry::with_backoff("create", || self.client.create_sandbox(&req)).await?;
        self.handles
            .write()
            .await
            .insert(sandbox.sandbox_id.clone(), sandbox.status);
        Ok(sandbox.sandbox_id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        match self.ensure_running(sandbox_id).await {
            Ok(()) => Ok(true),
            Err(SandboxError::NotFound(_)) => {
                self.handles.write().await.remove(sandbox_id);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.handles.write().await.remove(sandbox_id);
        if let Err(err) = self.client.delete_sandbox(sandbox_id).await {
            // Deletion is fire-and-forget from the caller's perspective.
            tracing::warn!(sandbox_id = %sandbox_id, error = %err, "sandbox delete failed");
        }
        Ok(())
    }

    async fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult, SandboxError> {
        self.ensure_running(sandbox_id).await?;
        let timeout = options.timeout_secs.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
        let req = CommandRequest {
            command: command.to_string(),
            background: options.background,
            envs: options.envs.clone(),
            cwd: options.cwd.clone(),
            user: options.user.clone(),
            timeout_secs: options.background.then_some(0).or(Some(timeout)),
        };
        if options.background {
            let resp = self.client.run_command(sandbox_id, &req).await?;
            let pid = resp.pid.unwrap_or_default();
            return Ok(CommandResult {
                stdout: format!("Background process started (PID: {pid})"),
                stderr: String::new(),
                exit_code: 0,
            });
        }
        let resp = enforce_timeout(timeout, self.client.run_command(sandbox_id, &req)).await?;
        Ok(CommandResult {
            stdout: resp.stdout,
            stderr: resp.stderr,
            exit_code: resp.exit_code,
        })
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        self.ensure_running(sandbox_id).await?;
        let path = provider::normalize_path(path);
        let bytes = provider::decode_content(&path, content)?;
        self.client.put_file(sandbox_id, &path, bytes).await
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent, SandboxError> {
        self.ensure_running(sandbox_id).await?;
        let path = provider::normalize_path(path);
        let bytes = self.client.get_file(sandbox_id, &path).await?;
        Ok(provider::encode_content(&path, &bytes))
    }

    async fn create_pty(
        &self,
        sandbox_id: &str,
        size: PtySize,
        output: PtyOutput,
    ) -> Result<PtySession, SandboxError> {
        self.ensure_running(sandbox_id).await?;
        let size = size.clamped();
        let pty = self
            .client
            .create_pty(
                sandbox_id,
                &PtyCreateRequest {
                    rows: size.rows,
                    cols: size.cols,
                },
            )
            .await?;

        let stream_resp = self.client.pty_output(sandbox_id, pty.pid).await?;
        let reader = tokio::spawn(async move {
            let lines = ndjson_lines(stream_resp);
            futures::pin_mut!(lines);
            while let Some(line) = lines.next().await {
                match line {
                    Ok(OutputLine { data: Some(b64), .. }) => {
                        if let Ok(bytes) = BASE64.decode(b64.as_bytes()) {
                            output.push(bytes);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(error = %err, "pty output stream ended");
                        break;
                    }
                }
            }
        });

        let session_id = uuid::Uuid::new_v4().to_string();
        self.ptys.write().await.insert(
            session_id.clone(),
            RemotePty {
                pid: pty.pid,
                reader,
            },
        );
        Ok(PtySession {
            id: session_id,
            pid: Some(pty.pid),
            rows: size.rows,
            cols: size.cols,
        })
    }

    async fn send_pty_input(
        &self,
        sandbox_id: &str,
        pty_id: &str,
        data: &[u8],
    ) -> Result<(), SandboxError> {
        let pid = match self.ptys.read().await.get(pty_id) {
            Some(pty) => pty.pid,
            None => return Ok(()),
        };
        self.client.pty_input(sandbox_id, pid, data).await
    }

    async fn resize_pty(
        &self,
        sandbox_id: &str,
        pty_id: &str,
        size: PtySize,
    ) -> Result<(), SandboxError> {
        let pid = match self.ptys.read().await.get(pty_id) {
            Some(pty) => pty.pid,
            None => return Ok(()),
        };
        self.client
            .resize_pty_process(sandbox_id, pid, size.clamped())
            .await
    }

    async fn kill_pty(&self, sandbox_id: &str, pty_id: &str) -> Result<(), SandboxError> {
        let Some(pty) = self.ptys.write().await.remove(pty_id) else {
            return Ok(());
        };
        pty.reader.abort();
        self.client.kill_pty_process(sandbox_id, pty.pid).await
    }

    async fn preview_url(&self, sandbox_id: &str, port: u16) -> Option<String> {
        Some(self.preview_host(sandbox_id, port))
    }

    async fn get_ide_url(&self, sandbox_id: &str) -> Result<Option<String>, SandboxError> {
        let probe = self
            .execute(
                sandbox_id,
                &format!("pgrep -f 'openvscode-server' >/dev/null || nohup openvscode-server --host 0.0.0.0 --port {IDE_PORT} --without-connection-token >/dev/null 2>&1 & sleep 0.2; pgrep -f 'openvscode-server' >/dev/null"),
                ExecOptions::default(),
            )
            .await?;
        if !probe.success() {
            return Ok(None);
        }
        Ok(Some(format!(
            "{}/?folder={HOME_DIR}",
            self.preview_host(sandbox_id, IDE_PORT)
        )))
    }

    async fn cleanup(&self) {
        let mut ptys = self.ptys.write().await;
        for (id, pty) in std::mem::take(&mut *ptys) {
            tracing::debug!(pty_id = %id, "killing pty during cleanup");
            pty.reader.abort();
        }
        self.handles.write().await.clear();
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn client_trims_trailing_slash() {
        let c = RemoteVmClient::new("https://api.example.com/".into(), "key".into());
        assert_eq!(c.base_url, "https://api.example.com");
        assert_eq!(c.url("/sandboxes/abc"), "https://api.example.com/sandboxes/abc");
    }

    #[test]
    fn create_request_serializes() {
        let req = SandboxCreateRequest {
            template: "base".into(),
            auto_pause_secs: 3000,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["template"], "base");
        assert_eq!(json["auto_pause_secs"], 3000);
    }

    #[test]
    fn command_request_omits_empty_fields() {
        let req = CommandRequest {
            command: "ls".into(),
            background: false,
            envs: BTreeMap::new(),
            cwd: None,
            user: None,
            timeout_secs: Some(120),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("envs").is_none());
        assert!(json.get("cwd").is_none());
        assert_eq!(json["timeout_secs"], 120);
    }

    #[test]
    fn sandbox_response_deserializes() {
        let json = r#"{"sandbox_id":"sbx-1","status":"paused"}"#;
        let resp: SandboxResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.sandbox_id, "sbx-1");
        assert_eq!(resp.status, SandboxStatus::Paused);
    }

    #[test]
    fn command_response_tolerates_missing_fields() {
        let resp: CommandResponse = serde_json::from_str(r#"{"pid":42}"#).unwrap();
        assert_eq!(resp.pid, Some(42));
        assert_eq!(resp.exit_code, 0);
        assert!(resp.stdout.is_empty());
    }

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert!(matches!(
            error_for_status("get", 401, ""),
            SandboxError::Auth(_)
        ));
        assert!(matches!(
            error_for_status("get", 403, ""),
            SandboxError::Auth(_)
        ));
        assert!(matches!(
            error_for_status("get", 404, ""),
            SandboxError::NotFound(_)
        ));
        assert!(matches!(
            error_for_status("get", 429, ""),
            SandboxError::RateLimited(_)
        ));
        assert!(matches!(
            error_for_status("create", 500, "rate limit exceeded"),
            SandboxError::RateLimited(_)
        ));
        assert!(matches!(
            error_for_status("create", 500, "boom"),
            SandboxError::CreateFailed(_)
        ));
        assert!(matches!(
            error_for_status("command", 500, "boom"),
            SandboxError::Backend(_)
        ));
    }

    #[test]
    fn preview_url_uses_port_subdomain() {
        let provider = RemoteVmProvider::new(RemoteVmConfig {
            api_base_url: "https://api.example.com".into(),
            api_key: "k".into(),
            template: "base".into(),
            preview_domain: "vms.example.dev".into(),
            auto_pause_secs: 3000,
        });
        assert_eq!(
            provider.preview_host("sbx-1", 3000),
            "https://3000-sbx-1.vms.example.dev"
        );
    }

    /// Answers every request with the same canned JSON body and counts
    /// connections (one per request, the response closes the socket).
    async fn scripted_service(
        body: &'static str,
    ) -> (std::net::SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (addr, hits)
    }

    #[tokio::test]
    async fn connect_probes_liveness_even_with_a_cached_handle() {
        let (addr, hits) =
            scripted_service(r#"{"sandbox_id":"sbx-1","status":"running"}"#).await;
        let provider = RemoteVmProvider::new(RemoteVmConfig {
            api_base_url: format!("http://{addr}"),
            api_key: "k".into(),
            template: "base".into(),
            preview_domain: "vms.example.dev".into(),
            auto_pause_secs: 3000,
        });

        assert!(provider.connect("sbx-1").await.unwrap());
        let after_first = hits.load(std::sync::atomic::Ordering::SeqCst);
        assert!(provider.connect("sbx-1").await.unwrap());
        assert!(
            hits.load(std::sync::atomic::Ordering::SeqCst) > after_first,
            "cached handle skipped the status probe"
        );
    }

    #[test]
    fn output_line_deserializes_both_shapes() {
        let process: OutputLine =
            serde_json::from_str(r#"{"stream":"stdout","data":"hello"}"#).unwrap();
        assert_eq!(process.stream.as_deref(), Some("stdout"));
        let pty: OutputLine = serde_json::from_str(r#"{"data":"aGk="}"#).unwrap();
        assert!(pty.stream.is_none());
        assert_eq!(pty.data.as_deref(), Some("aGk="));
    }
}
