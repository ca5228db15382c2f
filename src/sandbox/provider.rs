use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::queue::BoundedQueue;

use super::checkpoint;
use super::error::SandboxError;
use super::types::{
    CheckpointInfo, CommandResult, ExecOptions, FileContent, FileEntry, FileKind, PreviewLink,
    ProviderKind, PtySession, PtySize, SecretEntry,
};

// ── shared constants ──────────────────────────────────────────────────

pub const HOME_DIR: &str = "/home/user";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
/// The hard wall-clock ceiling sits slightly above the backend's own
/// timeout so the backend gets first chance to report.
pub const TIMEOUT_GRACE_SECS: u64 = 5;
pub const IDE_PORT: u16 = 8765;

/// Ports that are never surfaced as preview links (control plane, ssh,
/// tunnels, the IDE itself).
pub const EXCLUDED_PREVIEW_PORTS: &[u16] = &[49982, 49983, 22, 4040, 3456, IDE_PORT];

/// Shell-profile variables that are not user secrets.
pub const SYSTEM_VARIABLES: &[&str] = &[
    "SHELL", "PWD", "LOGNAME", "HOME", "USER", "SHLVL", "PS1", "PATH", "_", "NVM_DIR",
    "NODE_VERSION", "TERM",
];

pub const LISTENING_PORTS_COMMAND: &str =
    "ss -tuln | grep LISTEN | awk '{print $5}' | sed 's/.*://g' | grep -E '^[0-9]+$' | sort -u";

/// Extensions treated as binary; their content is base64 on the wire.
pub const BINARY_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "a", "lib", "obj", "o", "zip", "tar", "gz", "bz2", "xz", "7z",
    "rar", "jpg", "jpeg", "png", "gif", "bmp", "ico", "tiff", "webp", "svg", "mp4", "avi", "mkv",
    "mov", "wmv", "flv", "webm", "mp3", "wav", "flac", "ogg", "wma", "aac", "pdf", "doc", "docx",
    "xls", "xlsx", "ppt", "pptx", "bin", "dat", "db", "sqlite", "sqlite3", "woff", "woff2", "ttf",
    "otf", "eot", "class", "jar", "war", "ear", "pyc", "pyo", "pyd",
];

/// VCS/build/cache noise skipped by `list_files`.
pub const EXCLUDED_FILE_PATTERNS: &[&str] = &[
    "*/node_modules/*",
    "*/node_modules",
    "*/.*",
    "*/__pycache__/*",
    "*/__pycache__",
    "*.pyc",
    "*.log",
    "*/dist/*",
    "*/dist",
    "*/build/*",
    "*/build",
    "package-lock.json",
    "*/package-lock.json",
    "bun.lock",
    "*/bun.lock",
];

/// Queue handed to the backend at PTY creation; the backend pushes raw
/// output bytes, the session manager owns capacity and overflow policy.
pub type PtyOutput = Arc<BoundedQueue<Vec<u8>>>;

// ── provider contract ─────────────────────────────────────────────────

/// Capability contract every sandbox backend implements.
///
/// Backend-independent algorithms (file listing, preview links, secrets,
/// checkpoints) are default methods built on `execute`, so variants only
/// supply backend primitives. Mutating calls assume a single writer per
/// sandbox; callers serialize if they need more.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Create a fresh sandbox and return its id.
    async fn create(&self) -> Result<String, SandboxError>;

    /// Reuse a tracked live handle or reconnect transparently.
    /// Returns false only when the sandbox is genuinely gone.
    async fn connect(&self, sandbox_id: &str) -> Result<bool, SandboxError>;

    /// Idempotent; a missing sandbox is not an error.
    async fn delete(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    /// Run a shell command. Foreground calls resolve with the full
    /// result; background calls return a pid reference immediately.
    async fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult, SandboxError>;

    /// `content` is plain text, or base64 when the path classifies as
    /// binary (`is_binary_path`).
    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent, SandboxError>;

    /// Start an interactive shell PTY; output bytes are pushed into
    /// `output` as they arrive.
    async fn create_pty(
        &self,
        sandbox_id: &str,
        size: PtySize,
        output: PtyOutput,
    ) -> Result<PtySession, SandboxError>;

    async fn send_pty_input(
        &self,
        sandbox_id: &str,
        pty_id: &str,
        data: &[u8],
    ) -> Result<(), SandboxError>;

    async fn resize_pty(
        &self,
        sandbox_id: &str,
        pty_id: &str,
        size: PtySize,
    ) -> Result<(), SandboxError>;

    async fn kill_pty(&self, sandbox_id: &str, pty_id: &str) -> Result<(), SandboxError>;

    /// Externally reachable URL for a port, or None when the backend
    /// cannot address it (e.g. unpublished container port).
    async fn preview_url(&self, sandbox_id: &str, port: u16) -> Option<String>;

    /// None until the web IDE is confirmed running.
    async fn get_ide_url(&self, sandbox_id: &str) -> Result<Option<String>, SandboxError>;

    /// Kill all live PTYs and drop cached handles.
    async fn cleanup(&self);

    // ── shared algorithms ─────────────────────────────────────────────

    /// Walk files and directories under `path` (the sandbox home when
    /// None). `excluded_patterns` overrides the default noise filters.
    async fn list_files(
        &self,
        sandbox_id: &str,
        path: Option<&str>,
        excluded_patterns: Option<&[&str]>,
    ) -> Result<Vec<FileEntry>, SandboxError> {
        let base = normalize_path(path.unwrap_or(""));
        let patterns = excluded_patterns.unwrap_or(EXCLUDED_FILE_PATTERNS);
        let result = self
            .execute(
                sandbox_id,
                &build_list_files_command(&base, patterns),
                ExecOptions::default(),
            )
            .await?;
        Ok(parse_list_files_output(&result.stdout))
    }

    async fn get_preview_links(
        &self,
        sandbox_id: &str,
    ) -> Result<Vec<PreviewLink>, SandboxError> {
        let result = self
            .execute(sandbox_id, LISTENING_PORTS_COMMAND, ExecOptions::default())
            .await?;
        let mut links = Vec::new();
        for port in parse_listening_ports(&result.stdout) {
            if let Some(url) = self.preview_url(sandbox_id, port).await {
                links.push(PreviewLink { port, url });
            }
        }
        Ok(links)
    }

    async fn get_secrets(&self, sandbox_id: &str) -> Result<Vec<SecretEntry>, SandboxError> {
        let result = self
            .execute(
                sandbox_id,
                "grep '^export ' ~/.bashrc 2>/dev/null || true",
                ExecOptions::default(),
            )
            .await?;
        Ok(parse_exports(&result.stdout))
    }

    async fn add_secret(
        &self,
        sandbox_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SandboxError> {
        validate_secret_key(key)?;
        // Re-source so commands in the same session see the value.
        let command = format!(
            "{} && source ~/.bashrc",
            format_export_command(key, value)
        );
        let result = self
            .execute(sandbox_id, &command, ExecOptions::default())
            .await?;
        if !result.success() {
            return Err(SandboxError::Backend(format!(
                "failed to add secret {key}: {}",
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn delete_secret(&self, sandbox_id: &str, key: &str) -> Result<(), SandboxError> {
        validate_secret_key(key)?;
        let command = format!("sed -i '/^export {key}=/d' ~/.bashrc");
        let result = self
            .execute(sandbox_id, &command, ExecOptions::default())
            .await?;
        if !result.success() {
            return Err(SandboxError::Backend(format!(
                "failed to delete secret {key}: {}",
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn create_checkpoint(
        &self,
        sandbox_id: &str,
        checkpoint_id: &str,
    ) -> Result<(), SandboxError> {
        checkpoint::create(self, sandbox_id, checkpoint_id).await
    }

    async fn restore_checkpoint(
        &self,
        sandbox_id: &str,
        checkpoint_id: &str,
    ) -> Result<(), SandboxError> {
        checkpoint::restore(self, sandbox_id, checkpoint_id).await
    }

    async fn list_checkpoints(
        &self,
        sandbox_id: &str,
    ) -> Result<Vec<CheckpointInfo>, SandboxError> {
        checkpoint::list(self, sandbox_id).await
    }
}

// ── shared helpers ────────────────────────────────────────────────────

/// Make a path absolute under the sandbox home directory.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == "." {
        return HOME_DIR.to_string();
    }
    if trimmed.starts_with('/') {
        return trimmed.to_string();
    }
    let relative = trimmed.strip_prefix("./").unwrap_or(trimmed);
    format!("{HOME_DIR}/{relative}")
}

pub fn is_binary_path(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decode wire content into raw bytes (base64 for binary paths).
pub fn decode_content(path: &str, content: &str) -> Result<Vec<u8>, SandboxError> {
    if is_binary_path(path) {
        BASE64
            .decode(content.trim())
            .map_err(|e| SandboxError::Serde(format!("invalid base64 for {path}: {e}")))
    } else {
        Ok(content.as_bytes().to_vec())
    }
}

/// Encode raw bytes for the wire (base64 for binary paths).
pub fn encode_content(path: &str, bytes: &[u8]) -> FileContent {
    let is_binary = is_binary_path(path);
    let content = if is_binary {
        BASE64.encode(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };
    FileContent {
        path: path.to_string(),
        content,
        is_binary,
    }
}

/// `export KEY='value'` with embedded single quotes escaped as `'\''`.
pub fn format_export_command(key: &str, value: &str) -> String {
    let escaped = value.replace('\'', "'\\''");
    format!("echo \"export {key}='{escaped}'\" >> ~/.bashrc")
}

fn validate_secret_key(key: &str) -> Result<(), SandboxError> {
    let well_formed = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(SandboxError::Backend(format!("invalid secret key: {key:?}")))
    }
}

/// Parse `export KEY=value` lines, skipping system variables.
pub fn parse_exports(stdout: &str) -> Vec<SecretEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("export ")?;
            let (key, raw) = rest.split_once('=')?;
            let key = key.trim();
            if key.is_empty() || SYSTEM_VARIABLES.contains(&key) {
                return None;
            }
            let value = raw
                .trim()
                .trim_matches('\'')
                .trim_matches('"')
                .to_string();
            Some(SecretEntry {
                key: key.to_string(),
                value,
            })
        })
        .collect()
}

/// Unique numeric listening ports, internal/reserved ports removed.
pub fn parse_listening_ports(stdout: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u16>().ok())
        .filter(|port| !EXCLUDED_PREVIEW_PORTS.contains(port))
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

pub fn build_list_files_command(base: &str, excluded_patterns: &[&str]) -> String {
    let filters = excluded_patterns
        .iter()
        .map(|p| {
            if p.contains('/') {
                format!("-not -path '{p}'")
            } else {
                format!("-not -name '{p}'")
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "find {base} -mindepth 1 \\( -type f -o -type d \\) {filters} \
         -printf '%y|%s|%T@|%p\\n' 2>/dev/null || true"
    )
}

/// Parse `y|size|epoch|path` lines from find, paths relative to home.
pub fn parse_list_files_output(stdout: &str) -> Vec<FileEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(4, '|');
            let kind = match parts.next()? {
                "f" => FileKind::File,
                "d" => FileKind::Directory,
                _ => return None,
            };
            let size: u64 = parts.next()?.parse().ok()?;
            let modified = parts.next()?.parse::<f64>().ok()? as i64;
            let path = parts.next()?;
            let relative = path
                .strip_prefix(HOME_DIR)
                .map(|p| p.trim_start_matches('/'))
                .unwrap_or(path)
                .to_string();
            let is_binary = kind == FileKind::File && is_binary_path(path);
            Some(FileEntry {
                path: relative,
                kind,
                size,
                modified,
                is_binary,
            })
        })
        .collect()
}

/// Hard wall-clock ceiling for foreground execution, slightly above the
/// backend's own timeout. The backend-side process is left detached.
pub(crate) async fn enforce_timeout<T>(
    timeout_secs: u64,
    fut: impl Future<Output = Result<T, SandboxError>> + Send,
) -> Result<T, SandboxError> {
    match tokio::time::timeout(Duration::from_secs(timeout_secs + TIMEOUT_GRACE_SECS), fut).await {
        Ok(result) => result,
        Err(_) => Err(SandboxError::Timeout(timeout_secs)),
    }
}
