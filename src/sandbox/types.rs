use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which backend technology a provider instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    RemoteVm,
    Docker,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::RemoteVm => "remote_vm",
            ProviderKind::Docker => "docker",
        }
    }
}

/// Result of one command execution inside a sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for `SandboxProvider::execute`.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Return immediately with a pid reference instead of waiting.
    pub background: bool,
    pub envs: BTreeMap<String, String>,
    /// Foreground timeout in seconds; the default is applied when unset.
    pub timeout_secs: Option<u64>,
    pub cwd: Option<String>,
    pub user: Option<String>,
}

/// One entry returned by `list_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the sandbox home directory.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: u64,
    pub modified: i64,
    pub is_binary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
}

/// File content read out of a sandbox. Binary payloads travel base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub is_binary: bool,
}

/// Dimensions of a pseudo-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        PtySize { rows: 24, cols: 80 }
    }
}

impl PtySize {
    /// Backends reject zero-sized terminals, so both axes clamp to 1.
    pub fn clamped(self) -> Self {
        PtySize {
            rows: self.rows.max(1),
            cols: self.cols.max(1),
        }
    }
}

/// A live terminal attached to one sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtySession {
    pub id: String,
    pub pid: Option<i64>,
    pub rows: u16,
    pub cols: u16,
}

/// A named filesystem snapshot. Ordering is by `created_at`, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// An externally reachable URL for a port the sandbox is listening on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewLink {
    pub port: u16,
    pub url: String,
}

/// One environment-variable export from the sandbox shell profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    pub key: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_round_trips_through_serde() {
        let json = serde_json::to_string(&ProviderKind::RemoteVm).unwrap();
        assert_eq!(json, "\"remote_vm\"");
        let back: ProviderKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProviderKind::RemoteVm);
    }

    #[test]
    fn command_result_success_only_on_zero() {
        assert!(CommandResult::default().success());
        let failed = CommandResult {
            exit_code: 2,
            ..Default::default()
        };
        assert!(!failed.success());
    }

    #[test]
    fn pty_size_defaults_to_80x24() {
        let size = PtySize::default();
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
    }

    #[test]
    fn pty_size_clamps_zero_dimensions() {
        let size = PtySize { rows: 0, cols: 0 }.clamped();
        assert_eq!(size, PtySize { rows: 1, cols: 1 });
        let untouched = PtySize { rows: 50, cols: 120 }.clamped();
        assert_eq!(untouched, PtySize { rows: 50, cols: 120 });
    }

    #[test]
    fn file_entry_serializes_kind_as_type() {
        let entry = FileEntry {
            path: "src/main.rs".into(),
            kind: FileKind::File,
            size: 10,
            modified: 1700000000,
            is_binary: false,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "file");
    }

    #[test]
    fn types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProviderKind>();
        assert_send_sync::<CommandResult>();
        assert_send_sync::<ExecOptions>();
        assert_send_sync::<FileEntry>();
        assert_send_sync::<PtySession>();
        assert_send_sync::<CheckpointInfo>();
        assert_send_sync::<PreviewLink>();
        assert_send_sync::<SecretEntry>();
    }
}
