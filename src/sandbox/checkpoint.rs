use chrono::{DateTime, Utc};

use super::error::SandboxError;
use super::provider::SandboxProvider;
use super::types::{CheckpointInfo, ExecOptions};

pub const CHECKPOINT_BASE_DIR: &str = "/home/user/.checkpoints";
pub const MAX_CHECKPOINTS: usize = 20;

/// Paths never worth snapshotting: caches, build output, logs.
pub const EXCLUDE_PATTERNS: &[&str] = &[
    ".checkpoints",
    ".cache",
    "__pycache__",
    "*.pyc",
    "*.pyo",
    "*.log",
    ".DS_Store",
    "dist",
    "build",
    ".next",
    ".nuxt",
];

/// Checkpoint ids become directory names, so only a conservative
/// identifier alphabet is trusted as a path segment.
pub fn validate_checkpoint_id(id: &str) -> Result<(), SandboxError> {
    let well_formed = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if well_formed {
        Ok(())
    } else {
        Err(SandboxError::NotFound(format!(
            "invalid checkpoint id: {id:?}"
        )))
    }
}

fn checkpoint_dir(id: &str) -> String {
    format!("{CHECKPOINT_BASE_DIR}/{id}")
}

fn exclude_flags() -> String {
    EXCLUDE_PATTERNS
        .iter()
        .map(|p| format!("--exclude='{p}'"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// rsync from the working tree into a fresh checkpoint directory.
/// With a predecessor, unchanged files hard-link against it instead of
/// being copied, so each checkpoint costs only its diff.
pub fn build_create_command(id: &str, previous: Option<&str>) -> String {
    let dir = checkpoint_dir(id);
    let link_dest = previous
        .map(|prev| format!(" --link-dest={}", checkpoint_dir(prev)))
        .unwrap_or_default();
    format!(
        "mkdir -p {CHECKPOINT_BASE_DIR} && rsync -a --delete {}{link_dest} /home/user/ {dir}/",
        exclude_flags()
    )
}

/// One-way sync from a checkpoint back into the working tree.
pub fn build_restore_command(id: &str) -> String {
    let dir = checkpoint_dir(id);
    format!(
        "rsync -a --delete {} {dir}/ /home/user/",
        exclude_flags()
    )
}

pub fn build_exists_command(id: &str) -> String {
    format!("test -d {}", checkpoint_dir(id))
}

pub fn build_remove_command(id: &str) -> String {
    format!("rm -rf {}", checkpoint_dir(id))
}

/// Emits `id|mtime` per checkpoint directory. The epoch mtime is the sole
/// ordering source for both retention pruning and link-dest selection.
pub fn build_list_command() -> String {
    format!(
        "cd {CHECKPOINT_BASE_DIR} 2>/dev/null && \
         for dir in */; do echo \"${{dir%/}}|$(stat -c %Y \"${{dir%/}}\")\"; done"
    )
}

/// Parse `id|epoch` lines into checkpoint infos, newest first.
pub fn parse_list_output(stdout: &str) -> Vec<CheckpointInfo> {
    let mut entries: Vec<CheckpointInfo> = stdout
        .lines()
        .filter_map(|line| {
            let (id, epoch) = line.trim().split_once('|')?;
            let secs: i64 = epoch.trim().parse().ok()?;
            let created_at: DateTime<Utc> = DateTime::from_timestamp(secs, 0)?;
            Some(CheckpointInfo {
                id: id.to_string(),
                created_at,
            })
        })
        .collect();
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    entries
}

pub async fn list<P>(provider: &P, sandbox_id: &str) -> Result<Vec<CheckpointInfo>, SandboxError>
where
    P: SandboxProvider + ?Sized,
{
    let result = provider
        .execute(sandbox_id, &build_list_command(), ExecOptions::default())
        .await?;
    // A missing base directory means no checkpoints yet, not a failure.
    if !result.success() {
        return Ok(Vec::new());
    }
    Ok(parse_list_output(&result.stdout))
}

pub async fn create<P>(provider: &P, sandbox_id: &str, id: &str) -> Result<(), SandboxError>
where
    P: SandboxProvider + ?Sized,
{
    validate_checkpoint_id(id)?;
    let existing = list(provider, sandbox_id).await?;
    let previous = existing.first().map(|cp| cp.id.clone());

    let command = build_create_command(id, previous.as_deref());
    let result = provider
        .execute(sandbox_id, &command, ExecOptions::default())
        .await?;
    if !result.success() {
        // Never leave a half-written snapshot behind.
        let _ = provider
            .execute(sandbox_id, &build_remove_command(id), ExecOptions::default())
            .await;
        return Err(SandboxError::Backend(format!(
            "checkpoint sync failed (exit {}): {}",
            result.exit_code,
            result.stderr.trim()
        )));
    }
    tracing::info!(sandbox_id = %sandbox_id, checkpoint_id = %id, "checkpoint created");

    prune(provider, sandbox_id).await
}

pub async fn restore<P>(provider: &P, sandbox_id: &str, id: &str) -> Result<(), SandboxError>
where
    P: SandboxProvider + ?Sized,
{
    validate_checkpoint_id(id)?;
    let exists = provider
        .execute(sandbox_id, &build_exists_command(id), ExecOptions::default())
        .await?;
    if !exists.success() {
        return Err(SandboxError::NotFound(format!("checkpoint {id}")));
    }
    let result = provider
        .execute(sandbox_id, &build_restore_command(id), ExecOptions::default())
        .await?;
    if !result.success() {
        return Err(SandboxError::Backend(format!(
            "checkpoint restore failed (exit {}): {}",
            result.exit_code,
            result.stderr.trim()
        )));
    }
    tracing::info!(sandbox_id = %sandbox_id, checkpoint_id = %id, "checkpoint restored");
    Ok(())
}

/// Delete checkpoints beyond the retention limit, oldest first.
async fn prune<P>(provider: &P, sandbox_id: &str) -> Result<(), SandboxError>
where
    P: SandboxProvider + ?Sized,
{
    let entries = list(provider, sandbox_id).await?;
    if entries.len() <= MAX_CHECKPOINTS {
        return Ok(());
    }
    for stale in &entries[MAX_CHECKPOINTS..] {
        tracing::debug!(sandbox_id = %sandbox_id, checkpoint_id = %stale.id, "pruning checkpoint");
        let _ = provider
            .execute(
                sandbox_id,
                &build_remove_command(&stale.id),
                ExecOptions::default(),
            )
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids_pass() {
        assert!(validate_checkpoint_id("c1").is_ok());
        assert!(validate_checkpoint_id("a-b_C9").is_ok());
        assert!(validate_checkpoint_id(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn hostile_ids_are_rejected() {
        assert!(validate_checkpoint_id("").is_err());
        assert!(validate_checkpoint_id("../etc").is_err());
        assert!(validate_checkpoint_id("a b").is_err());
        assert!(validate_checkpoint_id("a;rm -rf /").is_err());
        assert!(validate_checkpoint_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn first_checkpoint_has_no_link_dest() {
        let cmd = build_create_command("c1", None);
        assert!(cmd.contains("mkdir -p /home/user/.checkpoints"));
        assert!(cmd.contains("rsync -a --delete"));
        assert!(cmd.contains("/home/user/ /home/user/.checkpoints/c1/"));
        assert!(!cmd.contains("--link-dest"));
    }

    #[test]
    fn incremental_checkpoint_links_against_predecessor() {
        let cmd = build_create_command("c2", Some("c1"));
        assert!(cmd.contains("--link-dest=/home/user/.checkpoints/c1"));
        assert!(cmd.contains("/home/user/.checkpoints/c2/"));
    }

    #[test]
    fn create_command_excludes_ephemeral_paths() {
        let cmd = build_create_command("c1", None);
        assert!(cmd.contains("--exclude='.checkpoints'"));
        assert!(!cmd.contains("--exclude='node_modules'"));
        assert!(cmd.contains("--exclude='*.log'"));
    }

    #[test]
    fn restore_syncs_checkpoint_into_working_tree() {
        let cmd = build_restore_command("c1");
        assert!(cmd.starts_with("rsync -a --delete"));
        assert!(cmd.ends_with("/home/user/.checkpoints/c1/ /home/user/"));
    }

    #[test]
    fn list_output_parses_and_sorts_newest_first() {
        let stdout = "old|1700000000\nnew|1700000500\nmid|1700000250\n";
        let entries = parse_list_output(stdout);
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn list_output_skips_garbage_lines() {
        let stdout = "good|1700000000\nnot-a-line\nbad|not-a-number\n";
        let entries = parse_list_output(stdout);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "good");
    }
}
