pub mod checkpoint;
pub mod docker;
pub mod error;
pub mod provider;
pub mod remote;
pub mod types;

use std::sync::Arc;

use crate::config::Settings;

pub use error::SandboxError;
pub use provider::SandboxProvider;
pub use types::ProviderKind;

/// Select a backend implementation from the configuration tag.
pub fn build_provider(settings: &Settings) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
    match settings.provider {
        ProviderKind::RemoteVm => Ok(Arc::new(remote::RemoteVmProvider::new(
            settings.remote.clone(),
        ))),
        ProviderKind::Docker => Ok(Arc::new(docker::DockerProvider::new(
            settings.docker.clone(),
        )?)),
    }
}

#[cfg(test)]
pub(crate) mod harness {
    //! Test double that runs provider commands against a real shell in a
    //! temporary directory standing in for the sandbox home.

    use async_trait::async_trait;

    use super::error::SandboxError;
    use super::provider::{self, HOME_DIR, PtyOutput, SandboxProvider};
    use super::types::{
        CommandResult, ExecOptions, FileContent, ProviderKind, PtySession, PtySize,
    };

    pub struct ShellProvider {
        root: tempfile::TempDir,
    }

    impl ShellProvider {
        pub fn new() -> Self {
            // The default tempdir prefix is dot-prefixed, and the file
            // listing's hidden-path filter matches anywhere in the full
            // path, so the harness home needs a visible name.
            ShellProvider {
                root: tempfile::Builder::new()
                    .prefix("agentbox-harness-")
                    .tempdir()
                    .expect("tempdir"),
            }
        }

        pub fn root(&self) -> &std::path::Path {
            self.root.path()
        }

        fn map_in(&self, text: &str) -> String {
            text.replace(HOME_DIR, &self.root.path().to_string_lossy())
        }

        fn map_out(&self, text: &str) -> String {
            text.replace(&*self.root.path().to_string_lossy(), HOME_DIR)
        }
    }

    #[async_trait]
    impl SandboxProvider for ShellProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Docker
        }

        async fn create(&self) -> Result<String, SandboxError> {
            Ok("test-sandbox".into())
        }

        async fn connect(&self, _sandbox_id: &str) -> Result<bool, SandboxError> {
            Ok(true)
        }

        async fn delete(&self, _sandbox_id: &str) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn execute(
            &self,
            _sandbox_id: &str,
            command: &str,
            _options: ExecOptions,
        ) -> Result<CommandResult, SandboxError> {
            let output = tokio::process::Command::new("bash")
                .arg("-c")
                .arg(self.map_in(command))
                .env("HOME", self.root.path())
                .current_dir(self.root.path())
                .output()
                .await?;
            Ok(CommandResult {
                stdout: self.map_out(&String::from_utf8_lossy(&output.stdout)),
                stderr: self.map_out(&String::from_utf8_lossy(&output.stderr)),
                exit_code: output.status.code().unwrap_or(-1) as i64,
            })
        }

        async fn write_file(
            &self,
            _sandbox_id: &str,
            path: &str,
            content: &str,
        ) -> Result<(), SandboxError> {
            let mapped = self.map_in(&provider::normalize_path(path));
            if let Some(parent) = std::path::Path::new(&mapped).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&mapped, provider::decode_content(path, content)?)?;
            Ok(())
        }

        async fn read_file(
            &self,
            _sandbox_id: &str,
            path: &str,
        ) -> Result<FileContent, SandboxError> {
            let normalized = provider::normalize_path(path);
            let mapped = self.map_in(&normalized);
            let bytes = std::fs::read(&mapped)
                .map_err(|_| SandboxError::NotFound(format!("file {normalized}")))?;
            Ok(provider::encode_content(&normalized, &bytes))
        }

        async fn create_pty(
            &self,
            _sandbox_id: &str,
            _size: PtySize,
            _output: PtyOutput,
        ) -> Result<PtySession, SandboxError> {
            Err(SandboxError::Backend("no pty in shell harness".into()))
        }

        async fn send_pty_input(
            &self,
            _sandbox_id: &str,
            _pty_id: &str,
            _data: &[u8],
        ) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn resize_pty(
            &self,
            _sandbox_id: &str,
            _pty_id: &str,
            _size: PtySize,
        ) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn kill_pty(&self, _sandbox_id: &str, _pty_id: &str) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn preview_url(&self, _sandbox_id: &str, _port: u16) -> Option<String> {
            None
        }

        async fn get_ide_url(&self, _sandbox_id: &str) -> Result<Option<String>, SandboxError> {
            Ok(None)
        }

        async fn cleanup(&self) {}
    }
}
