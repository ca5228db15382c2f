use std::collections::BTreeMap;

use serde::Deserialize;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::ProviderKind;

/// Runtime settings, read from the environment (`.env` honored via
/// dotenvy). Only the section for the selected provider needs to be
/// fully populated.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub provider: ProviderKind,
    pub remote: RemoteVmConfig,
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteVmConfig {
    pub api_base_url: String,
    pub api_key: String,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_preview_domain")]
    pub preview_domain: String,
    #[serde(default = "default_auto_pause_secs")]
    pub auto_pause_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_image")]
    pub image: String,
    /// Unix socket path of the container runtime.
    #[serde(default = "default_docker_socket")]
    pub socket_path: String,
    #[serde(default)]
    pub network: Option<String>,
    /// When set, containers get reverse-proxy labels and preview links
    /// use `https://sandbox-{id}-{port}.{domain}` instead of localhost.
    #[serde(default)]
    pub traefik_domain: Option<String>,
    #[serde(default = "default_preview_host")]
    pub preview_host: String,
}

fn default_template() -> String {
    "base".to_string()
}

fn default_preview_domain() -> String {
    "sandboxes.dev".to_string()
}

fn default_auto_pause_secs() -> u64 {
    3000
}

fn default_image() -> String {
    "agentbox-sandbox:latest".to_string()
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_preview_host() -> String {
    "localhost".to_string()
}

impl Default for DockerConfig {
    fn default() -> Self {
        DockerConfig {
            image: default_image(),
            socket_path: default_docker_socket(),
            network: None,
            traefik_domain: None,
            preview_host: default_preview_host(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment, honoring a `.env`
    /// file in the working directory.
    pub fn from_env() -> Result<Self, SandboxError> {
        dotenvy::dotenv().ok();
        let env: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_map(&env)
    }

    fn from_map(env: &BTreeMap<String, String>) -> Result<Self, SandboxError> {
        let provider = match env
            .get("AGENTBOX_PROVIDER")
            .map(String::as_str)
            .unwrap_or("docker")
        {
            "remote_vm" => ProviderKind::RemoteVm,
            "docker" => ProviderKind::Docker,
            other => {
                return Err(SandboxError::Backend(format!(
                    "unknown AGENTBOX_PROVIDER: {other}"
                )));
            }
        };

        let remote = RemoteVmConfig {
            api_base_url: env
                .get("SANDBOX_API_URL")
                .cloned()
                .unwrap_or_default(),
            api_key: env.get("SANDBOX_API_KEY").cloned().unwrap_or_default(),
            template: env
                .get("SANDBOX_TEMPLATE")
                .cloned()
                .unwrap_or_else(default_template),
            preview_domain: env
                .get("SANDBOX_PREVIEW_DOMAIN")
                .cloned()
                .unwrap_or_else(default_preview_domain),
            auto_pause_secs: env
                .get("SANDBOX_AUTO_PAUSE_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_auto_pause_secs),
        };

        if provider == ProviderKind::RemoteVm {
            if remote.api_base_url.is_empty() {
                return Err(SandboxError::Backend(
                    "SANDBOX_API_URL is required for the remote_vm provider".into(),
                ));
            }
            if remote.api_key.is_empty() {
                return Err(SandboxError::Backend(
                    "SANDBOX_API_KEY is required for the remote_vm provider".into(),
                ));
            }
        }

        let docker = DockerConfig {
            image: env
                .get("SANDBOX_DOCKER_IMAGE")
                .cloned()
                .unwrap_or_else(default_image),
            socket_path: env
                .get("SANDBOX_DOCKER_SOCKET")
                .cloned()
                .unwrap_or_else(default_docker_socket),
            network: env.get("SANDBOX_DOCKER_NETWORK").cloned(),
            traefik_domain: env.get("SANDBOX_TRAEFIK_DOMAIN").cloned(),
            preview_host: env
                .get("SANDBOX_PREVIEW_HOST")
                .cloned()
                .unwrap_or_else(default_preview_host),
        };

        Ok(Settings {
            provider,
            remote,
            docker,
        })
    }
}
