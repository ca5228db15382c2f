//! Local container sandbox backend.
//!
//! Drives the container runtime API for lifecycle, exec, tar-based file
//! transfer, PTYs over attached execs, and host-port discovery. When a
//! reverse-proxy domain is configured, containers are created with router
//! labels so each exposable port gets an HTTPS subdomain.

use std::collections::{BTreeMap, HashMap};
use std::io::Read as _;
use std::pin::Pin;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, LogOutput, RemoveContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{
    CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults,
};
use bollard::service::HostConfig;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::DockerConfig;

use super::error::SandboxError;
use super::provider::{
    self, DEFAULT_COMMAND_TIMEOUT_SECS, HOME_DIR, IDE_PORT, PtyOutput, SandboxProvider,
    enforce_timeout,
};
use super::types::{
    CommandResult, ExecOptions, FileContent, ProviderKind, PtySession, PtySize,
};

const CONTAINER_PREFIX: &str = "agentbox-sandbox-";
pub(crate) const SANDBOX_USER: &str = "user";
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Common dev-server ports published to ephemeral host ports.
pub const AVAILABLE_PORTS: &[u16] = &[
    3000, 3001, 5000, 8000, 8080, 5173, 4200, 8888, 4321, 3030, 5500, 1234, 4000,
];

type PtyWriter = Pin<Box<dyn tokio::io::AsyncWrite + Send>>;

struct DockerPty {
    exec_id: String,
    writer: Mutex<PtyWriter>,
    reader: JoinHandle<()>,
}

pub struct DockerProvider {
    docker: Docker,
    config: DockerConfig,
    /// Container name per sandbox id, for sandboxes verified this lifetime.
    containers: RwLock<BTreeMap<String, String>>,
    /// Host-port map per sandbox id, keyed by container port.
    port_maps: RwLock<BTreeMap<String, BTreeMap<u16, u16>>>,
    ptys: RwLock<BTreeMap<String, DockerPty>>,
}

impl DockerProvider {
    pub fn new(config: DockerConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_unix(
            &config.socket_path,
            CONNECT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| SandboxError::Backend(format!("docker connect failed: {e}")))?;
        Ok(Self {
            docker,
            config,
            containers: RwLock::new(BTreeMap::new()),
            port_maps: RwLock::new(BTreeMap::new()),
            ptys: RwLock::new(BTreeMap::new()),
        })
    }

    pub(crate) fn docker(&self) -> &Docker {
        &self.docker
    }

    pub(crate) fn socket_path(&self) -> &str {
        &self.config.socket_path
    }

    pub fn container_name(sandbox_id: &str) -> String {
        format!("{CONTAINER_PREFIX}{sandbox_id}")
    }

    /// Resolve the container by name and verify it is alive, starting
    /// it if stopped. A cached handle does not skip the inspect;
    /// containers stop and get removed underneath us, and a failed
    /// inspect evicts the stale entry. Refreshes the cached port map.
    async fn ensure_container(&self, sandbox_id: &str) -> Result<String, SandboxError> {
        let name = Self::container_name(sandbox_id);
        let inspect = match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) => {
                self.containers.write().await.remove(sandbox_id);
                self.port_maps.write().await.remove(sandbox_id);
                return Err(if is_not_found(&e) {
                    SandboxError::NotFound(format!("sandbox {sandbox_id}"))
                } else {
                    SandboxError::Backend(format!("container inspect failed: {e}"))
                });
            }
        };

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            tracing::info!(sandbox_id = %sandbox_id, "restarting stopped container");
            self.docker
                .start_container::<String>(&name, None)
                .await
                .map_err(|e| SandboxError::Backend(format!("container start failed: {e}")))?;
        }

        let ports = extract_port_mappings(inspect.network_settings.as_ref().and_then(|n| n.ports.as_ref()));
        self.port_maps
            .write()
            .await
            .insert(sandbox_id.to_string(), ports);
        self.containers
            .write()
            .await
            .insert(sandbox_id.to_string(), name.clone());
        Ok(name)
    }

    async fn host_port(&self, sandbox_id: &str, port: u16) -> Option<u16> {
        self.port_maps
            .read()
            .await
            .get(sandbox_id)
            .and_then(|map| map.get(&port))
            .copied()
    }

    async fn create_exec(
        &self,
        container: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<String, SandboxError> {
        let env: Vec<String> = options
            .envs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec!["bash".to_string(), "-lc".to_string(), command.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    env: (!env.is_empty()).then_some(env),
                    user: Some(options.user.clone().unwrap_or_else(|| SANDBOX_USER.into())),
                    working_dir: Some(options.cwd.clone().unwrap_or_else(|| HOME_DIR.into())),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Backend(format!("exec create failed: {e}")))?;
        Ok(exec.id)
    }

    async fn run_foreground(&self, exec_id: &str) -> Result<CommandResult, SandboxError> {
        let started = self
            .docker
            .start_exec(exec_id, None::<StartExecOptions>)
            .await
            .map_err(|e| SandboxError::Backend(format!("exec start failed: {e}")))?;
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(SandboxError::ConnectionLost(format!(
                            "exec stream failed: {e}"
                        )));
                    }
                }
            }
        }
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| SandboxError::ConnectionLost(format!("exec inspect failed: {e}")))?;
        Ok(CommandResult {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(0),
        })
    }

    /// Start the web IDE as a background exec if it isn't running yet.
    async fn ensure_ide(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        let probe = self
            .execute(
                sandbox_id,
                &format!(
                    "pgrep -f 'openvscode-server' >/dev/null || \
                     nohup openvscode-server --host 0.0.0.0 --port {IDE_PORT} \
                     --without-connection-token >/dev/null 2>&1 & sleep 0.2; \
                     pgrep -f 'openvscode-server' >/dev/null"
                ),
                ExecOptions::default(),
            )
            .await?;
        Ok(probe.success())
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    async fn create(&self) -> Result<String, SandboxError> {
        let sandbox_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let name = Self::container_name(&sandbox_id);

        let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in AVAILABLE_PORTS.iter().chain(std::iter::once(&IDE_PORT)) {
            exposed.insert(format!("{port}/tcp"), HashMap::new());
        }

        let labels = self
            .config
            .traefik_domain
            .as_deref()
            .map(|domain| build_traefik_labels(&sandbox_id, domain));

        let config = ContainerConfig {
            image: Some(self.config.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(HOME_DIR.to_string()),
            env: Some(vec![
                "TERM=xterm-256color".to_string(),
                format!("HOME={HOME_DIR}"),
                format!("USER={SANDBOX_USER}"),
            ]),
            tty: Some(true),
            open_stdin: Some(true),
            exposed_ports: Some(exposed),
            labels,
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                network_mode: self.config.network.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::CreateFailed(format!("container create failed: {e}")))?;
        self.docker
            .start_container::<String>(&name, None)
            .await
            .map_err(|e| SandboxError::CreateFailed(format!("container start failed: {e}")))?;

        // Pull the ephemeral host-port assignments.
        let inspect = self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::CreateFailed(format!("container inspect failed: {e}")))?;
        let ports =
            extract_port_mappings(inspect.network_settings.as_ref().and_then(|n| n.ports.as_ref()));

        self.port_maps
            .write()
            .await
            .insert(sandbox_id.clone(), ports);
        self.containers
            .write()
            .await
            .insert(sandbox_id.clone(), name);
        tracing::info!(sandbox_id = %sandbox_id, image = %self.config.image, "container sandbox created");
        Ok(sandbox_id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        match self.ensure_container(sandbox_id).await {
            Ok(_) => Ok(true),
            Err(SandboxError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let name = Self::container_name(sandbox_id);
        self.containers.write().await.remove(sandbox_id);
        self.port_maps.write().await.remove(sandbox_id);

        let _ = self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: 5 }))
            .await;
        if let Err(e) = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            if !is_not_found(&e) {
                tracing::warn!(sandbox_id = %sandbox_id, error = %e, "container remove failed");
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult, SandboxError> {
        let container = self.ensure_container(sandbox_id).await?;
        let exec_id = self.create_exec(&container, command, &options).await?;

        if options.background {
            self.docker
                .start_exec(
                    &exec_id,
                    Some(StartExecOptions {
                        detach: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| SandboxError::Backend(format!("exec start failed: {e}")))?;
            let pid = self
                .docker
                .inspect_exec(&exec_id)
                .await
                .ok()
                .and_then(|i| i.pid)
                .unwrap_or_default();
            return Ok(CommandResult {
                stdout: format!("Background process started (PID: {pid})"),
                stderr: String::new(),
                exit_code: 0,
            });
        }

        let timeout = options.timeout_secs.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
        enforce_timeout(timeout, self.run_foreground(&exec_id)).await
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let container = self.ensure_container(sandbox_id).await?;
        let path = provider::normalize_path(path);
        let bytes = provider::decode_content(&path, content)?;

        let (dir, file_name) = path
            .rsplit_once('/')
            .ok_or_else(|| SandboxError::Backend(format!("unrooted path: {path}")))?;
        let dir = if dir.is_empty() { "/" } else { dir };

        self.execute(
            sandbox_id,
            &format!("mkdir -p '{dir}'"),
            ExecOptions::default(),
        )
        .await?;

        let archive = build_tar_archive(file_name, &bytes).map_err(SandboxError::Io)?;

        self.docker
            .upload_to_container(
                &container,
                Some(UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                bytes::Bytes::from(archive).into(),
            )
            .await
            .map_err(|e| SandboxError::Backend(format!("file upload failed: {e}")))?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent, SandboxError> {
        let container = self.ensure_container(sandbox_id).await?;
        let path = provider::normalize_path(path);

        let mut stream = self.docker.download_from_container(
            &container,
            Some(DownloadFromContainerOptions { path: path.clone() }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                if is_not_found(&e) {
                    SandboxError::NotFound(format!("file {path}"))
                } else {
                    SandboxError::Backend(format!("file download failed: {e}"))
                }
            })?;
            archive.extend_from_slice(&chunk);
        }

        let mut tar = tar::Archive::new(archive.as_slice());
        let entries = tar.entries().map_err(SandboxError::Io)?;
        for entry in entries {
            let mut entry = entry.map_err(SandboxError::Io)?;
            if entry.header().entry_type().is_file() {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes).map_err(SandboxError::Io)?;
                return Ok(provider::encode_content(&path, &bytes));
            }
        }
        Err(SandboxError::NotFound(format!("file {path}")))
    }

    async fn create_pty(
        &self,
        sandbox_id: &str,
        size: PtySize,
        output: PtyOutput,
    ) -> Result<PtySession, SandboxError> {
        let container = self.ensure_container(sandbox_id).await?;
        let size = size.clamped();

        let exec = self
            .docker
            .create_exec(
                &container,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/bash".to_string(), "-l".to_string()]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    env: Some(vec!["TERM=xterm-256color".to_string()]),
                    user: Some(SANDBOX_USER.to_string()),
                    working_dir: Some(HOME_DIR.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Backend(format!("pty exec create failed: {e}")))?;

        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| SandboxError::Backend(format!("pty exec start failed: {e}")))?;
        let StartExecResults::Attached {
            output: mut stream,
            input,
        } = started
        else {
            return Err(SandboxError::Backend("pty exec detached unexpectedly".into()));
        };

        let reader = tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(log) => {
                        let bytes = log.into_bytes();
                        if !bytes.is_empty() {
                            output.push(bytes.to_vec());
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "pty stream ended");
                        break;
                    }
                }
            }
        });

        self.docker
            .resize_exec(
                &exec.id,
                ResizeExecOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await
            .map_err(|e| SandboxError::Backend(format!("pty resize failed: {e}")))?;

        let pid = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .ok()
            .and_then(|i| i.pid);

        let session_id = uuid::Uuid::new_v4().to_string();
        self.ptys.write().await.insert(
            session_id.clone(),
            DockerPty {
                exec_id: exec.id,
                writer: Mutex::new(input),
                reader,
            },
        );
        Ok(PtySession {
            id: session_id,
            pid,
            rows: size.rows,
            cols: size.cols,
        })
    }

    async fn send_pty_input(
        &self,
        _sandbox_id: &str,
        pty_id: &str,
        data: &[u8],
    ) -> Result<(), SandboxError> {
        let ptys = self.ptys.read().await;
        let Some(pty) = ptys.get(pty_id) else {
            return Ok(());
        };
        let mut writer = pty.writer.lock().await;
        writer.write_all(data).await.map_err(SandboxError::Io)?;
        writer.flush().await.map_err(SandboxError::Io)?;
        Ok(())
    }

    async fn resize_pty(
        &self,
        _sandbox_id: &str,
        pty_id: &str,
        size: PtySize,
    ) -> Result<(), SandboxError> {
        let ptys = self.ptys.read().await;
        let Some(pty) = ptys.get(pty_id) else {
            return Ok(());
        };
        let size = size.clamped();
        self.docker
            .resize_exec(
                &pty.exec_id,
                ResizeExecOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await
            .map_err(|e| SandboxError::Backend(format!("pty resize failed: {e}")))
    }

    async fn kill_pty(&self, _sandbox_id: &str, pty_id: &str) -> Result<(), SandboxError> {
        let Some(pty) = self.ptys.write().await.remove(pty_id) else {
            return Ok(());
        };
        pty.reader.abort();
        // Dropping the writer closes the exec's stdin; the shell exits.
        Ok(())
    }

    async fn preview_url(&self, sandbox_id: &str, port: u16) -> Option<String> {
        // Only ports actually published on the host are reachable.
        let host_port = self.host_port(sandbox_id, port).await?;
        if let Some(domain) = self.config.traefik_domain.as_deref() {
            return Some(format!("https://sandbox-{sandbox_id}-{port}.{domain}"));
        }
        Some(format!("http://{}:{host_port}", self.config.preview_host))
    }

    async fn get_ide_url(&self, sandbox_id: &str) -> Result<Option<String>, SandboxError> {
        if !self.ensure_ide(sandbox_id).await? {
            return Ok(None);
        }
        Ok(self
            .preview_url(sandbox_id, IDE_PORT)
            .await
            .map(|url| format!("{url}/?folder={HOME_DIR}")))
    }

    async fn cleanup(&self) {
        let mut ptys = self.ptys.write().await;
        for (id, pty) in std::mem::take(&mut *ptys) {
            tracing::debug!(pty_id = %id, "killing pty during cleanup");
            pty.reader.abort();
        }
        drop(ptys);
        self.containers.write().await.clear();
        self.port_maps.write().await.clear();
    }
}

/// Single-file tar archive for the upload endpoint.
fn build_tar_archive(file_name: &str, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, file_name, bytes)?;
    builder.into_inner()
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Router labels so the reverse proxy serves each exposable port at
/// `https://sandbox-{id}-{port}.{domain}`.
fn build_traefik_labels(sandbox_id: &str, domain: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("traefik.enable".to_string(), "true".to_string());
    for port in AVAILABLE_PORTS.iter().chain(std::iter::once(&IDE_PORT)) {
        let router = format!("sandbox-{sandbox_id}-{port}");
        labels.insert(
            format!("traefik.http.routers.{router}.rule"),
            format!("Host(`{router}.{domain}`)"),
        );
        labels.insert(
            format!("traefik.http.routers.{router}.entrypoints"),
            "https".to_string(),
        );
        labels.insert(
            format!("traefik.http.routers.{router}.tls"),
            "true".to_string(),
        );
        labels.insert(
            format!("traefik.http.routers.{router}.service"),
            router.clone(),
        );
        labels.insert(
            format!("traefik.http.services.{router}.loadbalancer.server.port"),
            port.to_string(),
        );
    }
    labels
}

/// Flatten the runtime's port map (`"3000/tcp" -> [{host_port}]`) into
/// container port to host port.
fn extract_port_mappings(
    ports: Option<&HashMap<String, Option<Vec<bollard::service::PortBinding>>>>,
) -> BTreeMap<u16, u16> {
    let mut map = BTreeMap::new();
    let Some(ports) = ports else {
        return map;
    };
    for (key, bindings) in ports {
        let Some(container_port) = key
            .split('/')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let Some(host_port) = bindings
            .as_ref()
            .and_then(|list| list.first())
            .and_then(|b| b.host_port.as_deref())
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        map.insert(container_port, host_port);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_carries_prefix() {
        assert_eq!(
            DockerProvider::container_name("abc123"),
            "agentbox-sandbox-abc123"
        );
    }

    #[test]
    fn traefik_labels_cover_every_exposable_port() {
        let labels = build_traefik_labels("ab12", "apps.example.dev");
        assert_eq!(labels.get("traefik.enable").map(String::as_str), Some("true"));
        assert_eq!(
            labels
                .get("traefik.http.routers.sandbox-ab12-3000.rule")
                .map(String::as_str),
            Some("Host(`sandbox-ab12-3000.apps.example.dev`)")
        );
        assert_eq!(
            labels
                .get("traefik.http.services.sandbox-ab12-8765.loadbalancer.server.port")
                .map(String::as_str),
            Some("8765")
        );
        // enable + 5 labels per port, IDE port included
        let port_count = AVAILABLE_PORTS.len() + 1;
        assert_eq!(labels.len(), 1 + 5 * port_count);
    }

    #[test]
    fn port_mappings_flatten_first_binding() {
        let mut ports: HashMap<String, Option<Vec<bollard::service::PortBinding>>> = HashMap::new();
        ports.insert(
            "3000/tcp".into(),
            Some(vec![bollard::service::PortBinding {
                host_ip: Some("0.0.0.0".into()),
                host_port: Some("49211".into()),
            }]),
        );
        ports.insert("8080/tcp".into(), None);
        ports.insert("garbage".into(), None);
        let map = extract_port_mappings(Some(&ports));
        assert_eq!(map.get(&3000), Some(&49211));
        assert!(!map.contains_key(&8080));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn port_mappings_tolerate_missing_table() {
        assert!(extract_port_mappings(None).is_empty());
    }

    #[tokio::test]
    async fn connect_inspects_even_with_a_cached_handle() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("runtime.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        // Answers every inspect with a running container and closes the
        // connection, so each request shows up as one accept.
        tokio::spawn(async move {
            let body =
                r#"{"Id":"abc","State":{"Running":true},"NetworkSettings":{"Ports":{}}}"#;
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        let provider = DockerProvider::new(crate::config::DockerConfig {
            socket_path: sock.to_string_lossy().into_owned(),
            ..Default::default()
        })
        .unwrap();

        assert!(provider.connect("sbx-1").await.unwrap());
        let after_first = hits.load(Ordering::SeqCst);
        assert!(provider.connect("sbx-1").await.unwrap());
        assert!(
            hits.load(Ordering::SeqCst) > after_first,
            "cached handle skipped the inspect"
        );
    }
}
