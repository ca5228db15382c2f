//! Interactive terminal sessions layered on a sandbox provider.
//!
//! Each named slot holds at most one PTY. Output travels from the
//! backend reader through a bounded queue and a forward task into the
//! caller's channel; input takes the reverse path through its own
//! bounded queue so a burst of keystrokes coalesces into one backend
//! call. Both queues drop their oldest entry when full; a stalled
//! consumer costs history, never liveness.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::queue::BoundedQueue;
use crate::sandbox::provider::{PtyOutput, SandboxProvider};
use crate::sandbox::types::{PtySession, PtySize};
use crate::sandbox::SandboxError;

pub const OUTPUT_QUEUE_CAPACITY: usize = 512;
pub const INPUT_QUEUE_CAPACITY: usize = 1024;

struct PtyHandle {
    session: PtySession,
    input: Arc<BoundedQueue<Vec<u8>>>,
    forward: JoinHandle<()>,
    input_pump: JoinHandle<()>,
}

pub struct PtySessionManager {
    provider: Arc<dyn SandboxProvider>,
    sandbox_id: String,
    sessions: Mutex<BTreeMap<String, PtyHandle>>,
}

impl PtySessionManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, sandbox_id: String) -> Self {
        PtySessionManager {
            provider,
            sandbox_id,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start a PTY in `slot`, replacing any session already there.
    /// Decoded output is delivered in batches to `sink`.
    pub async fn start(
        &self,
        slot: &str,
        size: PtySize,
        sink: mpsc::Sender<String>,
    ) -> Result<PtySession, SandboxError> {
        self.stop(slot).await;

        let output: PtyOutput = Arc::new(BoundedQueue::new(OUTPUT_QUEUE_CAPACITY));
        let session = self
            .provider
            .create_pty(&self.sandbox_id, size.clamped(), output.clone())
            .await?;

        let forward = tokio::spawn(async move {
            loop {
                let batch = output.drain().await;
                let mut bytes = Vec::new();
                for chunk in batch {
                    bytes.extend_from_slice(&chunk);
                }
                let text = String::from_utf8_lossy(&bytes).into_owned();
                if sink.send(text).await.is_err() {
                    return;
                }
            }
        });

        let input: Arc<BoundedQueue<Vec<u8>>> = Arc::new(BoundedQueue::new(INPUT_QUEUE_CAPACITY));
        let pump_input = input.clone();
        let provider = self.provider.clone();
        let sandbox_id = self.sandbox_id.clone();
        let pty_id = session.id.clone();
        let input_pump = tokio::spawn(async move {
            loop {
                let batch = pump_input.drain().await;
                let mut bytes = Vec::new();
                for chunk in batch {
                    bytes.extend_from_slice(&chunk);
                }
                if let Err(err) = provider.send_pty_input(&sandbox_id, &pty_id, &bytes).await {
                    tracing::debug!(pty_id = %pty_id, error = %err, "pty input write failed");
                }
            }
        });

        let handle = PtyHandle {
            session: session.clone(),
            input,
            forward,
            input_pump,
        };
        self.sessions
            .lock()
            .await
            .insert(slot.to_string(), handle);
        tracing::info!(slot, pty_id = %session.id, "pty session started");
        Ok(session)
    }

    /// Queue input for the slot's session. Unknown slots are ignored.
    pub async fn send_input(&self, slot: &str, data: &[u8]) {
        let sessions = self.sessions.lock().await;
        let Some(handle) = sessions.get(slot) else {
            return;
        };
        if !handle.input.push(data.to_vec()) {
            tracing::debug!(slot, "pty input queue full, dropped oldest chunk");
        }
    }

    /// Resize the slot's session. Unknown slots are ignored; dimensions
    /// are clamped to at least one row and column.
    pub async fn resize(&self, slot: &str, size: PtySize) -> Result<(), SandboxError> {
        let pty_id = {
            let sessions = self.sessions.lock().await;
            match sessions.get(slot) {
                Some(handle) => handle.session.id.clone(),
                None => return Ok(()),
            }
        };
        self.provider
            .resize_pty(&self.sandbox_id, &pty_id, size.clamped())
            .await
    }

    pub async fn session(&self, slot: &str) -> Option<PtySession> {
        self.sessions
            .lock()
            .await
            .get(slot)
            .map(|handle| handle.session.clone())
    }

    /// Stop the slot's session. Safe on unknown slots, never fails.
    pub async fn stop(&self, slot: &str) {
        let Some(handle) = self.sessions.lock().await.remove(slot) else {
            return;
        };
        handle.forward.abort();
        handle.input_pump.abort();
        // Wait for both tasks to actually finish before tearing down the
        // backend session; cancellation surfaces as a JoinError we swallow.
        let _ = handle.forward.await;
        let _ = handle.input_pump.await;
        handle.input.clear();
        if let Err(err) = self
            .provider
            .kill_pty(&self.sandbox_id, &handle.session.id)
            .await
        {
            tracing::debug!(slot, error = %err, "pty kill failed");
        }
        tracing::info!(slot, pty_id = %handle.session.id, "pty session stopped");
    }

    pub async fn stop_all(&self) {
        let slots: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for slot in slots {
            self.stop(&slot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::sandbox::types::{CommandResult, ExecOptions, FileContent, ProviderKind};

    use super::*;

    /// Records backend calls and exposes the output queue handed to
    /// `create_pty` so tests can emit terminal output.
    #[derive(Default)]
    struct MockPtyBackend {
        outputs: StdMutex<Vec<PtyOutput>>,
        inputs: StdMutex<Vec<Vec<u8>>>,
        resizes: StdMutex<Vec<PtySize>>,
        kills: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl SandboxProvider for MockPtyBackend {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Docker
        }

        async fn create(&self) -> Result<String, SandboxError> {
            Ok("mock".into())
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
            _command: &str,
            _options: ExecOptions,
        ) -> Result<CommandResult, SandboxError> {
            Ok(CommandResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        async fn write_file(
            &self,
            _sandbox_id: &str,
            _path: &str,
            _content: &str,
        ) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn read_file(
            &self,
            _sandbox_id: &str,
            _path: &str,
        ) -> Result<FileContent, SandboxError> {
            Err(SandboxError::NotFound("mock".into()))
        }

        async fn create_pty(
            &self,
            _sandbox_id: &str,
            size: PtySize,
            output: PtyOutput,
        ) -> Result<PtySession, SandboxError> {
            let id = format!("pty-{}", self.outputs.lock().unwrap().len());
            self.outputs.lock().unwrap().push(output);
            Ok(PtySession {
                id,
                pid: Some(100),
                rows: size.rows,
                cols: size.cols,
            })
        }

        async fn send_pty_input(
            &self,
            _sandbox_id: &str,
            _pty_id: &str,
            data: &[u8],
        ) -> Result<(), SandboxError> {
            self.inputs.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn resize_pty(
            &self,
            _sandbox_id: &str,
            _pty_id: &str,
            size: PtySize,
        ) -> Result<(), SandboxError> {
            self.resizes.lock().unwrap().push(size);
            Ok(())
        }

        async fn kill_pty(&self, _sandbox_id: &str, pty_id: &str) -> Result<(), SandboxError> {
            self.kills.lock().unwrap().push(pty_id.to_string());
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

    fn manager() -> (Arc<MockPtyBackend>, PtySessionManager) {
        let backend = Arc::new(MockPtyBackend::default());
        let manager = PtySessionManager::new(backend.clone(), "sbx".into());
        (backend, manager)
    }

    #[tokio::test]
    async fn output_is_batched_and_decoded() {
        let (backend, manager) = manager();
        let (sink, mut rx) = mpsc::channel(16);
        manager
            .start("main", PtySize::default(), sink)
            .await
            .unwrap();

        let queue = backend.outputs.lock().unwrap()[0].clone();
        queue.push(b"hel".to_vec());
        queue.push(b"lo".to_vec());

        let mut collected = String::new();
        while collected != "hello" {
            collected.push_str(&rx.recv().await.unwrap());
        }
    }

    #[tokio::test]
    async fn input_is_coalesced_into_backend_writes() {
        let (backend, manager) = manager();
        let (sink, _rx) = mpsc::channel(16);
        manager
            .start("main", PtySize::default(), sink)
            .await
            .unwrap();

        manager.send_input("main", b"ls").await;
        manager.send_input("main", b" -la\n").await;

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let joined: Vec<u8> = backend
                .inputs
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .copied()
                .collect();
            if joined == b"ls -la\n" {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "input never arrived");
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn starting_a_busy_slot_replaces_the_session() {
        let (backend, manager) = manager();
        let (sink, _rx) = mpsc::channel(16);
        let first = manager
            .start("main", PtySize::default(), sink.clone())
            .await
            .unwrap();
        let second = manager
            .start("main", PtySize::default(), sink)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(backend.kills.lock().unwrap().as_slice(), &[first.id]);
        assert_eq!(manager.session("main").await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn unknown_slot_operations_are_silent() {
        let (backend, manager) = manager();
        manager.send_input("ghost", b"x").await;
        manager.resize("ghost", PtySize::default()).await.unwrap();
        manager.stop("ghost").await;
        assert!(backend.inputs.lock().unwrap().is_empty());
        assert!(backend.resizes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resize_clamps_to_one() {
        let (backend, manager) = manager();
        let (sink, _rx) = mpsc::channel(16);
        manager
            .start("main", PtySize::default(), sink)
            .await
            .unwrap();
        manager
            .resize("main", PtySize { rows: 0, cols: 0 })
            .await
            .unwrap();
        let resizes = backend.resizes.lock().unwrap();
        assert_eq!(resizes[0].rows, 1);
        assert_eq!(resizes[0].cols, 1);
    }

    #[tokio::test]
    async fn stop_settles_tasks_before_returning() {
        let (backend, manager) = manager();
        let (sink, mut rx) = mpsc::channel(16);
        manager
            .start("main", PtySize::default(), sink)
            .await
            .unwrap();
        manager.stop("main").await;
        // The forward task held the only sender; once it has finished,
        // the sink channel reads as closed with nothing in flight.
        assert!(rx.recv().await.is_none());
        assert_eq!(backend.kills.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stop_all_clears_every_slot() {
        let (backend, manager) = manager();
        let (sink, _rx) = mpsc::channel(16);
        manager
            .start("one", PtySize::default(), sink.clone())
            .await
            .unwrap();
        manager
            .start("two", PtySize::default(), sink)
            .await
            .unwrap();
        manager.stop_all().await;
        assert!(manager.session("one").await.is_none());
        assert!(manager.session("two").await.is_none());
        assert_eq!(backend.kills.lock().unwrap().len(), 2);
    }
}
