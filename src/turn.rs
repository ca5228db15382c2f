//! Drives one agent turn end to end: start the CLI through a transport,
//! hand it the prompt, and fan its events into the session's log while
//! watching the turn's revocation flag. Whatever happens, exactly one
//! terminal entry lands in the log.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};

use crate::events::{EventLog, StreamEventKind};
use crate::transport::{AgentOptions, CommandTransport};

/// How often a running turn checks its revocation flag.
pub const REVOCATION_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Interrupted,
    Failed(String),
}

pub struct TurnRunner {
    log: Arc<EventLog>,
    revoked: Arc<AtomicBool>,
}

impl TurnRunner {
    pub fn new(log: Arc<EventLog>, revoked: Arc<AtomicBool>) -> Self {
        TurnRunner { log, revoked }
    }

    /// Run the turn to its terminal state. `on_session_id` fires once
    /// when the CLI announces its session in the init event.
    pub async fn run<T, F>(
        &self,
        transport: &mut T,
        prompt: &str,
        mut on_session_id: F,
    ) -> TurnStatus
    where
        T: CommandTransport + ?Sized,
        F: FnMut(&str) + Send,
    {
        if let Err(err) = transport.connect().await {
            return self.finalize_failed(err.to_string());
        }
        if let Err(err) = transport.write(&AgentOptions::stdin_message(prompt)).await {
            transport.close().await;
            return self.finalize_failed(err.to_string());
        }
        if let Err(err) = transport.end_input().await {
            transport.close().await;
            return self.finalize_failed(err.to_string());
        }

        let mut stream = transport.read_messages();
        let mut ticker = tokio::time::interval(REVOCATION_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut session_id: Option<String> = None;
        let mut failure: Option<String> = None;
        let mut interrupted = false;

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if session_id.is_none() {
                            if let Some(id) = init_session_id(&event) {
                                session_id = Some(id.to_string());
                                on_session_id(id);
                            }
                        }
                        self.log.append(StreamEventKind::Content, event);
                    }
                    Some(Err(err)) => {
                        failure = Some(err.to_string());
                        break;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if self.revoked.load(Ordering::SeqCst) {
                        interrupted = true;
                        break;
                    }
                }
            }
        }
        drop(stream);
        transport.close().await;

        if interrupted {
            tracing::info!(session_id = ?session_id, "turn interrupted");
            self.log.append(
                StreamEventKind::Complete,
                json!({ "status": "interrupted", "session_id": session_id }),
            );
            return TurnStatus::Interrupted;
        }
        if let Some(message) = failure {
            return self.finalize_failed(message);
        }
        self.log.append(
            StreamEventKind::Complete,
            json!({ "status": "completed", "session_id": session_id }),
        );
        TurnStatus::Completed
    }

    fn finalize_failed(&self, message: String) -> TurnStatus {
        tracing::warn!(error = %message, "turn failed");
        self.log.append(
            StreamEventKind::Error,
            json!({ "status": "failed", "message": message }),
        );
        TurnStatus::Failed(message)
    }
}

/// The CLI's first event is `{"type":"system","subtype":"init",
/// "session_id":...}`; pull the id out of it.
fn init_session_id(event: &Value) -> Option<&str> {
    if event.get("type").and_then(Value::as_str) == Some("system")
        && event.get("subtype").and_then(Value::as_str) == Some("init")
    {
        event.get("session_id").and_then(Value::as_str)
    } else {
        None
    }
}
