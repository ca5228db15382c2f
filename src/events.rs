//! Append-only event log for streaming agent turns.
//!
//! Every event of a turn lands in the session's log with a monotonically
//! increasing id, so a client that reconnects mid-turn replays from the
//! last id it saw and then follows live. A `complete` or `error` entry
//! terminates the stream; readers never see past it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;

/// Oldest entries are trimmed past this point; a client that lags
/// further than this loses history.
pub const MAX_LOG_ENTRIES: usize = 10_000;
/// How long a live follower parks before re-checking the log.
pub const LIVE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Content,
    Complete,
    Error,
}

impl StreamEventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamEventKind::Complete | StreamEventKind::Error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamEntry {
    pub id: u64,
    pub kind: StreamEventKind,
    pub payload: Value,
}

struct LogInner {
    entries: VecDeque<StreamEntry>,
    next_id: u64,
}

pub struct EventLog {
    inner: Mutex<LogInner>,
    notify: Notify,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        EventLog {
            inner: Mutex::new(LogInner {
                entries: VecDeque::new(),
                next_id: 1,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append an entry, returning its id.
    pub fn append(&self, kind: StreamEventKind, payload: Value) -> u64 {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push_back(StreamEntry { id, kind, payload });
            while inner.entries.len() > MAX_LOG_ENTRIES {
                inner.entries.pop_front();
            }
            id
        };
        self.notify.notify_waiters();
        id
    }

    pub fn last_id(&self) -> u64 {
        self.lock().next_id - 1
    }

    /// Entries with id strictly greater than `after_id`, up to and
    /// including the first terminal entry. The bool reports whether a
    /// terminal entry was reached.
    pub fn read_after(&self, after_id: u64) -> (Vec<StreamEntry>, bool) {
        let inner = self.lock();
        let mut out = Vec::new();
        for entry in &inner.entries {
            if entry.id <= after_id {
                continue;
            }
            let terminal = entry.kind.is_terminal();
            out.push(entry.clone());
            if terminal {
                return (out, true);
            }
        }
        (out, false)
    }

    /// Park until something newer than `after_id` arrives, or the live
    /// wait interval elapses.
    pub async fn wait_for_more(&self, after_id: u64) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.last_id() > after_id {
            return;
        }
        let _ = tokio::time::timeout(LIVE_WAIT_INTERVAL, notified).await;
    }

    /// Replay from `after_id` (exclusive) and follow live until the
    /// turn's terminal entry.
    pub fn follow(
        self: Arc<Self>,
        after_id: u64,
    ) -> impl futures::Stream<Item = StreamEntry> + Send + 'static {
        let log = self;
        async_stream::stream! {
            let mut cursor = after_id;
            loop {
                let (entries, terminal) = log.read_after(cursor);
                for entry in entries {
                    cursor = entry.id;
                    yield entry;
                }
                if terminal {
                    return;
                }
                log.wait_for_more(cursor).await;
            }
        }
    }
}

/// One revocation flag per running turn. Raising the flag asks the
/// turn's watcher to tear the transport down.
#[derive(Default)]
pub struct RevocationRegistry {
    flags: Mutex<BTreeMap<String, Arc<AtomicBool>>>,
}

impl RevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<AtomicBool>>> {
        match self.flags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a fresh, unraised flag for the session, replacing any
    /// flag from a previous turn.
    pub fn register(&self, session_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.lock().insert(session_id.to_string(), flag.clone());
        flag
    }

    /// Raise the session's flag. Returns false when no turn is running.
    pub fn revoke(&self, session_id: &str) -> bool {
        match self.lock().get(session_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn is_revoked(&self, session_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn remove(&self, session_id: &str) {
        self.lock().remove(session_id);
    }
}
