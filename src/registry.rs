//! In-memory registry of currently-running sessions.
//!
//! An acceleration path beside the file-derived session list: lifecycle hook
//! subscribers mutate it so liveness checks and heartbeat metric deltas never
//! need a log scan. The registry is the sole owner of the "last observed
//! value" baselines used for delta computation.

use crate::sessions::{SessionMeta, SessionStatus};
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Metric movement since the previous `update_metrics` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsDelta {
    pub llm_calls_delta: u64,
    pub tokens_delta: u64,
}

struct SessionEntry {
    meta: SessionMeta,
    error: Option<String>,
    llm_calls: u64,
    tokens: u64,
    last_llm_calls: u64,
    last_tokens: u64,
    heartbeat: Option<JoinHandle<()>>,
}

/// Registry of active sessions, mutated only by hook subscribers.
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a freshly started session with zeroed counters.
    pub fn add(&self, session_id: &str, engine: &str, title: &str) {
        let meta = SessionMeta {
            id: session_id.to_string(),
            status: SessionStatus::Running,
            started_at: now_rfc3339(),
            engine: engine.to_string(),
            title: title.to_string(),
            ended_at: None,
        };
        self.lock().insert(
            session_id.to_string(),
            SessionEntry {
                meta,
                error: None,
                llm_calls: 0,
                tokens: 0,
                last_llm_calls: 0,
                last_tokens: 0,
                heartbeat: None,
            },
        );
    }

    /// Mark a session ended and cancel its heartbeat task.
    ///
    /// Safe to call twice: the heartbeat handle is taken out of the entry, so
    /// a second finish finds nothing to cancel.
    pub fn finish(&self, session_id: &str, status: SessionStatus, error: Option<String>) {
        let handle = {
            let mut inner = self.lock();
            let Some(entry) = inner.get_mut(session_id) else {
                return;
            };
            entry.meta.status = status;
            entry.meta.ended_at = Some(now_rfc3339());
            entry.error = error;
            entry.heartbeat.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Attach the per-session heartbeat task so `finish` can cancel it.
    pub fn set_heartbeat_task(&self, session_id: &str, handle: JoinHandle<()>) {
        let mut inner = self.lock();
        if let Some(entry) = inner.get_mut(session_id) {
            entry.heartbeat = Some(handle);
        } else {
            // Session already finished; don't leak a running task.
            handle.abort();
        }
    }

    /// Ids of sessions still marked running.
    pub fn active_ids(&self) -> Vec<String> {
        self.lock()
            .values()
            .filter(|entry| entry.meta.status == SessionStatus::Running)
            .map(|entry| entry.meta.id.clone())
            .collect()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .is_some_and(|entry| entry.meta.status == SessionStatus::Running)
    }

    /// Bump the running counters after an LLM call completes.
    pub fn record_llm_call(&self, session_id: &str, tokens: u64) {
        let mut inner = self.lock();
        if let Some(entry) = inner.get_mut(session_id) {
            entry.llm_calls += 1;
            entry.tokens += tokens;
        }
    }

    /// Delta since the previous call, advancing the stored baseline.
    pub fn update_metrics(&self, session_id: &str) -> Option<MetricsDelta> {
        let mut inner = self.lock();
        let entry = inner.get_mut(session_id)?;
        let delta = MetricsDelta {
            llm_calls_delta: entry.llm_calls - entry.last_llm_calls,
            tokens_delta: entry.tokens - entry.last_tokens,
        };
        entry.last_llm_calls = entry.llm_calls;
        entry.last_tokens = entry.tokens;
        Some(delta)
    }

    /// Snapshot of one session's metadata, if registered.
    pub fn get(&self, session_id: &str) -> Option<SessionMeta> {
        self.lock().get(session_id).map(|entry| entry.meta.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
