//! Instrumentation hook bus.
//!
//! A lightweight named-callback registry that lets observers watch the host
//! framework without runtime patching. The framework emits at defined
//! lifecycle points; subscribers register by name. Dispatch guarantees:
//!
//! - callbacks fire in registration order, sequentially, within one emission
//! - a callback's error or panic is logged and never propagates, nor does it
//!   stop later callbacks
//! - the registry lock is held only for mutation and snapshotting, never
//!   across callback execution
//! - emission with zero subscribers returns before allocating any futures

use crate::context::ActiveSpan;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

/// Hook names emitted by the host framework. The namespace is open; these
/// are the lifecycle points the built-in subscribers attach to.
pub mod names {
    pub const BEFORE_WORKFLOW_RUN: &str = "before_workflow_run";
    pub const AFTER_WORKFLOW_RUN: &str = "after_workflow_run";
    pub const ERROR_WORKFLOW_RUN: &str = "error_workflow_run";

    pub const BEFORE_TOOL_CALL: &str = "before_tool_call";
    pub const AFTER_TOOL_CALL: &str = "after_tool_call";
    pub const ERROR_TOOL_CALL: &str = "error_tool_call";

    pub const BEFORE_AGENT_CALL: &str = "before_agent_call";

    pub const BEFORE_LLM_GENERATE: &str = "before_llm_generate";
    pub const AFTER_LLM_GENERATE: &str = "after_llm_generate";

    pub const BEFORE_RPC_REQUEST: &str = "before_rpc_request";
    pub const AFTER_RPC_RESPONSE: &str = "after_rpc_response";
    pub const ERROR_RPC_REQUEST: &str = "error_rpc_request";

    pub const SESSION_STARTED: &str = "session_started";
    pub const SESSION_FINISHED: &str = "session_finished";
    pub const WAITING_ON_SIGNAL: &str = "waiting_on_signal";
}

// ─── Payload ─────────────────────────────────────────────────────────────────

/// Context handed to every callback of one emission.
///
/// Named fields replace ad-hoc keyword arguments; emitters fill what the
/// lifecycle point provides and leave the rest `None`.
#[derive(Clone, Default)]
pub struct HookPayload {
    /// Session the event belongs to, when the emitter knows it.
    pub session_id: Option<String>,
    /// In-flight span to enrich, when one is open.
    pub span: Option<ActiveSpan>,
    /// Subject name: workflow type, tool name, model, signal name.
    pub subject: Option<String>,
    /// Call input, JSON-encoded by the emitter.
    pub args: Option<Value>,
    /// Call output, JSON-encoded by the emitter.
    pub result: Option<Value>,
    /// Error message for `error_*` hooks.
    pub error: Option<String>,
    /// Terminal status for `session_finished` ("completed" / "failed").
    pub status: Option<String>,
    /// Free-form extras (engine tag, app name, signal prompt/schema).
    pub metadata: Option<Value>,
}

impl HookPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn span(mut self, span: ActiveSpan) -> Self {
        self.span = Some(span);
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ─── Bus ─────────────────────────────────────────────────────────────────────

/// Async callback: owns its payload copy, returns nothing the bus keeps.
pub type HookCallback =
    std::sync::Arc<dyn Fn(HookPayload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Token identifying one registration; closures are not comparable, so
/// unregistration goes through the token instead of the callback itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct HookEntry {
    id: HookId,
    callback: HookCallback,
}

/// Named-callback registry with fan-out dispatch.
pub struct HookBus {
    hooks: Mutex<HashMap<String, Vec<HookEntry>>>,
    next_id: AtomicU64,
}

static GLOBAL: OnceLock<HookBus> = OnceLock::new();

/// Process-wide bus instance shared by the framework and all subscribers.
pub fn bus() -> &'static HookBus {
    GLOBAL.get_or_init(HookBus::new)
}

impl HookBus {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to a hook. Duplicate registrations are permitted and produce
    /// duplicate invocations. Callable from any thread.
    pub fn register(&self, name: &str, callback: HookCallback) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut hooks = self.lock();
        hooks
            .entry(name.to_string())
            .or_default()
            .push(HookEntry { id, callback });
        id
    }

    /// Subscribe a synchronous callback.
    pub fn register_sync<F>(&self, name: &str, callback: F) -> HookId
    where
        F: Fn(HookPayload) + Send + Sync + 'static,
    {
        self.register(
            name,
            std::sync::Arc::new(move |payload| {
                callback(payload);
                async { Ok(()) }.boxed()
            }),
        )
    }

    /// Remove a registration. Idempotent: unknown ids and already-removed
    /// entries are ignored. Safe to call from within a running callback of
    /// the same hook — dispatch iterates a snapshot, so the removal takes
    /// effect from the next emission.
    pub fn unregister(&self, name: &str, id: HookId) {
        let mut hooks = self.lock();
        if let Some(entries) = hooks.get_mut(name) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                hooks.remove(name);
            }
        }
    }

    /// Invoke every callback registered for `name`, in registration order.
    ///
    /// Callback failures and panics are logged and swallowed; instrumentation
    /// must never break the host. The registry lock is released before any
    /// callback runs.
    pub async fn emit(&self, name: &str, payload: HookPayload) {
        // Fast path: no subscribers, no allocation.
        let snapshot: Vec<HookCallback> = {
            let hooks = self.lock();
            let Some(entries) = hooks.get(name) else {
                return;
            };
            entries
                .iter()
                .map(|entry| std::sync::Arc::clone(&entry.callback))
                .collect()
        };

        for callback in snapshot {
            let fut = callback(payload.clone());
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(hook = name, %error, "hook callback failed");
                }
                Err(_) => {
                    tracing::error!(hook = name, "hook callback panicked");
                }
            }
        }
    }

    /// Number of callbacks currently registered for `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<HookEntry>>> {
        self.hooks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
