//! Ambient session context.
//!
//! Deeply nested instrumentation needs to know *whose* trace it is writing
//! without threading a session id through every call. The context is a
//! task-local value scoped to one session's execution: [`scope`] installs it,
//! [`session_id`] and [`current_span`] read it from anywhere underneath.

use crate::span::{CanonicalJson, SpanRecord, StatusCode, keys};
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Session id reported when no scope is installed.
pub const UNKNOWN_SESSION: &str = "unknown";

#[derive(Clone)]
struct SessionContext {
    session_id: Arc<str>,
    span: Option<ActiveSpan>,
}

tokio::task_local! {
    static SESSION: SessionContext;
}

/// Run `fut` with the given session id installed as the ambient context.
///
/// Call once at the boundary where a session's execution begins; nested
/// [`with_span`] scopes inherit the id.
pub async fn scope<F: Future>(session_id: impl Into<String>, fut: F) -> F::Output {
    let ctx = SessionContext {
        session_id: Arc::from(session_id.into()),
        span: None,
    };
    SESSION.scope(ctx, fut).await
}

/// Run `fut` with `span` as the current in-flight span. Inherits the ambient
/// session id; usable outside any session scope (id stays "unknown").
pub async fn with_span<F: Future>(span: ActiveSpan, fut: F) -> F::Output {
    let session_id = SESSION
        .try_with(|ctx| Arc::clone(&ctx.session_id))
        .unwrap_or_else(|_| Arc::from(UNKNOWN_SESSION));
    let ctx = SessionContext {
        session_id,
        span: Some(span),
    };
    SESSION.scope(ctx, fut).await
}

/// The ambient session id, or `"unknown"` outside a scope.
pub fn session_id() -> String {
    SESSION
        .try_with(|ctx| ctx.session_id.to_string())
        .unwrap_or_else(|_| UNKNOWN_SESSION.to_string())
}

/// The in-flight span installed by the nearest [`with_span`] scope.
pub fn current_span() -> Option<ActiveSpan> {
    SESSION.try_with(|ctx| ctx.span.clone()).ok().flatten()
}

// ─── Active span handle ──────────────────────────────────────────────────────

/// Shared handle to an in-flight [`SpanRecord`].
///
/// Enrichment subscribers mutate the record through this handle while the
/// span is open; when the span finishes, the tracing layer takes the final
/// record and hands it to the trace writer.
#[derive(Clone)]
pub struct ActiveSpan {
    inner: Arc<Mutex<SpanRecord>>,
}

impl ActiveSpan {
    pub fn new(record: SpanRecord) -> Self {
        Self {
            inner: Arc::new(Mutex::new(record)),
        }
    }

    /// True while the span has no end time.
    pub fn is_recording(&self) -> bool {
        self.lock().end_time.is_none()
    }

    pub fn set_attribute(&self, key: &str, value: impl Into<serde_json::Value>) {
        self.lock().set_attribute(key, value);
    }

    pub fn set_json_attribute(&self, key: &str, json: &str) {
        self.lock().set_json_attribute(key, json);
    }

    pub fn set_status(&self, status_code: StatusCode, message: Option<String>) {
        self.lock().set_status(status_code, message);
    }

    /// Close the span and return the final record for export.
    pub fn finish(&self) -> SpanRecord {
        let mut record = self.lock();
        record.finish();
        record.clone()
    }

    /// Copy of the record as it stands now.
    pub fn snapshot(&self) -> SpanRecord {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpanRecord> {
        // A poisoned span is still a valid span; instrumentation never
        // propagates a panic into the host.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ─── Explicit state capture ──────────────────────────────────────────────────

/// Record a produced result onto the current span as
/// `lens.result.<description>_json`.
///
/// Instrumented code calls this immediately after producing a value; there is
/// no wrapping involved, and serialization failures are silently skipped so
/// telemetry never breaks the producing code.
pub fn capture_result(description: &str, value: &impl CanonicalJson) {
    capture_with_prefix(keys::RESULT_PREFIX, description, value);
}

/// Record arbitrary state onto the current span as
/// `lens.state.<description>_json`.
pub fn capture_state(description: &str, value: &impl CanonicalJson) {
    capture_with_prefix(keys::STATE_PREFIX, description, value);
}

fn capture_with_prefix(prefix: &str, description: &str, value: &impl CanonicalJson) {
    let Some(span) = current_span() else { return };
    if !span.is_recording() {
        return;
    }
    let Some(canonical) = value.canonical_json() else {
        return;
    };
    let Ok(json) = serde_json::to_string(&canonical) else {
        return;
    };
    span.set_json_attribute(&format!("{prefix}{description}_json"), &json);
}
