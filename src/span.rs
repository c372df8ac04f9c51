//! Span wire model and attribute conventions.
//!
//! A [`SpanRecord`] is one observed unit of work. Records are serialized as
//! single JSON lines into a session's trace log; every field name here is
//! load-bearing for the read path, so changes must stay wire-compatible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Attribute namespace ─────────────────────────────────────────────────────

/// Span attribute keys, `lens.*` namespaced.
///
/// The key set is open; these are the names the subscribers and the session
/// deriver agree on.
pub mod keys {
    /// Resource-level session correlation id.
    pub const SESSION_ID: &str = "session.id";

    pub const SESSION_PAUSED: &str = "lens.session.paused";
    pub const SESSION_TITLE: &str = "lens.session.title";
    pub const ENGINE_TYPE: &str = "lens.engine.type";
    pub const WORKFLOW_ENGINE: &str = "lens.workflow.engine";

    pub const AGENT_CLASS: &str = "lens.agent.class";
    pub const AGENT_NAME: &str = "lens.agent.name";

    pub const WORKFLOW_TYPE: &str = "lens.workflow.type";
    pub const WORKFLOW_INPUT_JSON: &str = "lens.workflow.input_json";
    pub const WORKFLOW_OUTPUT_JSON: &str = "lens.workflow.output_json";

    pub const TOOL_NAME: &str = "lens.tool.name";
    pub const TOOL_INPUT_JSON: &str = "lens.tool.input_json";
    pub const TOOL_OUTPUT_JSON: &str = "lens.tool.output_json";

    pub const LLM_PROVIDER: &str = "lens.llm.provider";
    pub const LLM_MODEL: &str = "lens.llm.model";
    pub const LLM_PROMPT_JSON: &str = "lens.llm.prompt_json";
    pub const LLM_RESPONSE_JSON: &str = "lens.llm.response_json";

    pub const RPC_METHOD: &str = "lens.rpc.method";
    pub const RPC_ID: &str = "lens.rpc.id";
    pub const RPC_TRANSPORT: &str = "lens.rpc.transport";
    pub const RPC_DIRECTION: &str = "lens.rpc.direction";
    pub const RPC_DURATION_MS: &str = "lens.rpc.duration_ms";

    pub const STATUS_CODE: &str = "lens.status.code";
    pub const ERROR_CODE: &str = "lens.error.code";
    pub const ERROR_MESSAGE: &str = "lens.error.message";

    /// Dynamic prefixes: `lens.state.<description>_json`, `lens.result.<description>_json`.
    pub const STATE_PREFIX: &str = "lens.state.";
    pub const RESULT_PREFIX: &str = "lens.result.";
}

/// Name of the root workflow span; the session deriver keys "running" off it.
pub const ROOT_SPAN_NAME: &str = "workflow.run";

/// Per-attribute size ceiling (30 KiB). Larger values are clipped and flagged
/// with a `<key>_truncated` marker.
pub const MAX_ATTRIBUTE_SIZE: usize = 30 * 1024;

// ─── Span record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusCode {
    Ok,
    Error,
    #[default]
    Unset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanStatus {
    pub status_code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One observed unit of work, as written to the trace log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub span_id: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SpanStatus>,
}

impl SpanRecord {
    /// Start a new span under an optional parent.
    pub fn start(name: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            span_id: uuid::Uuid::new_v4().simple().to_string(),
            trace_id: trace_id.into(),
            parent_span_id: None,
            name: name.into(),
            start_time: Utc::now(),
            end_time: None,
            attributes: Map::new(),
            status: None,
        }
    }

    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    /// Set a JSON-string attribute, clipping to [`MAX_ATTRIBUTE_SIZE`] and
    /// marking `<key>_truncated` when clipped.
    pub fn set_json_attribute(&mut self, key: &str, json: &str) {
        let (value, truncated) = truncate_attribute(json, MAX_ATTRIBUTE_SIZE);
        if truncated {
            self.attributes
                .insert(format!("{key}_truncated"), Value::Bool(true));
        }
        self.attributes
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn set_status(&mut self, status_code: StatusCode, message: Option<String>) {
        self.status = Some(SpanStatus {
            status_code,
            message,
        });
    }

    /// Close the span. Idempotent: the first end time wins.
    pub fn finish(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }
}

/// Clip `value` to `max_size` bytes on a char boundary.
pub fn truncate_attribute(value: &str, max_size: usize) -> (&str, bool) {
    if value.len() <= max_size {
        return (value, false);
    }
    let mut cut = max_size;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    (&value[..cut], true)
}

// ─── Canonical JSON capability ───────────────────────────────────────────────

/// Capability: a value that can produce a canonical JSON representation for
/// span capture. The blanket impl over `Serialize` is the generic-container
/// fallback; domain types needing a custom shape implement this directly.
pub trait CanonicalJson {
    fn canonical_json(&self) -> Option<Value>;
}

impl<T: Serialize> CanonicalJson for T {
    fn canonical_json(&self) -> Option<Value> {
        serde_json::to_value(self).ok()
    }
}
