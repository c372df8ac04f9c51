//! Session status derivation and listing.
//!
//! A session is not stored anywhere: it is a read-time projection over its
//! trace log. Status is recomputed from the file on every read, tolerating
//! out-of-order lines, truncated trailing writes, and corrupt records.
//!
//! The paused check deliberately scans every line of the log — any span may
//! carry the paused flag, so there is no sound short-circuit. That makes a
//! full listing O(total trace bytes); a known limitation, kept for
//! correctness.

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::span::{ROOT_SPAN_NAME, keys};

/// Default execution-engine tag when the root span does not carry one.
pub const DEFAULT_ENGINE: &str = "tokio";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Display metadata for one session, derived from its trace log.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub id: String,
    pub status: SessionStatus,
    pub started_at: String,
    pub engine: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

/// Derive a session's metadata from its trace log.
///
/// Returns `None` when the file is unreadable or its first line is not a
/// span record — the session is skipped, never an error for the caller.
pub async fn derive_session_meta(path: &Path) -> Option<SessionMeta> {
    let session_id = session_id_from_path(path);
    let owned = path.to_path_buf();
    let text = tokio::task::spawn_blocking(move || read_log_text(&owned))
        .await
        .ok()?;
    let text = match text {
        Ok(text) => text,
        Err(error) => {
            tracing::warn!(session = session_id, %error, "failed to read trace log");
            return None;
        }
    };
    derive_from_lines(&session_id, &text)
}

/// List every session in the trace directory, newest first.
///
/// Both compressed and plain log files are considered; files that fail
/// derivation are dropped. Sorting compares the fixed-width UTC timestamps
/// lexicographically.
pub async fn list_sessions(traces_dir: &Path) -> Vec<SessionMeta> {
    let mut paths: Vec<PathBuf> = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(traces_dir).await else {
        return Vec::new();
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if is_trace_log(&path) {
            paths.push(path);
        }
    }

    let derived = join_all(paths.iter().map(|path| derive_session_meta(path))).await;
    let mut sessions: Vec<SessionMeta> = derived.into_iter().flatten().collect();
    sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    sessions
}

fn is_trace_log(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.ends_with(".jsonl.gz") || name.ends_with(".jsonl")
}

/// Base filename sans log extension: the session's identity.
pub fn session_id_from_path(path: &Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.strip_suffix(".jsonl.gz")
        .or_else(|| name.strip_suffix(".jsonl"))
        .unwrap_or(&name)
        .to_string()
}

/// Read a log file fully, decompressing when the extension says gzip.
///
/// Trace files hold one gzip member per exported batch, hence the
/// multi-member decoder.
pub(crate) fn read_log_text(path: &Path) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    let mut text = String::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        flate2::read::MultiGzDecoder::new(file).read_to_string(&mut text)?;
    } else {
        let mut file = file;
        file.read_to_string(&mut text)?;
    }
    Ok(text)
}

/// Pure derivation over the decoded log text.
fn derive_from_lines(session_id: &str, text: &str) -> Option<SessionMeta> {
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();

    // The first line is the authoritative root span; an unparsable first
    // line makes the whole session unreadable.
    let first_span: Value = match serde_json::from_str(lines.first()?) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(session = session_id, %error, "unparsable root span, skipping session");
            return None;
        }
    };

    // Walk backward from the end until a line parses, tolerating a
    // truncated trailing write.
    let last_span: Option<Value> = lines
        .iter()
        .rev()
        .find_map(|line| serde_json::from_str(line).ok());

    // Paused wins over everything and may sit on any span in the file;
    // scan every line, skipping corrupt ones.
    let is_paused = lines.iter().any(|line| {
        serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|span| {
                span.get("attributes")
                    .and_then(|attrs| attrs.get(keys::SESSION_PAUSED))
                    .map(is_truthy)
            })
            .unwrap_or(false)
    });

    let root_open = first_span.get("name").and_then(Value::as_str) == Some(ROOT_SPAN_NAME)
        && first_span.get("end_time").and_then(Value::as_str).is_none();
    let last_errored = last_span
        .as_ref()
        .and_then(|span| span.get("status"))
        .and_then(|status| status.get("status_code"))
        .and_then(Value::as_str)
        == Some("ERROR");

    let status = if is_paused {
        SessionStatus::Paused
    } else if root_open {
        SessionStatus::Running
    } else if last_errored {
        SessionStatus::Failed
    } else {
        SessionStatus::Completed
    };

    let started_at = first_span
        .get("start_time")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let ended_at = last_span
        .as_ref()
        .and_then(|span| span.get("end_time"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let attributes = first_span.get("attributes").cloned().unwrap_or(Value::Null);
    let engine = attributes
        .get(keys::ENGINE_TYPE)
        .or_else(|| attributes.get(keys::WORKFLOW_ENGINE))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_ENGINE)
        .to_string();

    let title = attributes
        .get(keys::SESSION_TITLE)
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            attributes
                .get(keys::WORKFLOW_TYPE)
                .and_then(Value::as_str)
                .map(|workflow| format!("{workflow} - {}", short_id(session_id)))
        })
        .unwrap_or_else(|| format!("Session {}", short_id(session_id)));

    Some(SessionMeta {
        id: session_id.to_string(),
        status,
        started_at,
        engine,
        title,
        ended_at,
    })
}

/// Truthiness in the loose sense the paused flag is written with: spans may
/// carry `true`, `1`, or a non-empty string.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

fn short_id(id: &str) -> &str {
    let mut end = id.len().min(8);
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    &id[..end]
}
