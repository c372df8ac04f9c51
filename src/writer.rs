//! Trace writer: appends span batches to a per-session gzip JSONL log.
//!
//! One writer owns one session's log file. The file path is resolved lazily
//! on the first export because the session id is usually unknown until the
//! first span arrives (carried by the ambient context, a `session.id` span
//! attribute, or an explicit override). Rotation is stat-based so a restarted
//! process keeps honoring the size threshold of a file it did not create.
//!
//! Each batch is appended as an independent gzip member; readers must use a
//! multi-member decoder.

use crate::config::{StorageConfig, UniqueIdSource};
use crate::context;
use crate::error::ExportError;
use crate::span::SpanRecord;
use chrono::Local;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Result of one export batch, reported to the framework's export contract.
/// Failures are logged here; the caller decides retry/drop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
struct WriterSettings {
    traces_dir: PathBuf,
    path_pattern: String,
    unique_id: UniqueIdSource,
    timestamp_format: String,
    max_file_size: u64,
    custom_path: Option<PathBuf>,
    session_id: Option<String>,
}

#[derive(Debug, Default)]
struct WriterState {
    /// Base path resolved on first export; chunk suffixes derive from it.
    base_path: Option<PathBuf>,
    current_chunk: u32,
}

/// Single-writer, append-only span log for one session.
pub struct TraceWriter {
    settings: WriterSettings,
    // One lock covers rotation-check-then-append so two concurrent exports
    // cannot rotate twice.
    state: Mutex<WriterState>,
}

impl TraceWriter {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            settings: WriterSettings {
                traces_dir: PathBuf::from(shellexpand::tilde(&storage.traces_dir).into_owned()),
                path_pattern: storage.path_pattern.clone(),
                unique_id: storage.unique_id,
                timestamp_format: storage.timestamp_format.clone(),
                max_file_size: storage.max_trace_size,
                custom_path: None,
                session_id: None,
            },
            state: Mutex::new(WriterState::default()),
        }
    }

    /// Pin the session id instead of resolving it from the first batch.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.settings.session_id = Some(session_id.into());
        self
    }

    /// Write to an explicit file path, bypassing pattern resolution.
    pub fn with_custom_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.custom_path = Some(path.into());
        self
    }

    /// Append a batch of spans to the session's current log file.
    ///
    /// I/O errors are caught and logged, never raised into the emitting call
    /// path. Blocking file work runs on the blocking pool.
    pub async fn export(self: &Arc<Self>, spans: Vec<SpanRecord>) -> ExportOutcome {
        if spans.is_empty() {
            return ExportOutcome::Success;
        }

        // The ambient id lives in task-local storage, which the blocking
        // pool cannot see; resolve it before moving off the runtime.
        let ambient_id = context::session_id();
        let writer = Arc::clone(self);
        let outcome =
            tokio::task::spawn_blocking(move || writer.export_blocking(&spans, &ambient_id)).await;

        match outcome {
            Ok(Ok(())) => ExportOutcome::Success,
            Ok(Err(error)) => {
                tracing::error!(%error, "failed to export span batch");
                ExportOutcome::Failure
            }
            Err(error) => {
                tracing::error!(%error, "span export task failed");
                ExportOutcome::Failure
            }
        }
    }

    fn export_blocking(&self, spans: &[SpanRecord], ambient_id: &str) -> Result<(), ExportError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let path = self.current_path(&mut state, spans, ambient_id)?;
        let write_err = |e: std::io::Error| ExportError::Write(e.to_string());

        let mut encoded = Vec::new();
        for span in spans {
            serde_json::to_writer(&mut encoded, span)
                .map_err(|e| ExportError::Write(e.to_string()))?;
            encoded.push(b'\n');
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(write_err)?;
        if path.extension().is_some_and(|ext| ext == "gz") {
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&encoded).map_err(write_err)?;
            let mut file = encoder.finish().map_err(write_err)?;
            file.flush().map_err(write_err)?;
        } else {
            let mut file = file;
            file.write_all(&encoded).map_err(write_err)?;
            file.flush().map_err(write_err)?;
        }

        tracing::debug!(count = spans.len(), "exported span batch");
        Ok(())
    }

    /// Resolve (lazily) and rotate (if oversized) the active file path.
    fn current_path(
        &self,
        state: &mut WriterState,
        spans: &[SpanRecord],
        ambient_id: &str,
    ) -> Result<PathBuf, ExportError> {
        if state.base_path.is_none() {
            let base = self.resolve_base_path(spans, ambient_id);
            if let Some(parent) = base.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ExportError::PathResolution(e.to_string()))?;
            }
            state.base_path = Some(base);
        }
        let base = state
            .base_path
            .clone()
            .ok_or_else(|| ExportError::PathResolution("trace file path unresolved".into()))?;

        let mut path = chunk_path(&base, state.current_chunk);
        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.len() >= self.settings.max_file_size {
                state.current_chunk += 1;
                path = chunk_path(&base, state.current_chunk);
                tracing::info!(chunk = state.current_chunk, "rotated trace file");
            }
        }
        Ok(path)
    }

    fn resolve_base_path(&self, spans: &[SpanRecord], ambient_id: &str) -> PathBuf {
        if let Some(custom) = &self.settings.custom_path {
            return custom.clone();
        }

        let unique_id = match self.settings.unique_id {
            UniqueIdSource::SessionId => sanitize_session_id(&self.resolve_session_id(
                spans,
                ambient_id,
            )),
            UniqueIdSource::Timestamp => Local::now()
                .format(&self.settings.timestamp_format)
                .to_string(),
        };

        let rendered = self.settings.path_pattern.replace("{unique_id}", &unique_id);
        let rendered = PathBuf::from(shellexpand::tilde(&rendered).into_owned());
        if rendered.is_absolute() {
            rendered
        } else {
            self.settings.traces_dir.join(rendered)
        }
    }

    fn resolve_session_id(&self, spans: &[SpanRecord], ambient_id: &str) -> String {
        if let Some(id) = &self.settings.session_id {
            return id.clone();
        }
        if let Some(id) = spans
            .iter()
            .find_map(|span| span.attributes.get(crate::span::keys::SESSION_ID))
            .and_then(serde_json::Value::as_str)
        {
            return id.to_string();
        }
        if ambient_id != context::UNKNOWN_SESSION {
            return ambient_id.to_string();
        }
        uuid::Uuid::new_v4().to_string()
    }
}

/// Replace any character outside `[A-Za-z0-9_-]` so the id is a safe filename.
pub fn sanitize_session_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `{base}.jsonl.gz` for chunk 0, `{base}.chunk_N.jsonl.gz` afterwards.
fn chunk_path(base: &Path, chunk: u32) -> PathBuf {
    if chunk == 0 {
        return base.to_path_buf();
    }
    let name = base.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let (stem, suffix) = split_log_suffix(&name);
    let rotated = format!("{stem}.chunk_{chunk}{suffix}");
    base.with_file_name(rotated)
}

fn split_log_suffix(name: &str) -> (&str, &str) {
    for suffix in [".jsonl.gz", ".jsonl", ".gz"] {
        if let Some(stem) = name.strip_suffix(suffix) {
            return (stem, suffix);
        }
    }
    (name, "")
}
