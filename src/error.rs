use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `tracelens`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum LensError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Trace persistence ───────────────────────────────────────────────
    #[error("export: {0}")]
    Export(#[from] ExportError),

    // ── Read path (trace streaming) ─────────────────────────────────────
    #[error("trace read: {0}")]
    Read(#[from] ReadError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

// ─── Trace persistence errors ───────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to resolve trace file path: {0}")]
    PathResolution(String),

    #[error("write failed: {0}")]
    Write(String),
}

// ─── Read-path errors ───────────────────────────────────────────────────────
//
// Each variant maps to a distinct HTTP status so callers can script against
// the outcome. Messages never include filesystem paths.

#[derive(Debug, Error)]
pub enum ReadError {
    /// 400 — identifier contains a path separator or parent-dir sequence.
    #[error("invalid session id")]
    BadId,

    /// 400 — identifier fails the strict allow-list pattern.
    #[error("invalid session id format")]
    BadFormat,

    /// 400 — Range header present but unparsable.
    #[error("invalid range header")]
    BadRange,

    /// 404 — no trace file for this session.
    #[error("trace not found")]
    NotFound,

    /// 403 — resolved path escapes the trace directory.
    #[error("forbidden")]
    Forbidden,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, LensError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_displays_correctly() {
        let err = LensError::Config(ConfigError::Validation("bad port".into()));
        assert!(err.to_string().contains("validation failed"));
    }

    #[test]
    fn read_errors_never_leak_paths() {
        for err in [
            ReadError::BadId,
            ReadError::BadFormat,
            ReadError::BadRange,
            ReadError::NotFound,
            ReadError::Forbidden,
        ] {
            assert!(!err.to_string().contains('/'));
        }
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let lens_err: LensError = anyhow_err.into();
        assert!(lens_err.to_string().contains("something went wrong"));
    }

    #[test]
    fn export_error_displays_correctly() {
        let err = LensError::Export(ExportError::Write("disk full".into()));
        assert!(err.to_string().contains("disk full"));
    }
}
