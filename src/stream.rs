//! Trace file streaming: the read path behind `GET /trace/{session_id}`.
//!
//! Serves a session's log with full-file, byte-range, and conditional
//! semantics. Full-file responses ship the stored gzip bytes verbatim (the
//! cheap path); range responses address the *decompressed* stream, decoding
//! sequentially and materializing only the slice that intersects the
//! requested window. All file I/O runs off the async runtime.
//!
//! Validation is ordered and fail-fast; every rejection maps to a distinct
//! [`ReadError`] so callers can script against the outcome, and no message
//! ever carries a filesystem path.

use crate::error::ReadError;
use axum::body::{Body, Bytes};
use axum::http::{Response, StatusCode, header};
use flate2::read::MultiGzDecoder;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const CHUNK_SIZE: usize = 64 * 1024;
const MEDIA_TYPE: &str = "application/x-ndjson";

// ─── Identifier validation ───────────────────────────────────────────────────

/// Reject identifiers that could escape the trace directory, checking both
/// the raw and percent-decoded forms before any filesystem access.
pub fn validate_session_id(session_id: &str) -> Result<(), ReadError> {
    let decoded = percent_decode(session_id);
    for candidate in [session_id, decoded.as_str()] {
        if candidate.contains("..") || candidate.contains('/') || candidate.contains('\\') {
            return Err(ReadError::BadId);
        }
    }
    let well_formed = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !well_formed {
        return Err(ReadError::BadFormat);
    }
    Ok(())
}

/// Minimal percent-decoding; invalid escapes pass through unchanged.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3);
            if let Some(decoded) = hex.and_then(|h| {
                let h = std::str::from_utf8(h).ok()?;
                u8::from_str_radix(h, 16).ok()
            }) {
                out.push(decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ─── Range parsing ───────────────────────────────────────────────────────────

/// Parsed `Range: bytes=start-end` header; `end` is inclusive and optional
/// (absent = to EOF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeSpec {
    /// First byte offset past the window, if bounded.
    fn end_exclusive(self) -> Option<u64> {
        self.end.map(|end| end + 1)
    }
}

pub fn parse_range(header: &str) -> Result<RangeSpec, ReadError> {
    let spec = header.strip_prefix("bytes=").ok_or(ReadError::BadRange)?;
    let (start_raw, end_raw) = spec.split_once('-').ok_or(ReadError::BadRange)?;
    let start: u64 = start_raw.parse().map_err(|_| ReadError::BadRange)?;
    let end = if end_raw.is_empty() {
        None
    } else {
        let end: u64 = end_raw.parse().map_err(|_| ReadError::BadRange)?;
        if end < start {
            return Err(ReadError::BadRange);
        }
        Some(end)
    };
    Ok(RangeSpec { start, end })
}

// ─── Cache validator ─────────────────────────────────────────────────────────

/// Weak validator from mutation time and size, not content hash.
pub fn generate_etag(meta: &std::fs::Metadata) -> String {
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    format!("W/\"{mtime_ns}-{}\"", meta.len())
}

// ─── Request handling ────────────────────────────────────────────────────────

/// Serve a trace file with conditional and range semantics.
///
/// Validation order: identifier, path resolution, containment, cache check,
/// range parse. Errors map 1:1 to HTTP statuses in the gateway.
pub async fn serve_trace(
    traces_dir: &Path,
    session_id: &str,
    if_none_match: Option<&str>,
    range: Option<&str>,
) -> Result<Response<Body>, ReadError> {
    validate_session_id(session_id)?;

    let (path, compressed) = resolve_trace_path(traces_dir, session_id).await?;

    let meta = tokio::fs::metadata(&path).await?;
    let etag = generate_etag(&meta);

    if if_none_match == Some(etag.as_str()) {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        response
            .headers_mut()
            .insert(header::ETAG, header_value(&etag));
        return Ok(response);
    }

    match range {
        Some(range) => {
            let spec = parse_range(range)?;
            serve_range(&path, compressed, spec, &etag).await
        }
        None => serve_full(&path, compressed, meta.len(), &etag).await,
    }
}

/// Try the compressed name first, then the plain one; verify the resolved
/// path is still nested under the trace directory (symlink defense).
async fn resolve_trace_path(
    traces_dir: &Path,
    session_id: &str,
) -> Result<(PathBuf, bool), ReadError> {
    let candidates = [
        (traces_dir.join(format!("{session_id}.jsonl.gz")), true),
        (traces_dir.join(format!("{session_id}.jsonl")), false),
    ];
    for (candidate, compressed) in candidates {
        if tokio::fs::metadata(&candidate).await.is_ok() {
            let resolved = tokio::fs::canonicalize(&candidate)
                .await
                .map_err(|_| ReadError::NotFound)?;
            let root = tokio::fs::canonicalize(traces_dir)
                .await
                .map_err(|_| ReadError::NotFound)?;
            if !resolved.starts_with(&root) {
                return Err(ReadError::Forbidden);
            }
            return Ok((resolved, compressed));
        }
    }
    Err(ReadError::NotFound)
}

/// Full-file path: stream native bytes as-is in fixed chunks. Compressed
/// sources keep their stored encoding — no decompression work at all.
async fn serve_full(
    path: &Path,
    compressed: bool,
    file_size: u64,
    etag: &str,
) -> Result<Response<Body>, ReadError> {
    let file = tokio::fs::File::open(path).await?;
    let stream = tokio_util::io::ReaderStream::with_capacity(file, CHUNK_SIZE);

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, header_value(MEDIA_TYPE));
    headers.insert(header::CONTENT_LENGTH, header_value(&file_size.to_string()));
    headers.insert(header::ETAG, header_value(etag));
    headers.insert(header::ACCEPT_RANGES, header_value("bytes"));
    if compressed {
        headers.insert(header::CONTENT_ENCODING, header_value("gzip"));
    }
    Ok(response)
}

/// Range path: the window addresses decompressed bytes, so the response
/// never carries `Content-Encoding`.
async fn serve_range(
    path: &Path,
    compressed: bool,
    spec: RangeSpec,
    etag: &str,
) -> Result<Response<Body>, ReadError> {
    let owned = path.to_path_buf();
    let chunks = tokio::task::spawn_blocking(move || {
        if compressed {
            read_decompressed_window(&owned, spec)
        } else {
            read_plain_window(&owned, spec)
        }
    })
    .await
    .map_err(|_| ReadError::Io(std::io::Error::other("range read task failed")))??;

    let content_range = format!(
        "bytes {}-{}/*",
        spec.start,
        spec.end.map(|e| e.to_string()).unwrap_or_default()
    );

    let body = Body::from_stream(futures_util::stream::iter(
        chunks.into_iter().map(Ok::<_, std::convert::Infallible>),
    ));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, header_value(MEDIA_TYPE));
    headers.insert(header::CONTENT_RANGE, header_value(&content_range));
    headers.insert(header::ETAG, header_value(etag));
    headers.insert(header::ACCEPT_RANGES, header_value("bytes"));
    Ok(response)
}

/// Sequentially decode the gzip stream, keeping only the slices that
/// intersect the window and stopping once past its end. Memory use is
/// bounded by the window, never the whole decompressed file.
fn read_decompressed_window(path: &Path, spec: RangeSpec) -> Result<Vec<Bytes>, ReadError> {
    let file = std::fs::File::open(path)?;
    let mut decoder = MultiGzDecoder::new(file);
    let end_exclusive = spec.end_exclusive();

    let mut chunks = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut position: u64 = 0;
    loop {
        let read = match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        let chunk_start = position;
        let chunk_end = position + read as u64;
        position = chunk_end;

        if let Some(end) = end_exclusive {
            if chunk_start >= end {
                break;
            }
        }
        if chunk_end <= spec.start {
            continue;
        }

        let slice_start = spec.start.saturating_sub(chunk_start) as usize;
        let slice_end = end_exclusive
            .map_or(read, |end| read.min((end - chunk_start) as usize));
        if slice_start < slice_end {
            chunks.push(Bytes::copy_from_slice(&buf[slice_start..slice_end]));
        }
    }
    Ok(chunks)
}

/// Plain files support a direct seek.
fn read_plain_window(path: &Path, spec: RangeSpec) -> Result<Vec<Bytes>, ReadError> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(spec.start))?;

    let mut chunks = Vec::new();
    let mut remaining = spec
        .end_exclusive()
        .map(|end| end.saturating_sub(spec.start));
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let want = match remaining {
            Some(0) => break,
            Some(n) => buf.len().min(usize::try_from(n).unwrap_or(usize::MAX)),
            None => buf.len(),
        };
        let read = match file.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        chunks.push(Bytes::copy_from_slice(&buf[..read]));
        if let Some(n) = remaining {
            remaining = Some(n - read as u64);
        }
    }
    Ok(chunks)
}

fn header_value(value: &str) -> header::HeaderValue {
    header::HeaderValue::from_str(value)
        .unwrap_or_else(|_| header::HeaderValue::from_static("invalid"))
}
