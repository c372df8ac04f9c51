use crate::support::GatewayTestServer;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::Value;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracelens::config::StorageConfig;
use tracelens::span::{ROOT_SPAN_NAME, SpanRecord, keys};
use tracelens::writer::{ExportOutcome, TraceWriter};

fn root_line(start: &str, end: Option<&str>) -> String {
    let mut span = serde_json::json!({
        "span_id": "s1",
        "trace_id": "t1",
        "name": ROOT_SPAN_NAME,
        "start_time": start,
        "attributes": {},
    });
    if let Some(end) = end {
        span["end_time"] = Value::String(end.to_string());
    }
    span.to_string()
}

fn write_gzip_log(dir: &Path, name: &str, text: &str) {
    let file = std::fs::File::create(dir.join(name)).unwrap();
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap();
}

fn gunzip(bytes: &[u8]) -> String {
    let mut text = String::new();
    flate2::read::MultiGzDecoder::new(bytes)
        .read_to_string(&mut text)
        .unwrap();
    text
}

#[tokio::test]
async fn health_reports_name_and_version() {
    let server = GatewayTestServer::start().await;
    let body: Value = reqwest::get(server.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["name"], "tracelens");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn sessions_are_listed_newest_first() {
    let server = GatewayTestServer::start().await;
    write_gzip_log(
        server.traces.path(),
        "older.jsonl.gz",
        &root_line("2026-01-01T00:00:00Z", Some("2026-01-01T01:00:00Z")),
    );
    write_gzip_log(
        server.traces.path(),
        "newest.jsonl.gz",
        &root_line("2026-01-03T00:00:00Z", None),
    );
    write_gzip_log(
        server.traces.path(),
        "middle.jsonl.gz",
        &root_line("2026-01-02T00:00:00Z", Some("2026-01-02T01:00:00Z")),
    );

    let body: Value = reqwest::get(server.url("/sessions"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = body["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["newest", "middle", "older"]);
    assert_eq!(body["sessions"][0]["status"], "running");
    assert_eq!(body["sessions"][1]["status"], "completed");
}

#[tokio::test]
async fn full_trace_read_reassembles_original_lines() {
    let server = GatewayTestServer::start().await;

    // Write through the real exporter: two batches, one gzip member each.
    let storage = StorageConfig {
        traces_dir: server.traces.path().to_string_lossy().into_owned(),
        ..StorageConfig::default()
    };
    let writer = Arc::new(TraceWriter::new(&storage).with_session_id("rt-session"));
    let mut first = SpanRecord::start(ROOT_SPAN_NAME, "trace-rt");
    first.set_attribute(keys::SESSION_ID, "rt-session");
    let mut second = SpanRecord::start("tool.call", "trace-rt");
    second.finish();
    assert_eq!(
        writer.export(vec![first.clone()]).await,
        ExportOutcome::Success
    );
    assert_eq!(
        writer.export(vec![second.clone()]).await,
        ExportOutcome::Success
    );

    let response = reqwest::get(server.url("/trace/rt-session")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-encoding"].to_str().unwrap(),
        "gzip"
    );
    assert!(response.headers().contains_key("etag"));
    assert_eq!(
        response.headers()["accept-ranges"].to_str().unwrap(),
        "bytes"
    );

    let text = gunzip(&response.bytes().await.unwrap());
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    let parsed_first: SpanRecord = serde_json::from_str(lines[0]).unwrap();
    let parsed_second: SpanRecord = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(parsed_first.span_id, first.span_id);
    assert_eq!(parsed_second.span_id, second.span_id);
}

#[tokio::test]
async fn range_request_serves_decompressed_window() {
    let server = GatewayTestServer::start().await;
    let content = root_line("2026-01-01T00:00:00Z", None);
    write_gzip_log(server.traces.path(), "ranged.jsonl.gz", &content);

    let client = reqwest::Client::new();
    let response = client
        .get(server.url("/trace/ranged"))
        .header("Range", "bytes=0-49")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 206);
    assert!(!response.headers().contains_key("content-encoding"));
    assert_eq!(
        response.headers()["content-range"].to_str().unwrap(),
        "bytes 0-49/*"
    );
    let bytes = response.bytes().await.unwrap();
    assert_eq!(&bytes[..], &content.as_bytes()[..50]);
}

#[tokio::test]
async fn etag_round_trip_returns_not_modified() {
    let server = GatewayTestServer::start().await;
    write_gzip_log(
        server.traces.path(),
        "cached.jsonl.gz",
        &root_line("2026-01-01T00:00:00Z", None),
    );

    let client = reqwest::Client::new();
    let first = client
        .get(server.url("/trace/cached"))
        .send()
        .await
        .unwrap();
    let etag = first.headers()["etag"].to_str().unwrap().to_string();

    let second = client
        .get(server.url("/trace/cached"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.headers()["etag"].to_str().unwrap(), etag);

    let third = client
        .get(server.url("/trace/cached"))
        .header("If-None-Match", etag)
        .send()
        .await
        .unwrap();
    assert_eq!(third.status(), 304);
    assert!(third.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn traversal_and_malformed_ids_are_rejected() {
    let server = GatewayTestServer::start().await;
    let client = reqwest::Client::new();

    for bad in ["%2E%2E%2Fescape", "a%5Cb", "not%20valid", "dotted.id"] {
        let response = client
            .get(server.url(&format!("/trace/{bad}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "expected 400 for {bad}");
    }
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let server = GatewayTestServer::start().await;
    let response = reqwest::get(server.url("/trace/no-such-session"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "trace not found");
}

#[tokio::test]
async fn malformed_range_is_rejected() {
    let server = GatewayTestServer::start().await;
    write_gzip_log(
        server.traces.path(),
        "badrange.jsonl.gz",
        &root_line("2026-01-01T00:00:00Z", None),
    );

    let client = reqwest::Client::new();
    let response = client
        .get(server.url("/trace/badrange"))
        .header("Range", "bytes=oops")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
