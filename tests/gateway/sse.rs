use crate::support::GatewayTestServer;
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;

use tracelens::events::LiveEvent;

/// Pull SSE frames (blocks separated by a blank line) off a streaming
/// response until `count` frames have arrived.
async fn read_frames(response: reqwest::Response, count: usize) -> Vec<String> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut frames = Vec::new();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while frames.len() < count {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("timed out waiting for SSE frames")
            .expect("stream ended before expected frames")
            .expect("stream chunk should be readable");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(split) = buffer.find("\n\n") {
            frames.push(buffer[..split].to_string());
            buffer = buffer[split + 2..].to_string();
        }
    }
    frames
}

fn data_json(frame: &str) -> Value {
    let data_line = frame
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .expect("frame should carry a data line");
    serde_json::from_str(data_line).expect("data line should be JSON")
}

#[tokio::test]
async fn stream_opens_with_connected_sentinel_then_delivers_events() {
    let server = GatewayTestServer::start().await;

    let response = reqwest::Client::new()
        .get(server.url("/events"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    // Give the subscriber a moment to register before publishing.
    for _ in 0..100 {
        if server.events.client_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.events.client_count(), 1);

    server.events.publish(LiveEvent::SessionStarted {
        session_id: "sse-1".into(),
        engine: "tokio".into(),
        title: "SSE test".into(),
        start_time: "2026-01-01T00:00:00Z".into(),
    });
    server.events.publish(LiveEvent::SessionFinished {
        session_id: "sse-1".into(),
        status: "completed".into(),
        end_time: "2026-01-01T00:01:00Z".into(),
        error: None,
    });

    let frames = read_frames(response, 3).await;

    let sentinel = data_json(&frames[0]);
    assert_eq!(sentinel["type"], "Connected");
    assert!(!frames[0].contains("id: "));
    assert!(frames[0].contains("retry: 2000"));

    let started = data_json(&frames[1]);
    assert_eq!(started["type"], "SessionStarted");
    assert_eq!(started["session_id"], "sse-1");
    assert!(frames[1].starts_with("id: "));

    let finished = data_json(&frames[2]);
    assert_eq!(finished["type"], "SessionFinished");
    assert!(
        finished["event_id"].as_u64().unwrap() > started["event_id"].as_u64().unwrap(),
        "sequence ids must increase"
    );
}

#[tokio::test]
async fn disconnecting_client_is_deregistered() {
    let server = GatewayTestServer::start().await;

    let response = reqwest::Client::new()
        .get(server.url("/events"))
        .send()
        .await
        .unwrap();
    for _ in 0..100 {
        if server.events.client_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.events.client_count(), 1);

    drop(response);

    // Teardown runs when the transport notices the disconnect; publishing
    // nudges the generator so the drop guard fires.
    for _ in 0..200 {
        server.events.publish(LiveEvent::Heartbeat {
            session_id: "nudge".into(),
            llm_calls_delta: 0,
            tokens_delta: 0,
        });
        if server.events.client_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("disconnected client was never deregistered");
}
