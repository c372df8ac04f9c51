//! Live session event stream.
//!
//! In-process publish/subscribe of lifecycle events to long-lived SSE
//! subscribers. Delivery is best-effort: each subscriber owns a bounded FIFO
//! queue, and a full queue drops the event for that subscriber only — a slow
//! reader never stalls the publisher or its peers. Events may be dropped,
//! never reordered.

use axum::body::Body;
use axum::http::{Response, StatusCode, header};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Reconnection-delay hint sent with every SSE message.
pub const RETRY_HINT_MS: u64 = 2000;

/// Idle window after which a synthetic heartbeat keeps proxies from closing
/// the connection.
pub const IDLE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ─── Events ──────────────────────────────────────────────────────────────────

/// Ephemeral lifecycle events; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LiveEvent {
    SessionStarted {
        session_id: String,
        engine: String,
        title: String,
        start_time: String,
    },
    SessionFinished {
        session_id: String,
        status: String,
        end_time: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WaitingOnSignal {
        session_id: String,
        signal_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
    Heartbeat {
        session_id: String,
        llm_calls_delta: u64,
        tokens_delta: u64,
    },
}

/// One published event with its stream-assigned sequence id and timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event_id: u64,
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LiveEvent,
}

// ─── Stream ──────────────────────────────────────────────────────────────────

struct Client {
    id: u64,
    sender: mpsc::Sender<EventEnvelope>,
}

/// Subscription handle: the receiving half of one client's bounded queue.
pub struct Subscription {
    pub client_id: u64,
    pub receiver: mpsc::Receiver<EventEnvelope>,
}

/// Fan-out hub for [`LiveEvent`]s.
pub struct EventStream {
    clients: Mutex<Vec<Client>>,
    next_client_id: AtomicU64,
    event_counter: AtomicU64,
    buffer_size: usize,
    max_clients: usize,
}

impl EventStream {
    pub fn new(buffer_size: usize, max_clients: usize) -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            next_client_id: AtomicU64::new(1),
            event_counter: AtomicU64::new(0),
            buffer_size,
            max_clients,
        }
    }

    /// Register a subscriber. `None` when the stream is at capacity.
    pub fn add_client(&self) -> Option<Subscription> {
        let (sender, receiver) = mpsc::channel(self.buffer_size);
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.lock();
        if clients.len() >= self.max_clients {
            return None;
        }
        clients.push(Client {
            id: client_id,
            sender,
        });
        Some(Subscription {
            client_id,
            receiver,
        })
    }

    /// Deregister a subscriber; unknown ids are ignored.
    pub fn remove_client(&self, client_id: u64) {
        self.lock().retain(|client| client.id != client_id);
    }

    /// Publish to every subscriber without blocking.
    ///
    /// The sequence id is assigned under the subscriber-list lock so each
    /// queue observes strictly increasing ids in publish order.
    pub fn publish(&self, event: LiveEvent) -> EventEnvelope {
        let clients = self.lock();
        let envelope = EventEnvelope {
            event_id: self.event_counter.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            event,
        };
        for client in clients.iter() {
            // Full queue: drop for this subscriber only.
            let _ = client.sender.try_send(envelope.clone());
        }
        envelope
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Client>> {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ─── SSE framing ─────────────────────────────────────────────────────────────

/// One SSE message: sequence id, JSON payload, reconnection hint.
pub fn format_sse(envelope: &EventEnvelope) -> String {
    let data = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".into());
    format!(
        "id: {}\ndata: {data}\nretry: {RETRY_HINT_MS}\n\n",
        envelope.event_id
    )
}

/// An SSE message without a sequence id (sentinel and keepalive frames).
fn format_sse_raw(data: &Value) -> String {
    format!("data: {data}\nretry: {RETRY_HINT_MS}\n\n")
}

fn connected_sentinel() -> String {
    format_sse_raw(&serde_json::json!({
        "type": "Connected",
        "message": "Connected to tracelens event stream",
    }))
}

fn idle_heartbeat() -> String {
    format_sse_raw(&serde_json::json!({
        "type": "Heartbeat",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
    }))
}

/// Build the long-lived `text/event-stream` response for one subscriber.
///
/// The generator races the client queue against the idle deadline; whichever
/// wins decides whether a real event or a keepalive goes out. Queue
/// deregistration is tied to a drop guard so it runs on every exit path,
/// disconnect and cancellation included.
pub fn sse_response(stream: std::sync::Arc<EventStream>) -> Response<Body> {
    let Some(subscription) = stream.add_client() else {
        let mut response = Response::new(Body::from("event stream at capacity"));
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        return response;
    };

    struct Deregister {
        stream: std::sync::Arc<EventStream>,
        client_id: u64,
    }
    impl Drop for Deregister {
        fn drop(&mut self) {
            self.stream.remove_client(self.client_id);
        }
    }

    let guard = Deregister {
        stream,
        client_id: subscription.client_id,
    };
    let mut receiver = subscription.receiver;

    let body = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, std::convert::Infallible>(connected_sentinel());
        loop {
            match tokio::time::timeout(IDLE_HEARTBEAT_INTERVAL, receiver.recv()).await {
                Ok(Some(envelope)) => yield Ok(format_sse(&envelope)),
                // Sender side gone: the hub dropped this client.
                Ok(None) => break,
                Err(_elapsed) => yield Ok(idle_heartbeat()),
            }
        }
    };

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static("keep-alive"),
    );
    response
}
