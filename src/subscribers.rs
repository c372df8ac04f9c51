//! Built-in hook subscribers.
//!
//! Two families of callbacks attach to the bus: span enrichment (copy
//! lifecycle details onto the in-flight span) and session events (project
//! workflow lifecycle into the registry and the live event stream). Every
//! callback follows the instrumentation rule: failures are logged and
//! swallowed, the host never notices.

use crate::context;
use crate::events::{EventStream, LiveEvent};
use crate::hooks::{HookBus, HookCallback, HookId, HookPayload, names};
use crate::registry::SessionRegistry;
use crate::sessions::{DEFAULT_ENGINE, SessionStatus};
use crate::span::{StatusCode, keys};
use chrono::{SecondsFormat, Utc};
use futures_util::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Registration receipts for everything [`register_all`] attached.
pub struct SubscriberSet {
    entries: Vec<(&'static str, HookId)>,
}

impl SubscriberSet {
    /// Detach every subscriber. Mainly for tests needing a clean bus.
    pub fn unregister_all(&self, bus: &HookBus) {
        for (name, id) in &self.entries {
            bus.unregister(name, *id);
        }
    }
}

/// Attach all built-in subscribers to `bus`.
pub fn register_all(
    bus: &HookBus,
    registry: Arc<SessionRegistry>,
    stream: Arc<EventStream>,
    heartbeat_interval: Duration,
) -> SubscriberSet {
    let mut entries: Vec<(&'static str, HookId)> = Vec::new();
    let mut on = |name: &'static str, callback: HookCallback| {
        entries.push((name, bus.register(name, callback)));
    };

    // ── Span enrichment ──────────────────────────────────────────
    on(names::BEFORE_AGENT_CALL, enrich(enrich_agent_call));
    on(names::BEFORE_WORKFLOW_RUN, enrich(enrich_workflow_start));
    on(names::AFTER_WORKFLOW_RUN, enrich(enrich_workflow_success));
    on(names::ERROR_WORKFLOW_RUN, enrich(enrich_workflow_error));
    on(names::BEFORE_TOOL_CALL, enrich(enrich_tool_start));
    on(names::AFTER_TOOL_CALL, enrich(enrich_tool_success));
    on(names::ERROR_TOOL_CALL, enrich(enrich_tool_error));
    on(names::BEFORE_LLM_GENERATE, enrich(enrich_llm_start));
    on(names::AFTER_LLM_GENERATE, enrich(enrich_llm_success));
    on(names::BEFORE_RPC_REQUEST, enrich(enrich_rpc_start));
    on(names::AFTER_RPC_RESPONSE, enrich(enrich_rpc_success));
    on(names::ERROR_RPC_REQUEST, enrich(enrich_rpc_error));

    // ── Session events ───────────────────────────────────────────
    {
        let registry = Arc::clone(&registry);
        let stream = Arc::clone(&stream);
        on(
            names::BEFORE_WORKFLOW_RUN,
            Arc::new(move |payload| {
                let registry = Arc::clone(&registry);
                let stream = Arc::clone(&stream);
                async move {
                    start_session(&registry, &stream, heartbeat_interval, &payload);
                    Ok(())
                }
                .boxed()
            }),
        );
    }
    {
        let registry = Arc::clone(&registry);
        let stream = Arc::clone(&stream);
        on(
            names::SESSION_STARTED,
            Arc::new(move |payload| {
                let registry = Arc::clone(&registry);
                let stream = Arc::clone(&stream);
                async move {
                    start_session(&registry, &stream, heartbeat_interval, &payload);
                    Ok(())
                }
                .boxed()
            }),
        );
    }
    {
        let registry = Arc::clone(&registry);
        let stream = Arc::clone(&stream);
        on(
            names::AFTER_WORKFLOW_RUN,
            Arc::new(move |payload| {
                let registry = Arc::clone(&registry);
                let stream = Arc::clone(&stream);
                async move {
                    finish_session(&registry, &stream, &payload, SessionStatus::Completed, None);
                    Ok(())
                }
                .boxed()
            }),
        );
    }
    {
        let registry = Arc::clone(&registry);
        let stream = Arc::clone(&stream);
        on(
            names::ERROR_WORKFLOW_RUN,
            Arc::new(move |payload| {
                let registry = Arc::clone(&registry);
                let stream = Arc::clone(&stream);
                async move {
                    let error = payload.error.clone();
                    finish_session(&registry, &stream, &payload, SessionStatus::Failed, error);
                    Ok(())
                }
                .boxed()
            }),
        );
    }
    {
        let registry = Arc::clone(&registry);
        let stream = Arc::clone(&stream);
        on(
            names::SESSION_FINISHED,
            Arc::new(move |payload| {
                let registry = Arc::clone(&registry);
                let stream = Arc::clone(&stream);
                async move {
                    let status = match payload.status.as_deref() {
                        Some("failed") => SessionStatus::Failed,
                        _ => SessionStatus::Completed,
                    };
                    let error = payload.error.clone();
                    finish_session(&registry, &stream, &payload, status, error);
                    Ok(())
                }
                .boxed()
            }),
        );
    }
    {
        let stream = Arc::clone(&stream);
        on(
            names::WAITING_ON_SIGNAL,
            Arc::new(move |payload| {
                let stream = Arc::clone(&stream);
                async move {
                    let session_id = payload_session_id(&payload);
                    let Some(signal_name) = payload.subject.clone() else {
                        return Ok(());
                    };
                    stream.publish(LiveEvent::WaitingOnSignal {
                        session_id,
                        signal_name,
                        prompt: metadata_str(&payload, "prompt"),
                        schema: metadata_value(&payload, "schema"),
                    });
                    Ok(())
                }
                .boxed()
            }),
        );
    }
    {
        // Metric counting feeds heartbeat deltas.
        let registry = Arc::clone(&registry);
        on(
            names::AFTER_LLM_GENERATE,
            Arc::new(move |payload| {
                let registry = Arc::clone(&registry);
                async move {
                    let session_id = payload_session_id(&payload);
                    let tokens = metadata_value(&payload, "tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    registry.record_llm_call(&session_id, tokens);
                    Ok(())
                }
                .boxed()
            }),
        );
    }

    SubscriberSet { entries }
}

// ─── Session event plumbing ──────────────────────────────────────────────────

fn start_session(
    registry: &Arc<SessionRegistry>,
    stream: &Arc<EventStream>,
    heartbeat_interval: Duration,
    payload: &HookPayload,
) {
    let session_id = payload_session_id(payload);
    if session_id == context::UNKNOWN_SESSION {
        return;
    }
    // A duplicate start (session_started plus before_workflow_run) must not
    // spawn a second heartbeat task.
    if registry.is_active(&session_id) {
        return;
    }

    let engine = metadata_str(payload, "engine").unwrap_or_else(|| DEFAULT_ENGINE.to_string());
    let title = payload
        .subject
        .clone()
        .or_else(|| metadata_str(payload, "app_name").map(|app| format!("{app} Session")))
        .unwrap_or_else(|| format!("Session {}", session_id.chars().take(8).collect::<String>()));

    registry.add(&session_id, &engine, &title);
    stream.publish(LiveEvent::SessionStarted {
        session_id: session_id.clone(),
        engine,
        title,
        start_time: now_rfc3339(),
    });

    let task = tokio::spawn(heartbeat_loop(
        session_id.clone(),
        Arc::clone(registry),
        Arc::clone(stream),
        heartbeat_interval,
    ));
    registry.set_heartbeat_task(&session_id, task);
}

fn finish_session(
    registry: &Arc<SessionRegistry>,
    stream: &Arc<EventStream>,
    payload: &HookPayload,
    status: SessionStatus,
    error: Option<String>,
) {
    let session_id = payload_session_id(payload);
    if session_id == context::UNKNOWN_SESSION {
        return;
    }
    registry.finish(&session_id, status, error.clone());
    stream.publish(LiveEvent::SessionFinished {
        session_id,
        status: status.as_str().to_string(),
        end_time: now_rfc3339(),
        error,
    });
}

/// Periodic heartbeat for one session: publish metric deltas until the
/// session leaves the active set or the task is cancelled at finish.
async fn heartbeat_loop(
    session_id: String,
    registry: Arc<SessionRegistry>,
    stream: Arc<EventStream>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; skip it so heartbeats start one
    // interval after session start.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !registry.is_active(&session_id) {
            break;
        }
        let Some(delta) = registry.update_metrics(&session_id) else {
            break;
        };
        stream.publish(LiveEvent::Heartbeat {
            session_id: session_id.clone(),
            llm_calls_delta: delta.llm_calls_delta,
            tokens_delta: delta.tokens_delta,
        });
    }
}

// ─── Span enrichment callbacks ───────────────────────────────────────────────

fn enrich(apply: fn(&HookPayload, &context::ActiveSpan)) -> HookCallback {
    Arc::new(move |payload| {
        async move {
            let span = payload
                .span
                .clone()
                .or_else(context::current_span);
            if let Some(span) = span {
                if span.is_recording() {
                    apply(&payload, &span);
                }
            }
            Ok(())
        }
        .boxed()
    })
}

fn enrich_agent_call(payload: &HookPayload, span: &context::ActiveSpan) {
    if let Some(name) = &payload.subject {
        span.set_attribute(keys::AGENT_NAME, name.as_str());
    }
    if let Some(class) = metadata_str(payload, "class") {
        span.set_attribute(keys::AGENT_CLASS, class);
    }
    let session_id = payload_session_id(payload);
    if session_id != context::UNKNOWN_SESSION {
        span.set_attribute(keys::SESSION_ID, session_id);
    }
}

fn enrich_workflow_start(payload: &HookPayload, span: &context::ActiveSpan) {
    if let Some(workflow) = &payload.subject {
        span.set_attribute(keys::WORKFLOW_TYPE, workflow.as_str());
    }
    set_json(span, keys::WORKFLOW_INPUT_JSON, payload.args.as_ref());
}

fn enrich_workflow_success(payload: &HookPayload, span: &context::ActiveSpan) {
    span.set_attribute(keys::STATUS_CODE, "ok");
    set_json(span, keys::WORKFLOW_OUTPUT_JSON, payload.result.as_ref());
    span.set_status(StatusCode::Ok, None);
}

fn enrich_workflow_error(payload: &HookPayload, span: &context::ActiveSpan) {
    span.set_attribute(keys::STATUS_CODE, "error");
    if let Some(error) = &payload.error {
        span.set_attribute(keys::ERROR_MESSAGE, error.as_str());
        span.set_status(StatusCode::Error, Some(error.clone()));
    }
    if let Some(code) = metadata_str(payload, "error_code") {
        span.set_attribute(keys::ERROR_CODE, code);
    }
}

fn enrich_tool_start(payload: &HookPayload, span: &context::ActiveSpan) {
    if let Some(tool) = &payload.subject {
        span.set_attribute(keys::TOOL_NAME, tool.as_str());
    }
    set_json(span, keys::TOOL_INPUT_JSON, payload.args.as_ref());
}

fn enrich_tool_success(payload: &HookPayload, span: &context::ActiveSpan) {
    set_json(span, keys::TOOL_OUTPUT_JSON, payload.result.as_ref());
}

fn enrich_tool_error(payload: &HookPayload, span: &context::ActiveSpan) {
    if let Some(error) = &payload.error {
        span.set_attribute(keys::ERROR_MESSAGE, error.as_str());
    }
    if let Some(code) = metadata_str(payload, "error_code") {
        span.set_attribute(keys::ERROR_CODE, code);
    }
}

fn enrich_llm_start(payload: &HookPayload, span: &context::ActiveSpan) {
    if let Some(provider) = metadata_str(payload, "provider") {
        span.set_attribute(keys::LLM_PROVIDER, provider);
    }
    if let Some(model) = &payload.subject {
        span.set_attribute(keys::LLM_MODEL, model.as_str());
    }
    set_json(span, keys::LLM_PROMPT_JSON, payload.args.as_ref());
}

fn enrich_llm_success(payload: &HookPayload, span: &context::ActiveSpan) {
    set_json(span, keys::LLM_RESPONSE_JSON, payload.result.as_ref());
}

fn enrich_rpc_start(payload: &HookPayload, span: &context::ActiveSpan) {
    if let Some(method) = &payload.subject {
        span.set_attribute(keys::RPC_METHOD, method.as_str());
    }
    if let Some(id) = metadata_str(payload, "rpc_id") {
        span.set_attribute(keys::RPC_ID, id);
    }
    if let Some(transport) = metadata_str(payload, "transport") {
        span.set_attribute(keys::RPC_TRANSPORT, transport);
    }
    span.set_attribute(keys::RPC_DIRECTION, "outbound");
}

fn enrich_rpc_success(payload: &HookPayload, span: &context::ActiveSpan) {
    if let Some(duration) = metadata_value(payload, "duration_ms").and_then(|v| v.as_u64()) {
        span.set_attribute(keys::RPC_DURATION_MS, duration);
    }
}

fn enrich_rpc_error(payload: &HookPayload, span: &context::ActiveSpan) {
    span.set_attribute(keys::STATUS_CODE, "error");
    let Some(error) = &payload.error else { return };
    span.set_attribute(keys::ERROR_MESSAGE, error.as_str());
    let lowered = error.to_lowercase();
    let code = if lowered.contains("timeout") || lowered.contains("timed out") {
        "TIMEOUT"
    } else if lowered.contains("connection") {
        "CONNECTION"
    } else {
        "RPC_ERROR"
    };
    span.set_attribute(keys::ERROR_CODE, code);
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn payload_session_id(payload: &HookPayload) -> String {
    payload
        .session_id
        .clone()
        .unwrap_or_else(context::session_id)
}

fn metadata_value(payload: &HookPayload, key: &str) -> Option<Value> {
    payload.metadata.as_ref()?.get(key).cloned()
}

fn metadata_str(payload: &HookPayload, key: &str) -> Option<String> {
    metadata_value(payload, key)?.as_str().map(str::to_string)
}

fn set_json(span: &context::ActiveSpan, key: &str, value: Option<&Value>) {
    let Some(value) = value else { return };
    if let Ok(json) = serde_json::to_string(value) {
        span.set_json_attribute(key, &json);
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ActiveSpan;
    use crate::span::{ROOT_SPAN_NAME, SpanRecord};

    fn harness() -> (HookBus, Arc<SessionRegistry>, Arc<EventStream>, SubscriberSet) {
        let bus = HookBus::new();
        let registry = Arc::new(SessionRegistry::new());
        let stream = Arc::new(EventStream::new(64, 8));
        let set = register_all(
            &bus,
            Arc::clone(&registry),
            Arc::clone(&stream),
            Duration::from_secs(2),
        );
        (bus, registry, stream, set)
    }

    #[tokio::test]
    async fn workflow_start_enriches_span_and_registers_session() {
        let (bus, registry, stream, _set) = harness();
        let mut sub = stream.add_client().unwrap();
        let span = ActiveSpan::new(SpanRecord::start(ROOT_SPAN_NAME, "t1"));

        bus.emit(
            names::BEFORE_WORKFLOW_RUN,
            HookPayload::new()
                .session("sess-1")
                .subject("ResearchFlow")
                .span(span.clone())
                .args(serde_json::json!({"query": "q"})),
        )
        .await;

        let record = span.snapshot();
        assert_eq!(record.attributes[keys::WORKFLOW_TYPE], "ResearchFlow");
        assert!(record.attributes.contains_key(keys::WORKFLOW_INPUT_JSON));

        assert!(registry.is_active("sess-1"));
        let envelope = sub.receiver.recv().await.unwrap();
        assert!(matches!(
            envelope.event,
            LiveEvent::SessionStarted { ref session_id, ref title, .. }
                if session_id == "sess-1" && title == "ResearchFlow"
        ));
    }

    #[tokio::test]
    async fn workflow_error_finishes_session_with_failure() {
        let (bus, registry, stream, _set) = harness();
        bus.emit(
            names::BEFORE_WORKFLOW_RUN,
            HookPayload::new().session("sess-2").subject("Flow"),
        )
        .await;
        let mut sub = stream.add_client().unwrap();

        bus.emit(
            names::ERROR_WORKFLOW_RUN,
            HookPayload::new().session("sess-2").error("tool exploded"),
        )
        .await;

        assert!(!registry.is_active("sess-2"));
        let envelope = sub.receiver.recv().await.unwrap();
        match envelope.event {
            LiveEvent::SessionFinished {
                session_id,
                status,
                error,
                ..
            } => {
                assert_eq!(session_id, "sess-2");
                assert_eq!(status, "failed");
                assert_eq!(error.as_deref(), Some("tool exploded"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_start_does_not_restart_the_session() {
        let (bus, registry, _stream, _set) = harness();
        bus.emit(
            names::SESSION_STARTED,
            HookPayload::new().session("sess-3"),
        )
        .await;
        registry.record_llm_call("sess-3", 10);
        // Second start event for the same session must keep counters.
        bus.emit(
            names::BEFORE_WORKFLOW_RUN,
            HookPayload::new().session("sess-3").subject("Flow"),
        )
        .await;
        let delta = registry.update_metrics("sess-3").unwrap();
        assert_eq!(delta.tokens_delta, 10);
    }

    #[tokio::test]
    async fn events_without_session_id_are_ignored() {
        let (bus, registry, _stream, _set) = harness();
        bus.emit(names::BEFORE_WORKFLOW_RUN, HookPayload::new()).await;
        assert!(registry.active_ids().is_empty());
    }

    #[tokio::test]
    async fn waiting_on_signal_publishes_prompt_and_schema() {
        let (bus, _registry, stream, _set) = harness();
        let mut sub = stream.add_client().unwrap();

        bus.emit(
            names::WAITING_ON_SIGNAL,
            HookPayload::new()
                .session("sess-4")
                .subject("human_approval")
                .metadata(serde_json::json!({
                    "prompt": "Approve?",
                    "schema": {"type": "boolean"},
                })),
        )
        .await;

        let envelope = sub.receiver.recv().await.unwrap();
        match envelope.event {
            LiveEvent::WaitingOnSignal {
                signal_name,
                prompt,
                schema,
                ..
            } => {
                assert_eq!(signal_name, "human_approval");
                assert_eq!(prompt.as_deref(), Some("Approve?"));
                assert_eq!(schema.unwrap()["type"], "boolean");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_reports_deltas_and_stops_at_finish() {
        let bus = HookBus::new();
        let registry = Arc::new(SessionRegistry::new());
        let stream = Arc::new(EventStream::new(64, 8));
        let _set = register_all(
            &bus,
            Arc::clone(&registry),
            Arc::clone(&stream),
            Duration::from_millis(100),
        );
        let mut sub = stream.add_client().unwrap();

        bus.emit(
            names::SESSION_STARTED,
            HookPayload::new().session("sess-hb"),
        )
        .await;
        // Drain the SessionStarted event.
        let started = sub.receiver.recv().await.unwrap();
        assert!(matches!(started.event, LiveEvent::SessionStarted { .. }));

        bus.emit(
            names::AFTER_LLM_GENERATE,
            HookPayload::new()
                .session("sess-hb")
                .metadata(serde_json::json!({"tokens": 42})),
        )
        .await;

        let envelope = sub.receiver.recv().await.unwrap();
        match envelope.event {
            LiveEvent::Heartbeat {
                llm_calls_delta,
                tokens_delta,
                ..
            } => {
                assert_eq!(llm_calls_delta, 1);
                assert_eq!(tokens_delta, 42);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        bus.emit(
            names::SESSION_FINISHED,
            HookPayload::new().session("sess-hb"),
        )
        .await;
        let finished = sub.receiver.recv().await.unwrap();
        assert!(matches!(finished.event, LiveEvent::SessionFinished { .. }));
    }

    #[tokio::test]
    async fn rpc_error_classifies_timeouts() {
        let (bus, _registry, _stream, _set) = harness();
        let span = ActiveSpan::new(SpanRecord::start("rpc.request", "t1"));
        bus.emit(
            names::ERROR_RPC_REQUEST,
            HookPayload::new()
                .span(span.clone())
                .error("request timed out after 30s"),
        )
        .await;
        let record = span.snapshot();
        assert_eq!(record.attributes[keys::ERROR_CODE], "TIMEOUT");
        assert_eq!(record.attributes[keys::STATUS_CODE], "error");
    }

    #[tokio::test]
    async fn unregister_all_detaches_everything() {
        let (bus, registry, _stream, set) = harness();
        set.unregister_all(&bus);
        bus.emit(
            names::BEFORE_WORKFLOW_RUN,
            HookPayload::new().session("sess-x").subject("Flow"),
        )
        .await;
        assert!(registry.active_ids().is_empty());
    }
}
