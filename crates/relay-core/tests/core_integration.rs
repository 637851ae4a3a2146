#![allow(clippy::unwrap_used, clippy::expect_used)]

use relay_core::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// 1. Transcript round trip with tool calls and results
// ---------------------------------------------------------------------------

#[test]
fn transcript_serialization_roundtrip() {
    let call = ToolCall::new("call_abc123", "web_search", json!({"query": "Rust async"}));
    let transcript = vec![
        Message::system("be brief"),
        Message::user("search please"),
        Message::assistant_with_tools("", vec![call.clone()]),
        Message::tool_results(vec![ToolResult::success(&call.id, "Found 42 results")]),
    ];

    let text = serde_json::to_string(&transcript).unwrap();
    let back: Vec<Message> = serde_json::from_str(&text).unwrap();

    assert_eq!(back.len(), 4);
    assert_eq!(back[0].role, Role::System);
    assert_eq!(back[2].tool_calls, vec![call]);
    assert_eq!(back[3].role, Role::Tool);
    assert_eq!(back[3].tool_results[0].tool_call_id, "call_abc123");
}

// ---------------------------------------------------------------------------
// 2. Error display
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let err = RelayError::QueueFull {
        key: "session-1".into(),
        capacity: 4,
    };
    assert_eq!(err.to_string(), "Lane 'session-1' queue is full (4 waiting)");

    let err = RelayError::InvalidTransition {
        from: "idle".into(),
        to: "done".into(),
    };
    assert_eq!(err.to_string(), "Protocol error: illegal transition idle -> done");

    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: RelayError = json_err.into();
    assert!(err.to_string().starts_with("JSON error:"));

    assert!(RelayError::Cancelled.is_cancelled());
}

// ---------------------------------------------------------------------------
// 3. Usage counter config from TOML
// ---------------------------------------------------------------------------

#[test]
fn usage_parses_from_toml_with_missing_fields() {
    let usage: TokenUsage = toml::from_str("input_tokens = 120\ncache_read_tokens = 30\n").unwrap();
    assert_eq!(usage.input_tokens, 120);
    assert_eq!(usage.output_tokens, 0);
    assert_eq!(usage.cache_read_tokens, 30);
}

#[test]
fn counter_warning_fires_once_per_threshold() {
    let mut counter = TokenCounter::with_thresholds(100_000, &[0.8]);
    counter.add(&TokenUsage {
        input_tokens: 80_000,
        ..TokenUsage::default()
    });
    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    counter.check_thresholds(|_| {
        f.fetch_add(1, Ordering::SeqCst);
    });
    counter.check_thresholds(|_| {
        fired.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// 4. Listener registry shared by clones
// ---------------------------------------------------------------------------

#[test]
fn listener_registry_clones_share_callbacks() {
    let listeners: Listeners<String> = Listeners::new();
    let other = listeners.clone();
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let handle = other.register(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    listeners.emit(&"hello".to_string());
    handle.unregister();
    listeners.emit(&"again".to_string());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// 5. Tracing initialisation
// ---------------------------------------------------------------------------

#[test]
fn init_tracing_is_idempotent() {
    relay_core::logging::init_tracing("relay=debug", false);
    relay_core::logging::init_tracing("relay=info", true);
    tracing::info!(component = "core", "Tracing initialised twice without panicking");
}
