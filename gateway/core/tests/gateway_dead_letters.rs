//! Gateway Assembly with a Persistent Dead-Letter Sink
//!
//! Loads a TOML configuration, assembles a [`Gateway`] against a backend
//! that refuses connections, and checks that exhausted requests land in the
//! JSONL dead-letter file with their full context.

use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use tempfile::{NamedTempFile, TempDir};

use gateway_core::config::load_config_from_path;
use gateway_core::{
    BackendErrorKind, DeadLetterSink, FailureKind, Gateway, JsonlDeadLetterSink, Submission,
};

// Port 9 (discard) is closed on test machines, so every call is refused.
const CONFIG: &str = r#"
[retry]
base_delay_ms = 5
max_delay_ms = 20
max_attempts = 2
jitter_ratio = 0.0

[breaker]
failure_threshold = 10

[dispatcher]
first_response_timeout_ms = 1000
total_timeout_ms = 2000

[[backends]]
name = "local"
tier = "local"
max_concurrent = 1
max_content_size = 4096
kind = "ollama"
base_url = "http://127.0.0.1:9"
model = "llama3.2"
"#;

fn write_config() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn unreachable_backend_requests_are_persisted() {
    let file = write_config();
    let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dead").join("letters.jsonl");

    let sink = Arc::new(JsonlDeadLetterSink::open(&path).await.unwrap());
    let gateway =
        Gateway::from_config_with_sink(&config, Arc::clone(&sink) as Arc<dyn DeadLetterSink>)
            .unwrap();

    let health = gateway.check_health().await;
    assert_eq!(health, [("local".to_string(), false)]);

    let deadline = Utc::now() + chrono::Duration::seconds(10);
    let failure = gateway
        .dispatcher
        .submit(Submission::new("Initech misses estimates", "INTC", deadline).with_priority(90))
        .await
        .unwrap_err();
    gateway.dispatcher.shutdown().await;

    assert_eq!(failure.kind, FailureKind::RetriesExhausted);
    assert_eq!(failure.attempts, 2);

    let entries = JsonlDeadLetterSink::read(&path).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.request.id, failure.request_id);
    assert_eq!(entry.request.content, "Initech misses estimates");
    assert_eq!(entry.request.subject_key, "INTC");
    assert_eq!(entry.request.priority, 90);
    assert_eq!(entry.attempts, 2);
    assert_eq!(entry.reason, FailureKind::RetriesExhausted);
    assert!(matches!(
        entry.last_error.as_ref().map(|e| e.kind),
        Some(BackendErrorKind::Unavailable | BackendErrorKind::Timeout)
    ));

    let snapshot = gateway.snapshot();
    assert_eq!(snapshot.dead_lettered, 1);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.completed, 0);
}
