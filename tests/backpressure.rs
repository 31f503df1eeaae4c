//! Event-log backpressure through the dispatcher.

mod common;

use actrelay::dispatch::LogEventRequest;
use actrelay::error::RelayError;
use common::{build_stack, StackOptions};

fn request(n: usize) -> LogEventRequest {
    LogEventRequest {
        activity: "user_asked".into(),
        metadata: Some(serde_json::json!({ "n": n })),
        link: None,
        customer: None,
        session_id: None,
        revenue_impact: None,
    }
}

#[tokio::test]
async fn backpressure_rejects_beyond_ceiling_and_recovers_after_flush() {
    let stack = build_stack(StackOptions {
        // Flushing blocked: the threshold sits far above the ceiling and
        // the background timer is never started.
        eventlog: |c| {
            c.max_events = 100;
            c.flush_threshold = 10_000;
        },
        ..StackOptions::default()
    })
    .await;

    for n in 0..100 {
        let response = stack.dispatcher.log_event(request(n)).await.unwrap();
        assert_eq!(response["ok"], true);
    }

    for n in 100..200 {
        let err = stack.dispatcher.log_event(request(n)).await.unwrap_err();
        assert!(matches!(err, RelayError::Backpressure { .. }), "call {n}");
        assert!(err.retryable());
    }

    // The disk unblocks: a flush drains the buffer and appends succeed.
    stack.log.flush().unwrap();
    let response = stack.dispatcher.log_event(request(200)).await.unwrap();
    assert_eq!(response["ok"], true);

    // Exactly the accepted records are on disk after rotation.
    let finalized = stack.log.rotate().unwrap().unwrap();
    assert_eq!(stack.read_segment(&finalized).len(), 101);

    stack.shutdown().await;
}
