//! Ticket lifecycle over the composed stack: byte caps, cancellation,
//! monotonic state.

mod common;

use actrelay::dispatch::SubmitQueryRequest;
use actrelay::scheduler::TicketState;
use common::{build_stack, StackOptions};
use serde_json::json;
use std::time::Duration;

async fn wait_terminal(
    stack: &common::Stack,
    id: &str,
) -> actrelay::scheduler::Ticket {
    for _ in 0..300 {
        if let Some(ticket) = stack.dispatcher.ticket_status(id) {
            if ticket.state.is_terminal() {
                return ticket;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("ticket {id} never reached a terminal state");
}

#[tokio::test]
async fn byte_capped_ticket_truncates_rows_with_marker() {
    let stack = build_stack(StackOptions::default()).await;
    let rows: Vec<serde_json::Value> = (0..10_000)
        .map(|i| json!({ "id": i, "pad": "row-payload-of-roughly-fifty-bytes" }))
        .collect();
    stack.warehouse.set_canned_rows(rows);

    let response = stack
        .dispatcher
        .submit_query(SubmitQueryRequest {
            template_name: "read_recent_activities".into(),
            params: vec![json!("customer_0001"), json!(500)],
            byte_cap: Some(10_000),
        })
        .await
        .unwrap();
    let id = response["ticketId"].as_str().unwrap().to_string();
    assert_eq!(response["state"], "pending");

    let done = wait_terminal(&stack, &id).await;
    assert_eq!(done.state, TicketState::Completed);
    let result = done.result.unwrap();
    assert_eq!(result["truncated"], true);
    assert_eq!(result["original_row_count"], 10_000);
    let returned = result["returned_row_count"].as_u64().unwrap();
    assert!(returned > 0 && returned < 10_000);
    let rows_bytes = serde_json::to_string(&result["rows"]).unwrap().len();
    assert!(
        rows_bytes <= 10_000 - 200,
        "serialized rows are {rows_bytes} bytes"
    );

    stack.shutdown().await;
}

#[tokio::test]
async fn cancelled_pending_ticket_never_runs() {
    let stack = build_stack(StackOptions {
        scheduler: actrelay::scheduler::SchedulerConfig {
            max_concurrent: 1,
            ..Default::default()
        },
        ..StackOptions::default()
    })
    .await;
    stack.warehouse.set_canned_rows(vec![json!({ "a": 1 })]);
    stack.warehouse.set_delay(Duration::from_millis(150));

    // The first ticket occupies the single slot; the second stays pending.
    let blocker = stack
        .dispatcher
        .submit_query(SubmitQueryRequest {
            template_name: "read_recent_activities".into(),
            params: vec![json!("customer_0001"), json!(10)],
            byte_cap: None,
        })
        .await
        .unwrap();
    let victim = stack
        .dispatcher
        .submit_query(SubmitQueryRequest {
            template_name: "read_recent_activities".into(),
            params: vec![json!("customer_0002"), json!(10)],
            byte_cap: None,
        })
        .await
        .unwrap();

    let victim_id = victim["ticketId"].as_str().unwrap().to_string();
    assert!(stack.dispatcher.cancel_ticket(&victim_id));

    let blocker_id = blocker["ticketId"].as_str().unwrap().to_string();
    let blocker_done = wait_terminal(&stack, &blocker_id).await;
    assert_eq!(blocker_done.state, TicketState::Completed);

    // A dispatch tick after cancellation leaves the victim cancelled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let victim_done = stack.dispatcher.ticket_status(&victim_id).unwrap();
    assert_eq!(victim_done.state, TicketState::Cancelled);
    // Terminal states are never replaced.
    assert!(!stack.dispatcher.cancel_ticket(&victim_id));

    stack.shutdown().await;
}

#[tokio::test]
async fn failed_execution_releases_capacity_for_later_tickets() {
    let stack = build_stack(StackOptions::default()).await;
    stack.warehouse.set_failing("primary", true);
    stack.warehouse.set_failing("secondary", true);

    let response = stack
        .dispatcher
        .submit_query(SubmitQueryRequest {
            template_name: "read_recent_activities".into(),
            params: vec![json!("customer_0001"), json!(10)],
            byte_cap: None,
        })
        .await
        .unwrap();
    let id = response["ticketId"].as_str().unwrap().to_string();
    let done = wait_terminal(&stack, &id).await;
    assert_eq!(done.state, TicketState::Failed);
    assert!(done.error.is_some());

    // Accounts recover; the next ticket completes.
    stack.warehouse.set_failing("primary", false);
    stack.warehouse.set_failing("secondary", false);
    stack.dispatcher.unlock_account("primary");
    stack.dispatcher.unlock_account("secondary");
    stack.warehouse.set_canned_rows(vec![json!({ "a": 1 })]);

    let response = stack
        .dispatcher
        .submit_query(SubmitQueryRequest {
            template_name: "read_recent_activities".into(),
            params: vec![json!("customer_0001"), json!(10)],
            byte_cap: None,
        })
        .await
        .unwrap();
    let id = response["ticketId"].as_str().unwrap().to_string();
    let done = wait_terminal(&stack, &id).await;
    assert_eq!(done.state, TicketState::Completed);

    stack.shutdown().await;
}
