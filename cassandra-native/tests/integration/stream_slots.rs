use crate::utils::{builder_for, setup_tracing, start_nodes, with_text};
use assert_matches::assert_matches;
use cassandra_native::errors::ExecutionError;
use cassandra_native::statement::Consistency;
use cassandra_native::Session;
use cassandra_native_mock::{Condition, MockNode, Reaction, RequestRule};
use std::time::Duration;

async fn one_slot_session(node: &MockNode) -> Session {
    builder_for(std::slice::from_ref(node))
        .max_pool_size(1)
        .stream_slots(1)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn exhausted_slots_fail_the_request_without_sending_it() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![RequestRule(
        Condition::body_contains("slow"),
        Reaction::Default.delayed(Duration::from_millis(300)),
    )]);
    let session = one_slot_session(&node).await;

    let (slow, rejected) = tokio::join!(
        session.non_query("SELECT slow", Consistency::One),
        async {
            node.wait_for_requests(1, with_text("SELECT slow")).await;
            session.non_query("SELECT fast", Consistency::One).await
        },
    );
    slow.unwrap();
    assert_matches!(
        rejected,
        Err(ExecutionError::NoHostAvailable { reason }) if reason == "stream slots exhausted"
    );
    assert_eq!(node.count_received(with_text("SELECT fast")), 0);

    // The slot is free again once the slow response arrived.
    session
        .non_query("SELECT fast", Consistency::One)
        .await
        .unwrap();
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn slot_of_an_abandoned_request_is_released_by_its_late_response() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![RequestRule(
        Condition::body_contains("slow"),
        Reaction::Default.delayed(Duration::from_millis(300)),
    )]);
    let session = builder_for(std::slice::from_ref(&node))
        .max_pool_size(1)
        .stream_slots(1)
        .request_timeout(Some(Duration::from_millis(100)))
        .build()
        .await
        .unwrap();

    assert_matches!(
        session.non_query("SELECT slow", Consistency::One).await,
        Err(ExecutionError::RequestTimeout(_))
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    session
        .non_query("SELECT fast", Consistency::One)
        .await
        .unwrap();
    assert_eq!(node.accepted_connections(), 1);
}
