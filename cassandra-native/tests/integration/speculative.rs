use crate::utils::{builder_for, setup_tracing, start_nodes, with_text};
use assert_matches::assert_matches;
use cassandra_native::errors::ExecutionError;
use cassandra_native::policies::speculative_execution::SimpleSpeculativeExecutionPolicy;
use cassandra_native::statement::unprepared::Statement;
use cassandra_native::{Session, SessionBuilder};
use cassandra_native_mock::{Condition, MockNode, Reaction, ReceivedRequest, RequestRule};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn speculative_builder(node: &MockNode) -> SessionBuilder {
    builder_for(std::slice::from_ref(node)).speculative_execution(Arc::new(
        SimpleSpeculativeExecutionPolicy {
            max_retry_count: 1,
            retry_interval: Duration::from_millis(50),
        },
    ))
}

// The session's first connection is the event connection, so it is the one
// every first attempt goes to.
fn first_connection_never_answers() -> RequestRule {
    RequestRule(
        Condition::ConnectionSeqNo(0).and(Condition::body_contains("SELECT")),
        Reaction::Ignore,
    )
}

fn attempts(node: &MockNode) -> Vec<ReceivedRequest> {
    node.received()
        .into_iter()
        .filter(with_text("SELECT a FROM ks.t"))
        .collect()
}

async fn run_select(session: &Session, idempotent: bool) -> Result<(), ExecutionError> {
    let statement = Statement::new("SELECT a FROM ks.t").with_idempotence(idempotent);
    session.non_query_statement(&statement).await.map(|_| ())
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn speculative_attempt_answers_for_a_stuck_primary() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![first_connection_never_answers()]);
    let session = speculative_builder(&node).build().await.unwrap();

    let started = Instant::now();
    run_select(&session, true).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let attempts = attempts(&node);
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].connection_seq_no, 0);
    assert_ne!(attempts[1].connection_seq_no, 0);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn fast_primary_starts_no_speculative_attempt() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let session = speculative_builder(&node).build().await.unwrap();

    run_select(&session, true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(attempts(&node).len(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn non_idempotent_request_is_never_speculated() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![first_connection_never_answers()]);
    let session = speculative_builder(&node)
        .request_timeout(Some(Duration::from_millis(300)))
        .build()
        .await
        .unwrap();

    assert_matches!(
        run_select(&session, false).await,
        Err(ExecutionError::RequestTimeout(_))
    );
    assert_eq!(attempts(&node).len(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn late_primary_answer_is_dropped_and_frees_its_slot() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![RequestRule(
        Condition::ConnectionSeqNo(0).and(Condition::body_contains("SELECT")),
        Reaction::Default.delayed(Duration::from_millis(200)),
    )]);
    let session = speculative_builder(&node)
        .max_pool_size(2)
        .stream_slots(1)
        .build()
        .await
        .unwrap();

    let started = Instant::now();
    run_select(&session, true).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    let answered = attempts(&node);
    assert_eq!(answered.len(), 2);
    assert_eq!(answered[0].connection_seq_no, 0);

    // Let the primary answer arrive on the connection whose only slot it holds.
    tokio::time::sleep(Duration::from_millis(400)).await;
    node.set_rules(vec![]);

    let on_first_connection = || {
        attempts(&node)
            .iter()
            .filter(|r| r.connection_seq_no == 0)
            .count()
    };
    for _ in 0..32 {
        if on_first_connection() > 1 {
            break;
        }
        run_select(&session, false).await.unwrap();
    }
    assert!(on_first_connection() > 1);
    assert_eq!(node.accepted_connections(), 2);
}
