use crate::utils::{
    builder_for, count_on_all, query_consistency, session_for, setup_tracing, start_nodes,
    with_text,
};
use assert_matches::assert_matches;
use cassandra_native::errors::{DbError, ExecutionError, WriteType};
use cassandra_native::frame::response::error::Error;
use cassandra_native::frame::response::Response;
use cassandra_native::frame::request::RequestOpcode;
use cassandra_native::policies::retry::{
    DowngradingConsistencyRetryPolicy, FallthroughRetryPolicy, RequestInfo, RetryDecision,
    RetryPolicy, RetrySession,
};
use cassandra_native::serialize::SerializedValues;
use cassandra_native::statement::unprepared::Statement;
use cassandra_native::statement::Consistency;
use cassandra_native_mock::{Condition, Reaction, RequestRule, ReceivedRequest};
use std::sync::Arc;
use std::time::Duration;

fn fail_once(text: &str, error: DbError) -> RequestRule {
    RequestRule(
        Condition::body_contains(text).and(Condition::TrueForLimitedTimes(1)),
        Reaction::Respond(Response::Error(Error {
            error,
            reason: "injected".to_owned(),
        })),
    )
}

fn unavailable() -> DbError {
    DbError::Unavailable {
        consistency: Consistency::Quorum,
        required: 3,
        alive: 1,
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn idempotent_request_is_retried_on_overloaded() {
    setup_tracing();
    let nodes = start_nodes::<1>().await;
    nodes[0].set_rules(vec![fail_once("INSERT flaky", DbError::Overloaded)]);
    let session = session_for(&nodes).await;

    let statement = Statement::new("INSERT flaky").with_idempotence(true);
    assert_eq!(session.non_query_statement(&statement).await.unwrap(), None);
    assert_eq!(count_on_all(&nodes, with_text("INSERT flaky")), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn non_idempotent_request_is_not_retried_when_it_may_have_been_applied() {
    setup_tracing();
    let nodes = start_nodes::<2>().await;
    for node in &nodes {
        node.set_rules(vec![
            fail_once("INSERT overloaded", DbError::Overloaded),
            fail_once(
                "INSERT write_timeout",
                DbError::WriteTimeout {
                    consistency: Consistency::Quorum,
                    received: 1,
                    required: 2,
                    write_type: WriteType::BatchLog,
                },
            ),
        ]);
    }
    let session = session_for(&nodes).await;

    assert_matches!(
        session.non_query("INSERT overloaded", Consistency::Quorum).await,
        Err(ExecutionError::DbError(DbError::Overloaded, _))
    );
    assert_eq!(count_on_all(&nodes, with_text("INSERT overloaded")), 1);

    assert_matches!(
        session.non_query("INSERT write_timeout", Consistency::Quorum).await,
        Err(ExecutionError::DbError(DbError::WriteTimeout { .. }, _))
    );
    assert_eq!(count_on_all(&nodes, with_text("INSERT write_timeout")), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn non_idempotent_request_is_retried_when_not_applied() {
    setup_tracing();
    let nodes = start_nodes::<1>().await;
    nodes[0].set_rules(vec![fail_once("INSERT unavailable", unavailable())]);
    let session = session_for(&nodes).await;

    session
        .non_query("INSERT unavailable", Consistency::Quorum)
        .await
        .unwrap();
    assert_eq!(count_on_all(&nodes, with_text("INSERT unavailable")), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn read_timeout_is_retried_on_the_same_connection() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![fail_once(
        "SELECT",
        DbError::ReadTimeout {
            consistency: Consistency::Quorum,
            received: 2,
            required: 2,
            data_present: false,
        },
    )]);
    let session = session_for(std::slice::from_ref(&node)).await;

    let statement = Statement::new("SELECT a FROM ks.t")
        .with_consistency(Consistency::Quorum)
        .with_idempotence(true);
    session.non_query_statement(&statement).await.unwrap();

    let attempts: Vec<ReceivedRequest> = node
        .received()
        .into_iter()
        .filter(with_text("SELECT a FROM ks.t"))
        .collect();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].connection_seq_no, attempts[1].connection_seq_no);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn downgrading_policy_lowers_consistency() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![fail_once("INSERT", unavailable())]);
    let session = builder_for(std::slice::from_ref(&node))
        .retry_policy(Arc::new(DowngradingConsistencyRetryPolicy::new()))
        .build()
        .await
        .unwrap();

    session
        .non_query("INSERT INTO ks.t (a) VALUES (1)", Consistency::Quorum)
        .await
        .unwrap();

    let consistencies: Vec<Option<Consistency>> = node
        .received()
        .iter()
        .filter(|r| with_text("INSERT INTO ks.t (a) VALUES (1)")(r))
        .map(query_consistency)
        .collect();
    assert_eq!(
        consistencies,
        vec![Some(Consistency::Quorum), Some(Consistency::One)]
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn fallthrough_policy_never_retries() {
    setup_tracing();
    let nodes = start_nodes::<2>().await;
    for node in &nodes {
        node.set_rules(vec![fail_once("INSERT", unavailable())]);
    }
    let session = builder_for(&nodes)
        .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
        .build()
        .await
        .unwrap();

    let statement = Statement::new("INSERT INTO ks.t (a) VALUES (1)").with_idempotence(true);
    assert_matches!(
        session.non_query_statement(&statement).await,
        Err(ExecutionError::DbError(DbError::Unavailable { .. }, _))
    );
    assert_eq!(
        count_on_all(&nodes, with_text("INSERT INTO ks.t (a) VALUES (1)")),
        1
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn request_timeout_bounds_retries() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![RequestRule(
        Condition::body_contains("SELECT"),
        Reaction::Default.delayed(Duration::from_secs(2)),
    )]);
    let session = builder_for(std::slice::from_ref(&node))
        .request_timeout(Some(Duration::from_millis(100)))
        .build()
        .await
        .unwrap();

    assert_matches!(
        session.non_query("SELECT a FROM ks.t", Consistency::One).await,
        Err(ExecutionError::RequestTimeout(timeout)) if timeout == Duration::from_millis(100)
    );

    // A statement-level timeout overrides the session's.
    let mut statement = Statement::new("INSERT INTO ks.t (a) VALUES (1)");
    statement.set_request_timeout(Some(Duration::from_millis(50)));
    session.non_query_statement(&statement).await.unwrap();
}

// Reports every write timeout as applied.
#[derive(Debug)]
struct IgnoreWriteTimeouts;

impl RetryPolicy for IgnoreWriteTimeouts {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(IgnoreWriteTimeouts)
    }
}

impl RetrySession for IgnoreWriteTimeouts {
    fn decide_should_retry(&mut self, _request_info: RequestInfo) -> RetryDecision {
        RetryDecision::IgnoreWriteError
    }

    fn reset(&mut self) {}
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn ignored_write_error_yields_the_empty_outcome_of_the_call() {
    setup_tracing();
    let nodes = start_nodes::<1>().await;
    nodes[0].set_rules(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Execute)
            .or(Condition::body_contains("INSERT INTO ks.t (a) VALUES (1)")),
        Reaction::Respond(Response::Error(Error {
            error: DbError::WriteTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                required: 2,
                write_type: WriteType::Simple,
            },
            reason: "injected".to_owned(),
        })),
    )]);
    let session = builder_for(&nodes)
        .retry_policy(Arc::new(IgnoreWriteTimeouts))
        .build()
        .await
        .unwrap();

    let prepared = session.prepare("UPDATE ks.t SET a = 1").await.unwrap();
    let rows = session
        .execute(&prepared, &SerializedValues::new(), Consistency::Quorum)
        .await
        .unwrap();
    assert_eq!(rows.rows_count, 0);
    assert!(rows.rows.is_empty());
    assert_eq!(
        session
            .execute_non_query(&prepared, &SerializedValues::new(), Consistency::Quorum)
            .await
            .unwrap(),
        None
    );
    assert!(session
        .query("INSERT INTO ks.t (a) VALUES (1)", Consistency::Quorum)
        .await
        .unwrap()
        .rows
        .is_empty());
    assert_eq!(
        count_on_all(&nodes, |r| r.request.opcode() == RequestOpcode::Execute),
        2
    );
}
