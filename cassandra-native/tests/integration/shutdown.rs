use crate::utils::{eventually, session_for, setup_tracing, start_nodes, with_text};
use assert_matches::assert_matches;
use cassandra_native::errors::{BrokenConnectionErrorKind, ExecutionError};
use cassandra_native::statement::Consistency;
use cassandra_native_mock::{Condition, Reaction, RequestRule};

fn hang() -> RequestRule {
    RequestRule(Condition::body_contains("hang"), Reaction::Ignore)
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn shutdown_fails_pending_requests() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![hang()]);
    let session = session_for(std::slice::from_ref(&node)).await;

    let (pending, ()) = tokio::join!(
        session.non_query("SELECT hang", Consistency::One),
        async {
            node.wait_for_requests(1, with_text("SELECT hang")).await;
            session.shutdown().await;
        },
    );
    assert_matches!(
        pending,
        Err(ExecutionError::ConnectionBroken(e)) if matches!(e.kind(), BrokenConnectionErrorKind::Closed)
    );
    eventually("the node sees no connection", || node.connection_count() == 0).await;
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn operations_after_shutdown_are_refused() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let session = session_for(std::slice::from_ref(&node)).await;
    session.shutdown().await;
    let received_before = node.received().len();

    assert_matches!(
        session.non_query("INSERT INTO ks.t (a) VALUES (1)", Consistency::One).await,
        Err(ExecutionError::Disposed)
    );
    assert_matches!(
        session.query("SELECT a FROM ks.t", Consistency::One).await,
        Err(ExecutionError::Disposed)
    );
    assert_matches!(
        session.prepare("SELECT a FROM ks.t").await,
        Err(ExecutionError::Disposed)
    );
    assert_matches!(
        session.change_keyspace("ks", false).await,
        Err(ExecutionError::Disposed)
    );
    assert_eq!(node.received().len(), received_before);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn shutdown_twice_is_harmless() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let session = session_for(std::slice::from_ref(&node)).await;

    session.shutdown().await;
    session.shutdown().await;
    assert_matches!(
        session.scalar("USE ks", Consistency::One).await,
        Err(ExecutionError::Disposed)
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn dropping_the_session_closes_its_connections() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let session = session_for(std::slice::from_ref(&node)).await;
    session
        .non_query("INSERT INTO ks.t (a) VALUES (1)", Consistency::One)
        .await
        .unwrap();
    assert!(node.connection_count() > 0);

    drop(session);
    eventually("the node sees no connection", || node.connection_count() == 0).await;
    assert_eq!(node.registered_connections(), 0);
}
