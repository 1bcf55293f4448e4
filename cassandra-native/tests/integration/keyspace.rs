use crate::utils::{builder_for, session_for, setup_tracing, start_nodes, with_text};
use assert_matches::assert_matches;
use cassandra_native::errors::{DbError, ExecutionError, RequestAttemptError, UseKeyspaceError};
use cassandra_native::frame::response::error::Error;
use cassandra_native::frame::response::Response;
use cassandra_native::statement::Consistency;
use cassandra_native_mock::{Condition, Reaction, RequestRule};
use std::time::Duration;

fn slow_queries() -> RequestRule {
    RequestRule(
        Condition::body_contains("slow"),
        Reaction::Default.delayed(Duration::from_millis(200)),
    )
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn change_keyspace_waits_for_free_stream_slots() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![slow_queries()]);
    let session = builder_for(std::slice::from_ref(&node))
        .max_pool_size(1)
        .stream_slots(2)
        .build()
        .await
        .unwrap();

    let (first, second, changed) = tokio::join!(
        session.non_query("INSERT slow 1", Consistency::One),
        session.non_query("INSERT slow 2", Consistency::One),
        async {
            node.wait_for_requests(2, |r| {
                r.query_text().is_some_and(|text| text.contains("slow"))
            })
            .await;
            session.change_keyspace("ks2", false).await
        },
    );
    first.unwrap();
    second.unwrap();
    changed.unwrap();
    assert_eq!(session.get_keyspace().as_deref(), Some("ks2"));

    let texts: Vec<String> = node
        .received()
        .iter()
        .filter_map(|r| r.query_text().map(str::to_owned))
        .collect();
    assert_eq!(texts.last().map(String::as_str), Some("USE ks2"));
    assert_eq!(node.count_received(with_text("USE ks2")), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn connections_opened_later_use_the_new_keyspace() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![slow_queries()]);
    let session = builder_for(std::slice::from_ref(&node))
        .max_pool_size(2)
        .stream_slots(1)
        .build()
        .await
        .unwrap();

    session.change_keyspace("MyKs", true).await.unwrap();
    assert_eq!(session.get_keyspace().as_deref(), Some("MyKs"));
    assert_eq!(node.count_received(with_text("USE \"MyKs\"")), 1);

    // The single slot of the first connection is taken by the slow query,
    // so the second one has to go through a new connection.
    let (slow, fast) = tokio::join!(
        session.non_query("INSERT slow", Consistency::One),
        async {
            node.wait_for_requests(1, with_text("INSERT slow")).await;
            session.non_query("INSERT fast", Consistency::One).await
        },
    );
    slow.unwrap();
    fast.unwrap();

    assert_eq!(node.accepted_connections(), 2);
    assert_eq!(node.count_received(with_text("USE \"MyKs\"")), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn rejected_keyspace_is_reported() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![RequestRule(
        Condition::body_contains("USE nope"),
        Reaction::Respond(Response::Error(Error {
            error: DbError::Invalid,
            reason: "Keyspace 'nope' does not exist".to_owned(),
        })),
    )]);
    let session = session_for(std::slice::from_ref(&node)).await;

    assert_matches!(
        session.change_keyspace("nope", false).await,
        Err(ExecutionError::UseKeyspace(UseKeyspaceError::RequestError(
            RequestAttemptError::DbError(DbError::Invalid, _)
        )))
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn invalid_keyspace_name_is_not_sent() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let session = session_for(std::slice::from_ref(&node)).await;

    assert_matches!(
        session.change_keyspace("", false).await,
        Err(ExecutionError::BadQuery(_))
    );
    assert_eq!(
        node.count_received(|r| r.query_text().is_some_and(|t| t.starts_with("USE"))),
        0
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn use_statement_switches_the_whole_session() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![slow_queries()]);
    let session = builder_for(std::slice::from_ref(&node))
        .max_pool_size(2)
        .stream_slots(1)
        .build()
        .await
        .unwrap();

    // Occupy the first connection so that a second one gets opened.
    let (slow, fast) = tokio::join!(
        session.non_query("INSERT slow", Consistency::One),
        async {
            node.wait_for_requests(1, with_text("INSERT slow")).await;
            session.non_query("INSERT fast", Consistency::One).await
        },
    );
    slow.unwrap();
    fast.unwrap();
    assert_eq!(node.accepted_connections(), 2);

    assert_eq!(
        session.scalar("USE Other_Ks", Consistency::One).await.unwrap(),
        "other_ks"
    );
    assert_eq!(session.get_keyspace().as_deref(), Some("other_ks"));
    assert_eq!(node.count_received(with_text("USE \"other_ks\"")), 2);
}

