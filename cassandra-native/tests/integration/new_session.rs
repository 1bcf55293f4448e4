use crate::utils::{builder_for, setup_tracing, start_nodes};
use assert_matches::assert_matches;
use cassandra_native::errors::{
    BadKeyspaceName, ConnectionError, ConnectionSetupRequestErrorKind, NewSessionError,
};
use cassandra_native::SessionBuilder;
use cassandra_native_mock::{MockConfig, MockNode};

#[tokio::test]
#[ntest::timeout(20000)]
async fn connects_and_subscribes_one_connection() {
    setup_tracing();
    let nodes = start_nodes::<3>().await;
    let session = builder_for(&nodes).build().await.unwrap();

    let registered: usize = nodes.iter().map(MockNode::registered_connections).sum();
    assert_eq!(registered, 1);
    let accepted: usize = nodes.iter().map(MockNode::accepted_connections).sum();
    assert_eq!(accepted, 1);

    let mut live = session.live_nodes();
    live.sort();
    let mut expected: Vec<_> = nodes.iter().map(MockNode::address).collect();
    expected.sort();
    assert_eq!(live, expected);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn empty_known_nodes_list() {
    setup_tracing();
    assert_matches!(
        SessionBuilder::new().build().await.err(),
        Some(NewSessionError::EmptyKnownNodesList)
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unresolvable_hostname() {
    setup_tracing();
    let err = SessionBuilder::new()
        .known_node("this-host-does-not-exist.invalid")
        .build()
        .await
        .err();
    assert_matches!(
        err,
        Some(NewSessionError::FailedToResolveAnyHostname(hosts))
            if hosts == vec!["this-host-does-not-exist.invalid".to_owned()]
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn invalid_keyspace_name_is_rejected() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let err = builder_for(std::slice::from_ref(&node))
        .use_keyspace("not a keyspace", false)
        .build()
        .await
        .err();
    assert_matches!(
        err,
        Some(NewSessionError::BadKeyspaceName(
            BadKeyspaceName::IllegalCharacter(_, ' ')
        ))
    );
    assert_eq!(node.accepted_connections(), 0);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn keyspace_is_used_on_every_connection() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let session = builder_for(std::slice::from_ref(&node))
        .use_keyspace("ks", false)
        .build()
        .await
        .unwrap();
    assert_eq!(session.get_keyspace().as_deref(), Some("ks"));
    assert_eq!(node.count_received(|r| r.query_text() == Some("USE ks")), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn authenticates_with_user_and_password() {
    setup_tracing();
    let node = MockNode::start_with(MockConfig {
        credentials: Some(("cassandra".to_owned(), "secret".to_owned())),
        ..Default::default()
    })
    .await
    .unwrap();

    let nodes = std::slice::from_ref(&node);
    builder_for(nodes)
        .user("cassandra", "secret")
        .build()
        .await
        .unwrap();

    match builder_for(nodes).build().await.err() {
        Some(NewSessionError::ConnectionError(ConnectionError::ConnectionSetupRequestError(
            e,
        ))) => assert_matches!(
            e.error(),
            ConnectionSetupRequestErrorKind::MissingAuthentication
        ),
        other => panic!("Expected missing authentication, got {:?}", other),
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unreachable_node_is_skipped() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let session = SessionBuilder::new()
        .known_node_addr(dead)
        .known_node_addr(node.address())
        .keepalive_interval(None)
        .build()
        .await
        .unwrap();
    assert_eq!(node.registered_connections(), 1);
    session.shutdown().await;
}
