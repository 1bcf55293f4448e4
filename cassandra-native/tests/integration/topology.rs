use crate::utils::{builder_for, eventually, session_for, setup_tracing, start_nodes};
use cassandra_native::frame::request::Request;
use cassandra_native::frame::response::event::{
    Event, SchemaChangeEvent, SchemaChangeType, StatusChangeEvent, TopologyChangeEvent,
};
use cassandra_native::statement::Consistency;
use cassandra_native::Session;
use cassandra_native_mock::{Condition, MockNode, Reaction, RequestRule};
use std::net::SocketAddr;
use std::time::Duration;

// Exactly one node holds the event connection.
fn push_to_all(nodes: &[MockNode], event: Event) {
    let delivered: usize = nodes.iter().map(|node| node.push_event(&event)).sum();
    assert_eq!(delivered, 1);
}

fn sorted(mut addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    addrs.sort();
    addrs
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn status_events_update_live_nodes() {
    setup_tracing();
    let nodes = start_nodes::<3>().await;
    let [a, b, c] = [0, 1, 2].map(|i| nodes[i].address());
    let session = session_for(&nodes).await;
    assert_eq!(sorted(session.live_nodes()), sorted(vec![a, b, c]));

    // UP for an address the session was not configured with changes nothing.
    let stranger = SocketAddr::from(([10, 9, 8, 7], 9042));
    push_to_all(&nodes, Event::StatusChange(StatusChangeEvent::Up(stranger)));

    push_to_all(&nodes, Event::StatusChange(StatusChangeEvent::Down(b)));
    eventually("B is down", || !session.is_up(b)).await;
    assert_eq!(sorted(session.live_nodes()), sorted(vec![a, c]));
    assert!(!session.is_up(stranger));

    push_to_all(&nodes, Event::TopologyChange(TopologyChangeEvent::NewNode(b)));
    eventually("B is up", || session.is_up(b)).await;
    assert_eq!(sorted(session.live_nodes()), sorted(vec![a, b, c]));

    push_to_all(&nodes, Event::TopologyChange(TopologyChangeEvent::RemovedNode(c)));
    eventually("C is removed", || !session.is_up(c)).await;
    assert_eq!(sorted(session.live_nodes()), sorted(vec![a, b]));
}

fn registers(nodes: &[MockNode]) -> usize {
    nodes
        .iter()
        .map(|node| node.count_received(|r| matches!(r.request, Request::Register(_))))
        .sum()
}

// The event connection may be in the middle of being replaced, so the event
// is pushed again until it takes effect.
async fn until_down(nodes: &[MockNode], session: &Session, endpoint: SocketAddr) {
    let down = Event::StatusChange(StatusChangeEvent::Down(endpoint));
    eventually("the node is down", || {
        for node in nodes {
            node.push_event(&down);
        }
        !session.is_up(endpoint)
    })
    .await;
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unexpected_events_replace_the_event_connection() {
    setup_tracing();
    let nodes = start_nodes::<2>().await;
    let [a, b] = [0, 1].map(|i| nodes[i].address());
    let session = session_for(&nodes).await;
    assert_eq!(registers(&nodes), 1);

    push_to_all(
        &nodes,
        Event::SchemaChange(SchemaChangeEvent::KeyspaceChange {
            change_type: SchemaChangeType::Created,
            keyspace_name: "ks".to_owned(),
        }),
    );
    eventually("a second REGISTER", || registers(&nodes) == 2).await;

    until_down(&nodes, &session, b).await;
    eventually("one event connection left", || {
        nodes.iter().map(MockNode::registered_connections).sum::<usize>() == 1
    })
    .await;

    // MOVED_NODE cannot be followed either; liveness stays as it was.
    push_to_all(&nodes, Event::TopologyChange(TopologyChangeEvent::MovedNode(a)));
    eventually("a third REGISTER", || registers(&nodes) == 3).await;
    assert!(session.is_up(a));
    assert!(!session.is_up(b));

    until_down(&nodes, &session, a).await;
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn events_flow_again_after_the_event_connection_broke() {
    setup_tracing();
    let nodes = start_nodes::<2>().await;
    let [a, b] = [0, 1].map(|i| nodes[i].address());
    let session = session_for(&nodes).await;

    let closed: usize = nodes
        .iter()
        .map(MockNode::close_registered_connections)
        .sum();
    assert_eq!(closed, 1);

    eventually("a new event connection is registered", || {
        nodes.iter().map(MockNode::registered_connections).sum::<usize>() == 1
    })
    .await;

    push_to_all(&nodes, Event::StatusChange(StatusChangeEvent::Down(a)));
    eventually("A is down", || !session.is_up(a)).await;
    assert!(session.is_up(b));

    // Requests keep working through the replacement.
    session
        .non_query("INSERT INTO ks.t (a) VALUES (1)", Consistency::One)
        .await
        .unwrap();
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn new_connections_go_to_live_nodes_only() {
    setup_tracing();
    let nodes = start_nodes::<2>().await;
    for node in &nodes {
        node.set_rules(vec![RequestRule(
            Condition::body_contains("slow"),
            Reaction::Default.delayed(Duration::from_millis(200)),
        )]);
    }
    let b = nodes[1].address();
    let session = builder_for(&nodes)
        .max_pool_size(4)
        .stream_slots(1)
        .build()
        .await
        .unwrap();

    push_to_all(&nodes, Event::StatusChange(StatusChangeEvent::Down(b)));
    eventually("B is down", || !session.is_up(b)).await;
    let accepted_by_b = nodes[1].accepted_connections();

    let (first, second, third) = tokio::join!(
        session.non_query("INSERT slow 1", Consistency::One),
        session.non_query("INSERT slow 2", Consistency::One),
        session.non_query("INSERT slow 3", Consistency::One),
    );
    first.unwrap();
    second.unwrap();
    third.unwrap();

    assert_eq!(nodes[1].accepted_connections(), accepted_by_b);
    assert!(nodes[0].accepted_connections() >= 2);
}
