use cassandra_native::frame::types::Consistency;
use cassandra_native::{Session, SessionBuilder};
use cassandra_native_mock::{MockNode, ReceivedRequest};
use std::time::Duration;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

pub(crate) async fn start_nodes<const N: usize>() -> [MockNode; N] {
    let mut nodes = Vec::with_capacity(N);
    for _ in 0..N {
        nodes.push(MockNode::start().await.unwrap());
    }
    nodes.try_into().unwrap_or_else(|_| unreachable!())
}

/// A builder knowing every one of `nodes`, with CQL keepalives off so
/// that nodes only see the requests made by the test.
pub(crate) fn builder_for(nodes: &[MockNode]) -> SessionBuilder {
    SessionBuilder::new()
        .known_nodes_addr(nodes.iter().map(MockNode::address))
        .keepalive_interval(None)
}

pub(crate) async fn session_for(nodes: &[MockNode]) -> Session {
    builder_for(nodes).build().await.unwrap()
}

/// Requests carrying the query text `text`, either as QUERY or PREPARE.
pub(crate) fn with_text(text: &'static str) -> impl Fn(&ReceivedRequest) -> bool {
    move |r| r.query_text() == Some(text)
}

pub(crate) fn query_consistency(r: &ReceivedRequest) -> Option<Consistency> {
    r.request.get_consistency()
}

pub(crate) fn count_on_all(nodes: &[MockNode], pred: impl Fn(&ReceivedRequest) -> bool) -> usize {
    nodes.iter().map(|node| node.count_received(&pred)).sum()
}

pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting until {}", what);
}
