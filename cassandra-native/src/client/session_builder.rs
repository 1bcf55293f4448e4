//! SessionBuilder provides an easy way to create new Sessions

use super::session::{Session, SessionConfig};
use super::Compression;
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::errors::NewSessionError;
use crate::policies::retry::RetryPolicy;
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;
use crate::statement::Consistency;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// SessionBuilder is used to create new Session instances
/// # Example
///
/// ```
/// # use cassandra_native::client::session::Session;
/// # use cassandra_native::client::session_builder::SessionBuilder;
/// # use cassandra_native::client::Compression;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .compression(Some(Compression::Snappy))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionBuilder {
    /// The configuration the session will be built with.
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// Creates new SessionBuilder with default configuration
    /// # Default configuration
    /// * Compression: None
    /// * Max pool size: 8
    /// * Default consistency: LocalQuorum
    ///
    /// See [`SessionConfig::new`] for the rest.
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Add a known node with a hostname
    /// # Examples
    /// ```
    /// # use cassandra_native::client::session::Session;
    /// # use cassandra_native::client::session_builder::SessionBuilder;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("db1.example.com")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Add a known node with an IP address
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// Add a list of known nodes with IP addresses
    pub fn known_nodes_addr(mut self, node_addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.config.add_known_nodes_addr(node_addrs);
        self
    }

    /// Set the keyspace to be used on all connections.
    /// Each connection will send `"USE <keyspace_name>"` before sending any requests.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    /// Set preferred Compression algorithm.
    /// The default is no compression.
    /// If it is not supported by database server Session will fall back to no compression.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// Changes connection timeout
    /// The default is 5 seconds.
    /// If it's higher than underlying os's default connection timeout it won't effect.
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// A request which waits longer than `timeout` for its response breaks
    /// the connection it was sent on. Disabled by default.
    pub fn abort_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.abort_timeout = timeout;
        self
    }

    /// Sets the maximal number of connections of the session. The default is 8.
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.config.max_pool_size = size;
        self
    }

    /// Sets how many requests can be in flight on one connection.
    /// The default is 128.
    pub fn stream_slots(mut self, slots: usize) -> Self {
        self.config.stream_slots = slots;
        self
    }

    /// Set username and password for plain text authentication.\
    /// If the database server will require authentication\
    ///
    /// # Example
    /// ```
    /// # use cassandra_native::client::session::Session;
    /// # use cassandra_native::client::session_builder::SessionBuilder;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .use_keyspace("my_keyspace_name", false)
    ///     .user("cassandra", "cassandra")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn user(mut self, username: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(
            username.into(),
            passwd.into(),
        )));
        self
    }

    /// Set custom authenticator provider to create an authenticator instance during a session creation.
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// Sets the consistency of statements which do not set their own.
    /// The default is `LocalQuorum`.
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    /// Sets the retry policy. The default is
    /// [`DefaultRetryPolicy`](crate::policies::retry::DefaultRetryPolicy).
    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = retry_policy;
        self
    }

    /// Enables speculative execution of idempotent requests.
    ///
    /// # Example
    /// ```
    /// # use cassandra_native::client::session_builder::SessionBuilder;
    /// # use cassandra_native::policies::speculative_execution::SimpleSpeculativeExecutionPolicy;
    /// # use std::sync::Arc;
    /// # use std::time::Duration;
    /// let builder = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .speculative_execution(Arc::new(SimpleSpeculativeExecutionPolicy {
    ///         max_retry_count: 2,
    ///         retry_interval: Duration::from_millis(50),
    ///     }));
    /// ```
    pub fn speculative_execution(mut self, policy: Arc<dyn SpeculativeExecutionPolicy>) -> Self {
        self.config.speculative_execution_policy = Some(policy);
        self
    }

    /// Sets the time after which requests fail with
    /// [`ExecutionError::RequestTimeout`](crate::errors::ExecutionError::RequestTimeout).
    /// Statements can override it. There is no timeout by default.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the nodelay TCP flag.
    /// The default is true.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Set the TCP keepalive interval.
    /// The default is `None`, which implies that no keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Set the keepalive interval.
    /// The default is 30 seconds; `None` disables CQL keepalives.
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Sets how long a keepalive request may go unanswered before the
    /// connection is considered broken. The default is 30 seconds.
    pub fn keepalive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.keepalive_timeout = timeout;
        self
    }

    /// Builds the Session after setting all the options
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}

/// Creates a [`SessionBuilder`] with default configuration, same as [`SessionBuilder::new`]
impl Default for SessionBuilder {
    fn default() -> Self {
        SessionBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::SessionBuilder;
    use crate::client::Compression;
    use crate::policies::speculative_execution::SimpleSpeculativeExecutionPolicy;
    use crate::statement::Consistency;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn default_config() {
        let builder = SessionBuilder::new();
        let config = &builder.config;

        assert!(config.known_nodes.is_empty());
        assert!(config.known_node_addrs.is_empty());
        assert_eq!(config.compression, None);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.abort_timeout, None);
        assert_eq!(config.max_pool_size, 8);
        assert_eq!(config.stream_slots, 128);
        assert_eq!(config.default_consistency, Consistency::LocalQuorum);
        assert!(config.speculative_execution_policy.is_none());
        assert_eq!(config.request_timeout, None);
        assert!(config.tcp_nodelay);
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.keepalive_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn add_known_nodes() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(172, 17, 0, 3)), 1357);
        let builder = SessionBuilder::new()
            .known_node("test_hostname")
            .known_node_addr(addr)
            .known_nodes_addr([addr]);

        assert_eq!(builder.config.known_nodes, vec!["test_hostname".to_owned()]);
        assert_eq!(builder.config.known_node_addrs, vec![addr, addr]);
    }

    #[test]
    fn all_features() {
        let builder = SessionBuilder::new()
            .known_node("localhost:8000")
            .use_keyspace("ks_name", true)
            .compression(Some(Compression::Lz4))
            .connection_timeout(Duration::from_secs(1))
            .abort_timeout(Some(Duration::from_secs(2)))
            .max_pool_size(3)
            .stream_slots(16)
            .user("user", "pass")
            .default_consistency(Consistency::Two)
            .speculative_execution(Arc::new(SimpleSpeculativeExecutionPolicy {
                max_retry_count: 1,
                retry_interval: Duration::from_millis(50),
            }))
            .request_timeout(Some(Duration::from_secs(3)))
            .tcp_nodelay(false)
            .tcp_keepalive_interval(Duration::from_secs(42))
            .keepalive_interval(None)
            .keepalive_timeout(Some(Duration::from_secs(4)));

        let config = &builder.config;
        assert_eq!(config.used_keyspace.as_deref(), Some("ks_name"));
        assert!(config.keyspace_case_sensitive);
        assert_eq!(config.compression, Some(Compression::Lz4));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.abort_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.max_pool_size, 3);
        assert_eq!(config.stream_slots, 16);
        assert!(config.authenticator.is_some());
        assert_eq!(config.default_consistency, Consistency::Two);
        assert!(config.speculative_execution_policy.is_some());
        assert_eq!(config.request_timeout, Some(Duration::from_secs(3)));
        assert!(!config.tcp_nodelay);
        assert_eq!(config.tcp_keepalive_interval, Some(Duration::from_secs(42)));
        assert_eq!(config.keepalive_interval, None);
        assert_eq!(config.keepalive_timeout, Some(Duration::from_secs(4)));
    }
}
