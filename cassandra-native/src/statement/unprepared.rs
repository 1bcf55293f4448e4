//! Defines the [`Statement`] type, which represents an unprepared CQL statement.

use std::time::Duration;

use super::StatementConfig;
use crate::frame::types::{Consistency, SerialConsistency};

/// **Unprepared** CQL statement.
///
/// This represents a CQL statement that can be executed on a server.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) config: StatementConfig,

    /// The CQL statement text.
    pub contents: String,
}

impl Statement {
    /// Creates a new [`Statement`] from a CQL statement string.
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            contents: query_text.into(),
            config: Default::default(),
        }
    }

    /// Returns self with the consistency set to the given value.
    pub fn with_consistency(mut self, c: Consistency) -> Self {
        self.set_consistency(c);
        self
    }

    /// Returns self with the idempotence flag set to the given value.
    pub fn with_idempotence(mut self, is_idempotent: bool) -> Self {
        self.set_is_idempotent(is_idempotent);
        self
    }

    /// Sets the page size for this CQL statement.
    ///
    /// Panics if given number is nonpositive.
    pub fn set_page_size(&mut self, page_size: i32) {
        assert!(
            page_size > 0,
            "Statement::set_page_size: page size must be positive, got {page_size}"
        );
        self.config.page_size = Some(page_size);
    }

    /// Returns the page size for this CQL statement, if set.
    pub fn get_page_size(&self) -> Option<i32> {
        self.config.page_size
    }

    /// Sets the consistency to be used when executing this statement.
    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = Some(c);
    }

    /// Unsets the consistency overridden on this statement.
    /// This means that consistency will be derived from the session defaults.
    pub fn unset_consistency(&mut self) {
        self.config.consistency = None;
    }

    /// Gets the consistency to be used when executing this statement if it is filled.
    /// If this is empty, the default from the session will be used.
    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    /// Sets the serial consistency to be used when executing this statement.
    /// (Ignored unless the statement is an LWT)
    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = sc;
    }

    /// Gets the serial consistency to be used when executing this statement.
    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.config.serial_consistency
    }

    /// Sets the idempotence of this statement
    /// A query is idempotent if it can be applied multiple times without changing the result of the initial application
    /// If set to `true` we can be sure that it is idempotent
    /// If set to `false` it is unknown whether it is idempotent
    /// This is used in [`RetryPolicy`](crate::policies::retry::RetryPolicy) to decide if retrying a query is safe
    /// and gates speculative execution, which only ever duplicates idempotent statements.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    /// Gets the idempotence of this statement
    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    /// Enable or disable CQL Tracing for this statement
    /// If enabled session.query() will return a QueryResult containing tracing_id
    /// which can be used to query tracing information about the execution of this query
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    /// Gets whether tracing is enabled for this statement
    pub fn get_tracing(&self) -> bool {
        self.config.tracing
    }

    /// Sets the default timestamp for this statement in microseconds.
    /// If not None, it will replace the server side assigned timestamp as default timestamp
    /// If a statement contains a `USING TIMESTAMP` clause, calling this method won't change
    /// anything
    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp
    }

    /// Gets the default timestamp for this statement in microseconds.
    pub fn get_timestamp(&self) -> Option<i64> {
        self.config.timestamp
    }

    /// Sets the client-side timeout for this statement.
    /// If not None, the driver will stop waiting for the request
    /// to finish after `timeout` passed.
    /// Otherwise, the session default timeout will be applied.
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.config.request_timeout = timeout
    }

    /// Gets client timeout associated with this statement.
    pub fn get_request_timeout(&self) -> Option<Duration> {
        self.config.request_timeout
    }
}

impl From<String> for Statement {
    fn from(s: String) -> Statement {
        Statement::new(s)
    }
}

impl<'a> From<&'a str> for Statement {
    fn from(s: &'a str) -> Statement {
        Statement::new(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::Statement;
    use crate::frame::types::Consistency;
    use crate::serialize::SerializedValues;

    #[test]
    fn statement_settings_flow_into_query_parameters() {
        let mut statement = Statement::new("SELECT * FROM ks.t").with_consistency(Consistency::Two);
        statement.set_page_size(100);
        statement.set_timestamp(Some(42));

        let consistency = statement.config.determine_consistency(Consistency::One);
        let params = statement
            .config
            .query_parameters(consistency, SerializedValues::new());
        assert_eq!(params.consistency, Consistency::Two);
        assert_eq!(params.page_size, Some(100));
        assert_eq!(params.timestamp, Some(42));
        assert!(params.values.is_empty());

        statement.unset_consistency();
        assert_eq!(
            statement.config.determine_consistency(Consistency::One),
            Consistency::One
        );
    }

    #[test]
    #[should_panic]
    fn nonpositive_page_size_is_rejected() {
        Statement::new("SELECT 1").set_page_size(0);
    }
}
