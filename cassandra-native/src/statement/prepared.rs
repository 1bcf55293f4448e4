//! Defines the [`PreparedStatement`] type, which represents a statement
//! that has been prepared in advance on the server.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use super::StatementConfig;
use crate::errors::BadQuery;
use crate::frame::response::result::{ColumnSpec, Prepared, PreparedMetadata, ResultMetadata};
use crate::frame::types::{Consistency, SerialConsistency};
use crate::serialize::SerializedValues;
use crate::statement::Statement;

/// Represents a statement prepared on the server.
///
/// The id returned by the server is valid on every node of the cluster, so
/// the statement can be executed on any pooled connection. Settings such as
/// consistency and idempotence are inherited from the [`Statement`] that
/// was prepared and can be adjusted afterwards.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) config: StatementConfig,

    id: Bytes,
    shared: Arc<PreparedStatementSharedData>,
}

#[derive(Debug)]
struct PreparedStatementSharedData {
    metadata: PreparedMetadata,
    result_metadata: Arc<ResultMetadata>,
    statement: String,
}

impl PreparedStatement {
    pub(crate) fn new(prepared: Prepared, statement: &Statement) -> Self {
        Self {
            id: prepared.id,
            shared: Arc::new(PreparedStatementSharedData {
                metadata: prepared.prepared_metadata,
                result_metadata: Arc::new(prepared.result_metadata),
                statement: statement.contents.clone(),
            }),
            config: statement.config.clone(),
        }
    }

    /// Retrieves the ID of this prepared statement.
    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    /// Retrieves the statement string of this prepared statement.
    pub fn get_statement(&self) -> &str {
        &self.shared.statement
    }

    /// Specifications of the bind markers.
    pub fn get_variable_col_specs(&self) -> &[ColumnSpec] {
        &self.shared.metadata.col_specs
    }

    pub(crate) fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.shared.metadata
    }

    /// Specifications of the columns returned when the statement is executed.
    pub fn get_result_set_col_specs(&self) -> &[ColumnSpec] {
        self.shared.result_metadata.col_specs()
    }

    /// Checks that `values` bind every marker of the statement.
    pub(crate) fn check_values(&self, values: &SerializedValues) -> Result<(), BadQuery> {
        let expected = self.get_prepared_metadata().col_count;
        if usize::from(values.element_count()) != expected {
            return Err(BadQuery::WrongValuesCount {
                expected,
                got: values.element_count(),
            });
        }
        Ok(())
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

    /// Gets the consistency to be used when executing this prepared statement if it is filled.
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
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    /// Gets the idempotence of this statement
    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    /// Sets the client-side timeout for this statement.
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.config.request_timeout = timeout
    }

    /// Gets client timeout associated with this statement.
    pub fn get_request_timeout(&self) -> Option<Duration> {
        self.config.request_timeout
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::Bytes;

    use super::PreparedStatement;
    use crate::errors::BadQuery;
    use crate::frame::response::result::{Prepared, PreparedMetadata, ResultMetadata};
    use crate::serialize::SerializedValues;
    use crate::statement::{Consistency, Statement};

    fn prepared_with_markers(col_count: usize) -> PreparedStatement {
        let statement =
            Statement::new("INSERT INTO ks.t (a, b) VALUES (?, ?)").with_idempotence(true);
        PreparedStatement::new(
            Prepared {
                id: Bytes::from_static(b"\x01\x02"),
                prepared_metadata: PreparedMetadata {
                    col_count,
                    ..Default::default()
                },
                result_metadata: ResultMetadata::default(),
            },
            &statement,
        )
    }

    #[test]
    fn inherits_settings_of_source_statement() {
        let mut prepared = prepared_with_markers(2);
        assert!(prepared.get_is_idempotent());
        assert_eq!(prepared.get_id().as_ref(), b"\x01\x02");
        assert_eq!(
            prepared.get_statement(),
            "INSERT INTO ks.t (a, b) VALUES (?, ?)"
        );

        let copy = prepared.clone();
        prepared.set_consistency(Consistency::All);
        assert_eq!(copy.get_consistency(), None);
        assert_eq!(prepared.get_consistency(), Some(Consistency::All));
    }

    #[test]
    fn values_must_bind_every_marker() {
        let prepared = prepared_with_markers(2);
        let mut values = SerializedValues::new();
        values.add_value(&1_i32).unwrap();
        assert_matches!(
            prepared.check_values(&values),
            Err(BadQuery::WrongValuesCount {
                expected: 2,
                got: 1
            })
        );
        values.add_value("two").unwrap();
        assert!(prepared.check_values(&values).is_ok());
    }
}
