//! Decoding of protocol outcomes into the shape the caller asked for.
//!
//! Every completed request produces exactly one [`Output`]. The session then
//! narrows it with one of the `into_*` methods, which reject any variant that
//! does not fit the operation with [`InvariantViolation::UnexpectedOutput`].
//! A server-reported error is never coerced into a result, and a result is
//! never reported as a server error.

use std::collections::HashMap;

use bytes::Bytes;
use uuid::Uuid;

use crate::errors::{DbError, ExecutionError, InvariantViolation, RequestAttemptError};
use crate::frame::response::authenticate::{AuthChallenge, AuthSuccess, Authenticate};
use crate::frame::response::result::{self, Prepared, Rows, SchemaChange};
use crate::frame::response::Response;

/// The closed set of outcomes a completed request can have.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Output {
    /// The statement succeeded and returned nothing.
    Void,
    /// The server reported an error.
    Error(DbError, String),
    /// A row set with its metadata.
    Rows(Rows),
    /// The statement altered the schema.
    SchemaChange(SchemaChange),
    /// A statement was prepared.
    Prepared(Prepared),
    /// The connection switched to the named keyspace.
    SetKeyspace(String),
}

impl Output {
    pub(crate) fn from_response(response: Response) -> Result<Output, RequestAttemptError> {
        match response {
            Response::Error(err) => Ok(Output::Error(err.error, err.reason)),
            Response::Result(res) => Ok(match res {
                result::Result::Void => Output::Void,
                result::Result::Rows(rows) => Output::Rows(rows),
                result::Result::SetKeyspace(sk) => Output::SetKeyspace(sk.keyspace_name),
                result::Result::Prepared(prepared) => Output::Prepared(prepared),
                result::Result::SchemaChange(sc) => Output::SchemaChange(sc),
            }),
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    /// Name of the variant, as reported in invariant violations.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Output::Void => "Void",
            Output::Error(..) => "Error",
            Output::Rows(_) => "Rows",
            Output::SchemaChange(_) => "SchemaChange",
            Output::Prepared(_) => "Prepared",
            Output::SetKeyspace(_) => "SetKeyspace",
        }
    }

    /// Turns an `Error` output into a failed attempt, so that the retry
    /// policy gets to classify it.
    pub(crate) fn into_non_error(self) -> Result<Output, RequestAttemptError> {
        match self {
            Output::Error(db_error, reason) => Err(RequestAttemptError::DbError(db_error, reason)),
            other => Ok(other),
        }
    }

    /// Decodes the outcome of a statement that returns no rows.
    /// Accepts `Void` and `SchemaChange` only.
    pub fn into_non_query(self) -> Result<Option<SchemaChange>, ExecutionError> {
        match self {
            Output::Void => Ok(None),
            Output::SchemaChange(sc) => Ok(Some(sc)),
            other => Err(other.mismatch("Void or SchemaChange")),
        }
    }

    /// Decodes a scalar outcome. `SetKeyspace` is the only one there is.
    pub fn into_scalar(self) -> Result<String, ExecutionError> {
        match self {
            Output::SetKeyspace(name) => Ok(name),
            other => Err(other.mismatch("SetKeyspace")),
        }
    }

    /// Decodes a row set. Accepts `Rows` only.
    pub fn into_rows(self) -> Result<Rows, ExecutionError> {
        match self {
            Output::Rows(rows) => Ok(rows),
            other => Err(other.mismatch("Rows")),
        }
    }

    /// Decodes the outcome of a PREPARE. Accepts `Prepared` only.
    pub fn into_prepared(self) -> Result<Prepared, ExecutionError> {
        match self {
            Output::Prepared(prepared) => Ok(prepared),
            other => Err(other.mismatch("Prepared")),
        }
    }

    fn mismatch(self, expected: &'static str) -> ExecutionError {
        match self {
            Output::Error(db_error, reason) => ExecutionError::DbError(db_error, reason),
            other => InvariantViolation::UnexpectedOutput {
                expected,
                got: other.kind_name(),
            }
            .into(),
        }
    }
}

/// The outcome an operation expects, known before the request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputShape {
    NonQuery,
    Scalar,
    Rows,
    Prepared,
}

impl OutputShape {
    /// What a write whose failure the retry policy chose to ignore stands
    /// for. `None` for shapes no write can have.
    pub(crate) fn ignored_write(self) -> Option<Output> {
        match self {
            OutputShape::NonQuery => Some(Output::Void),
            OutputShape::Rows => Some(Output::Rows(Rows::new(Vec::new(), Vec::new()))),
            OutputShape::Scalar | OutputShape::Prepared => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
    // Not exposed to the caller.
    #[allow(dead_code)]
    pub(crate) custom_payload: Option<HashMap<String, Bytes>>,
}

impl QueryResponse {
    pub(crate) fn into_output(self) -> Result<Output, RequestAttemptError> {
        Output::from_response(self.response)
    }
}

pub(crate) enum NonErrorStartupResponse {
    Ready,
    Authenticate(Authenticate),
}

pub(crate) enum NonErrorAuthResponse {
    AuthChallenge(AuthChallenge),
    AuthSuccess(AuthSuccess),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::{Output, OutputShape};
    use crate::errors::{
        CqlResponseKind, DbError, ExecutionError, InvariantViolation, RequestAttemptError,
    };
    use crate::frame::response::error::Error;
    use crate::frame::response::result::{self, ResultMetadata, Row, Rows, SetKeyspace};
    use crate::frame::response::Response;

    fn some_rows() -> Rows {
        Rows {
            metadata: Arc::new(ResultMetadata::new(vec![])),
            rows_count: 1,
            rows: vec![Row { columns: vec![] }],
        }
    }

    #[test]
    fn rows_against_non_query_is_an_invariant_violation() {
        let err = Output::Rows(some_rows()).into_non_query().unwrap_err();
        assert_matches!(
            err,
            ExecutionError::InvariantViolation(InvariantViolation::UnexpectedOutput {
                expected: "Void or SchemaChange",
                got: "Rows",
            })
        );
    }

    #[test]
    fn each_shape_accepts_only_its_variants() {
        assert_matches!(Output::Void.into_non_query(), Ok(None));
        assert_eq!(
            Output::SetKeyspace("ks".to_owned()).into_scalar().unwrap(),
            "ks"
        );
        assert_eq!(Output::Rows(some_rows()).into_rows().unwrap().rows_count, 1);

        assert_matches!(
            Output::Void.into_scalar(),
            Err(ExecutionError::InvariantViolation(_))
        );
        assert_matches!(
            Output::Void.into_rows(),
            Err(ExecutionError::InvariantViolation(_))
        );
        assert_matches!(
            Output::SetKeyspace("ks".to_owned()).into_prepared(),
            Err(ExecutionError::InvariantViolation(_))
        );
    }

    #[test]
    fn server_error_is_not_an_invariant_violation() {
        let output = Output::Error(DbError::Overloaded, "busy".to_owned());
        assert_matches!(
            output.into_rows(),
            Err(ExecutionError::DbError(DbError::Overloaded, reason)) if reason == "busy"
        );
    }

    #[test]
    fn responses_map_onto_outputs() {
        let error = Response::Error(Error {
            error: DbError::IsBootstrapping,
            reason: "not yet".to_owned(),
        });
        let output = Output::from_response(error).unwrap();
        assert_matches!(
            output.into_non_error(),
            Err(RequestAttemptError::DbError(DbError::IsBootstrapping, _))
        );

        let set_keyspace = Response::Result(result::Result::SetKeyspace(SetKeyspace {
            keyspace_name: "ks".to_owned(),
        }));
        assert_matches!(
            Output::from_response(set_keyspace),
            Ok(Output::SetKeyspace(name)) if name == "ks"
        );

        assert_matches!(
            Output::from_response(Response::Ready),
            Err(RequestAttemptError::UnexpectedResponse(CqlResponseKind::Ready))
        );
    }

    #[test]
    fn ignored_write_fits_the_expected_shape() {
        assert_matches!(
            OutputShape::NonQuery.ignored_write().map(Output::into_non_query),
            Some(Ok(None))
        );
        let rows = OutputShape::Rows
            .ignored_write()
            .map(Output::into_rows)
            .unwrap()
            .unwrap();
        assert_eq!(rows.rows_count, 0);
        assert!(rows.rows.is_empty());
        assert_matches!(OutputShape::Scalar.ignored_write(), None);
        assert_matches!(OutputShape::Prepared.ignored_write(), None);
    }
}
