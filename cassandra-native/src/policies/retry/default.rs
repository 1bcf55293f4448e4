use crate::errors::{DbError, RequestAttemptError, WriteType};

use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};

/// Retries failures that another attempt is likely to get past, and only
/// when [`RequestInfo::may_resend`] allows it.
///
/// A node in trouble (overloaded, bootstrapping, failing internally, or
/// with a broken connection) is routed around. Unavailable, a read
/// timeout with enough replicas but no data, and a batch log write
/// timeout are retried once each. Requests at a serial consistency are
/// never retried.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    /// Creates a new instance of [DefaultRetryPolicy].
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::<DefaultRetrySession>::default()
    }
}

// Failures retried at most once per request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RetriedOnce {
    Unavailable,
    ReadTimeout,
    WriteTimeout,
}

/// Implementation of [RetrySession] for [DefaultRetryPolicy].
#[derive(Default)]
pub struct DefaultRetrySession {
    spent: Vec<RetriedOnce>,
}

impl DefaultRetrySession {
    fn once(&mut self, kind: RetriedOnce, decision: RetryDecision) -> RetryDecision {
        if self.spent.contains(&kind) {
            return RetryDecision::DontRetry;
        }
        self.spent.push(kind);
        decision
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        if request_info.consistency.is_serial() || !request_info.may_resend() {
            return RetryDecision::DontRetry;
        }

        let db_error = match request_info.error {
            RequestAttemptError::DbError(db_error, _) => db_error,
            RequestAttemptError::BrokenConnectionError(_)
            | RequestAttemptError::UnableToAllocStreamId => {
                return RetryDecision::RetryNextTarget(None)
            }
            _ => return RetryDecision::DontRetry,
        };

        match db_error {
            DbError::Overloaded
            | DbError::ServerError
            | DbError::TruncateError
            | DbError::IsBootstrapping => RetryDecision::RetryNextTarget(None),
            // The coordinator may be the one cut off from the replicas.
            DbError::Unavailable { .. } => {
                self.once(RetriedOnce::Unavailable, RetryDecision::RetryNextTarget(None))
            }
            // Enough replicas answered, but only with digests.
            DbError::ReadTimeout {
                received,
                required,
                data_present: false,
                ..
            } if received >= required => {
                self.once(RetriedOnce::ReadTimeout, RetryDecision::RetrySameTarget(None))
            }
            DbError::WriteTimeout {
                write_type: WriteType::BatchLog,
                ..
            } => self.once(RetriedOnce::WriteTimeout, RetryDecision::RetrySameTarget(None)),
            _ => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        self.spent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{DefaultRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
    use crate::errors::{
        BrokenConnectionErrorKind, CqlResponseKind, DbError, RequestAttemptError, WriteType,
    };
    use crate::statement::Consistency;
    use crate::utils::test_utils::setup_tracing;
    use bytes::Bytes;

    fn db(error: DbError) -> RequestAttemptError {
        RequestAttemptError::DbError(error, String::new())
    }

    // Decisions of a fresh session for a non-idempotent and an idempotent
    // request, in that order.
    fn first_decisions(error: &RequestAttemptError) -> [RetryDecision; 2] {
        [false, true].map(|is_idempotent| {
            DefaultRetryPolicy::new()
                .new_session()
                .decide_should_retry(RequestInfo {
                    error,
                    is_idempotent,
                    consistency: Consistency::Quorum,
                })
        })
    }

    // Decisions of one session asked twice about the same failure.
    fn repeated_decisions(error: &RequestAttemptError, is_idempotent: bool) -> [RetryDecision; 2] {
        let mut session = DefaultRetryPolicy::new().new_session();
        [(); 2].map(|()| {
            session.decide_should_retry(RequestInfo {
                error,
                is_idempotent,
                consistency: Consistency::Quorum,
            })
        })
    }

    #[test]
    fn permanent_failures_are_surfaced() {
        setup_tracing();
        let permanent = [
            db(DbError::SyntaxError),
            db(DbError::Invalid),
            db(DbError::AlreadyExists {
                keyspace: "ks".to_owned(),
                table: "t".to_owned(),
            }),
            db(DbError::Unauthorized),
            db(DbError::ReadFailure {
                consistency: Consistency::Quorum,
                received: 1,
                required: 2,
                numfailures: 1,
                data_present: false,
            }),
            db(DbError::Unprepared {
                statement_id: Bytes::from_static(b"id"),
            }),
            db(DbError::Other(0x1234)),
            RequestAttemptError::UnexpectedResponse(CqlResponseKind::Ready),
        ];
        for error in &permanent {
            assert_eq!(
                first_decisions(error),
                [RetryDecision::DontRetry, RetryDecision::DontRetry],
                "{error}"
            );
        }
    }

    #[test]
    fn troubled_node_is_routed_around_for_idempotent_requests_only() {
        setup_tracing();
        let troubled = [
            db(DbError::Overloaded),
            db(DbError::ServerError),
            db(DbError::TruncateError),
            RequestAttemptError::BrokenConnectionError(BrokenConnectionErrorKind::Closed.into()),
        ];
        for error in &troubled {
            assert_eq!(
                first_decisions(error),
                [RetryDecision::DontRetry, RetryDecision::RetryNextTarget(None)],
                "{error}"
            );
        }

        // Nothing was applied by a bootstrapping node.
        assert_eq!(
            first_decisions(&db(DbError::IsBootstrapping)),
            [
                RetryDecision::RetryNextTarget(None),
                RetryDecision::RetryNextTarget(None)
            ]
        );
    }

    #[test]
    fn unavailable_moves_to_another_node_once() {
        setup_tracing();
        let error = db(DbError::Unavailable {
            consistency: Consistency::Quorum,
            required: 2,
            alive: 1,
        });
        for is_idempotent in [false, true] {
            assert_eq!(
                repeated_decisions(&error, is_idempotent),
                [RetryDecision::RetryNextTarget(None), RetryDecision::DontRetry]
            );
        }
    }

    #[test]
    fn read_timeout_is_retried_once_when_only_digests_came_back() {
        setup_tracing();
        let read_timeout = |received, data_present| {
            db(DbError::ReadTimeout {
                consistency: Consistency::Quorum,
                received,
                required: 2,
                data_present,
            })
        };

        assert_eq!(
            repeated_decisions(&read_timeout(2, false), false),
            [RetryDecision::RetrySameTarget(None), RetryDecision::DontRetry]
        );
        assert_eq!(
            first_decisions(&read_timeout(2, true)),
            [RetryDecision::DontRetry, RetryDecision::DontRetry]
        );
        assert_eq!(
            first_decisions(&read_timeout(1, false)),
            [RetryDecision::DontRetry, RetryDecision::DontRetry]
        );
    }

    #[test]
    fn batch_log_write_timeout_is_retried_once_when_idempotent() {
        setup_tracing();
        let write_timeout = |write_type| {
            db(DbError::WriteTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                required: 2,
                write_type,
            })
        };

        assert_eq!(
            first_decisions(&write_timeout(WriteType::BatchLog)),
            [RetryDecision::DontRetry, RetryDecision::RetrySameTarget(None)]
        );
        assert_eq!(
            repeated_decisions(&write_timeout(WriteType::BatchLog), true),
            [RetryDecision::RetrySameTarget(None), RetryDecision::DontRetry]
        );
        assert_eq!(
            first_decisions(&write_timeout(WriteType::Simple)),
            [RetryDecision::DontRetry, RetryDecision::DontRetry]
        );
    }

    #[test]
    fn serial_consistency_is_never_retried() {
        setup_tracing();
        let error = db(DbError::IsBootstrapping);
        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(RequestInfo {
                error: &error,
                is_idempotent: true,
                consistency: Consistency::Serial,
            }),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn reset_forgets_previous_retries() {
        setup_tracing();
        let error = db(DbError::Unavailable {
            consistency: Consistency::Quorum,
            required: 2,
            alive: 1,
        });
        let info = || RequestInfo {
            error: &error,
            is_idempotent: true,
            consistency: Consistency::Quorum,
        };
        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(info()),
            RetryDecision::RetryNextTarget(None)
        );
        session.reset();
        assert_eq!(
            session.decide_should_retry(info()),
            RetryDecision::RetryNextTarget(None)
        );
    }
}
