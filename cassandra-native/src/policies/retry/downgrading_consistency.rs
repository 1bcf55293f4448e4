use tracing::debug;

use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
use crate::errors::{DbError, RequestAttemptError, WriteType};
use crate::frame::types::Consistency;

/// Retries at a weaker consistency when the server reports that fewer
/// replicas are reachable than the requested level needs.
///
/// At most one such retry is made per request. Node-level trouble is
/// routed around as [`DefaultRetryPolicy`](super::DefaultRetryPolicy) does,
/// and a write that timed out after reaching some replica is reported as
/// applied. Like every bundled policy it never resends a statement that
/// [`RequestInfo::may_resend`] rejects.
#[derive(Debug, Default, Clone, Copy)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    /// Creates a new instance of [DowngradingConsistencyRetryPolicy].
    pub fn new() -> DowngradingConsistencyRetryPolicy {
        DowngradingConsistencyRetryPolicy
    }
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::<DowngradingConsistencyRetrySession>::default()
    }
}

/// Implementation of [RetrySession] for [DowngradingConsistencyRetryPolicy].
#[derive(Default)]
pub struct DowngradingConsistencyRetrySession {
    downgrade_spent: bool,
}

// The strongest level `reachable` replicas can satisfy.
fn downgrade(reachable: i32, from: Consistency) -> RetryDecision {
    let to = match reachable {
        3.. => Consistency::Three,
        2 => Consistency::Two,
        1 => Consistency::One,
        // EACH_QUORUM counts per datacenter, so other datacenters may still answer.
        _ if from == Consistency::EachQuorum => Consistency::One,
        _ => return RetryDecision::DontRetry,
    };
    debug!(from = ?from, to = ?to, "Lowering consistency for the retry");
    RetryDecision::RetrySameTarget(Some(to))
}

impl DowngradingConsistencyRetrySession {
    fn spend(&mut self, decision: RetryDecision) -> RetryDecision {
        self.downgrade_spent = true;
        decision
    }
}

impl RetrySession for DowngradingConsistencyRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        if !request_info.may_resend() {
            return RetryDecision::DontRetry;
        }

        let cl = request_info.consistency;
        if cl.is_serial() {
            // Paxos could not gather enough replicas; another coordinator
            // may see more of them.
            return match request_info.error {
                RequestAttemptError::DbError(DbError::Unavailable { .. }, _) => {
                    RetryDecision::RetryNextTarget(None)
                }
                _ => RetryDecision::DontRetry,
            };
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
            _ if self.downgrade_spent => RetryDecision::DontRetry,
            DbError::Unavailable { alive, .. } => self.spend(downgrade(*alive, cl)),
            DbError::ReadTimeout {
                received, required, ..
            } if received < required => self.spend(downgrade(*received, cl)),
            DbError::ReadTimeout {
                data_present: false,
                ..
            } => self.spend(RetryDecision::RetrySameTarget(None)),
            DbError::WriteTimeout {
                write_type,
                received,
                ..
            } => self.spend(match write_type {
                WriteType::Simple | WriteType::Batch if *received > 0 => {
                    RetryDecision::IgnoreWriteError
                }
                // Part of the batch may be missing; write all of it again
                // at a level the replicas can reach.
                WriteType::UnloggedBatch => downgrade(*received, cl),
                WriteType::BatchLog => RetryDecision::RetrySameTarget(None),
                _ => RetryDecision::DontRetry,
            }),
            _ => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        self.downgrade_spent = false;
    }
}
