use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};

/// Never retries: every failed attempt is reported to the caller as is.
#[derive(Debug)]
pub struct FallthroughRetryPolicy;

/// Implementation of [RetrySession] for [FallthroughRetryPolicy].
pub struct FallthroughRetrySession;

impl FallthroughRetryPolicy {
    /// Creates a new instance of [FallthroughRetryPolicy].
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl Default for FallthroughRetryPolicy {
    fn default() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(FallthroughRetrySession)
    }
}

impl RetrySession for FallthroughRetrySession {
    fn decide_should_retry(&mut self, _request_info: RequestInfo) -> RetryDecision {
        RetryDecision::DontRetry
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::{FallthroughRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
    use crate::errors::{DbError, RequestAttemptError};
    use crate::statement::Consistency;

    #[test]
    fn never_retries() {
        let errors = [
            RequestAttemptError::UnableToAllocStreamId,
            RequestAttemptError::DbError(DbError::Overloaded, String::new()),
            RequestAttemptError::DbError(DbError::IsBootstrapping, String::new()),
        ];
        let mut session = FallthroughRetryPolicy::new().new_session();
        for error in &errors {
            let decision = session.decide_should_retry(RequestInfo {
                error,
                is_idempotent: true,
                consistency: Consistency::One,
            });
            assert_eq!(decision, RetryDecision::DontRetry);
        }
    }
}
