//! The retry policy decides, attempt by attempt, whether a failed request
//! is sent again and with which consistency.

use crate::errors::RequestAttemptError;
use crate::frame::types::Consistency;

/// What a retry policy knows about a failed attempt.
pub struct RequestInfo<'a> {
    /// Why the attempt failed.
    pub error: &'a RequestAttemptError,
    /// Whether the caller declared the statement safe to apply more than
    /// once. `false` means it is not known to be.
    pub is_idempotent: bool,
    /// Consistency the failed attempt was sent with.
    pub consistency: Consistency,
}

impl RequestInfo<'_> {
    /// True if sending the statement again cannot apply it twice: either
    /// it is idempotent, or the error shows the failed attempt was not
    /// applied at all.
    ///
    /// Policies must not return a retry decision when this is false.
    pub fn may_resend(&self) -> bool {
        self.is_idempotent || self.error.guarantees_not_applied()
    }
}

/// What to do with a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the request again on the same connection, with the given
    /// consistency or, when `None`, the one it failed with.
    RetrySameTarget(Option<Consistency>),
    /// Send the request again on a newly acquired connection, to a
    /// different node when possible.
    RetryNextTarget(Option<Consistency>),
    /// Surface the error to the caller.
    DontRetry,
    /// Treat the failed write as a success with an empty result.
    IgnoreWriteError,
}

/// Produces the per-request state deciding about retries.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called once for every request the session executes.
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Retry state of a single request.
pub trait RetrySession: Send + Sync {
    /// Called after every failed attempt of the request.
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;

    /// Forgets every previous decision.
    fn reset(&mut self);
}
