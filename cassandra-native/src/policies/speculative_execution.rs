//! Speculative execution mechanism allows the driver to send speculative requests to
//! other connections when the current target takes too long to respond.
//! This can help reduce latency for requests that may be slow due to network issues
//! or node load.

use futures::{
    future::FutureExt,
    stream::{FuturesUnordered, StreamExt},
};
use std::{future::Future, time::Duration};
use tracing::{trace_span, Instrument};

use crate::errors::ExecutionError;

/// The policy that decides if the driver will send speculative queries to the
/// next targets when the current target takes too long to respond.
pub trait SpeculativeExecutionPolicy: std::fmt::Debug + Send + Sync {
    /// The maximum number of speculative executions that will be triggered
    /// for a given request (does not include the initial request)
    fn max_retry_count(&self) -> usize;

    /// The delay between each speculative execution
    fn retry_interval(&self) -> Duration;
}

/// A [`SpeculativeExecutionPolicy`] that schedules a given number of speculative
/// executions, separated by a fixed delay.
#[derive(Debug, Clone)]
pub struct SimpleSpeculativeExecutionPolicy {
    /// The maximum number of speculative executions that will be triggered
    /// for a given request (does not include the initial request)
    pub max_retry_count: usize,

    /// The delay between each speculative execution
    pub retry_interval: Duration,
}

impl SpeculativeExecutionPolicy for SimpleSpeculativeExecutionPolicy {
    fn max_retry_count(&self) -> usize {
        self.max_retry_count
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

/// Checks if a result created in a speculative execution branch can be ignored.
///
/// We should ignore errors such that their presence when executing the request
/// on one node, does not imply that the same error will appear during retry on some other node.
fn can_be_ignored<ResT>(result: &Result<ResT, ExecutionError>) -> bool {
    match result {
        Ok(_) => false,
        Err(e) => match e {
            // Can try on another node.
            ExecutionError::NoHostAvailable { .. } | ExecutionError::ConnectionBroken(_) => true,

            ExecutionError::DbError(db_error, _) => db_error.can_speculative_retry(),

            // Errors that will appear for other attempts as well.
            ExecutionError::InvariantViolation(_)
            | ExecutionError::Disposed
            | ExecutionError::RequestTimeout(_)
            | ExecutionError::UseKeyspace(_)
            | ExecutionError::BadQuery(_) => false,
        },
    }
}

fn no_target_error() -> ExecutionError {
    ExecutionError::NoHostAvailable {
        reason: "no connection could be acquired".to_owned(),
    }
}

/// Races the attempts produced by `query_runner_generator` against the policy's
/// timer: the first attempt starts at once, and each time the timer fires
/// without a terminal result another one is started, up to the policy's
/// limit. The first result that cannot be ignored wins; the remaining
/// attempts are dropped, which cancels them.
///
/// The generator is told whether it creates the first attempt. An attempt
/// resolving to `None` found no target to run on, after which no further
/// attempts are started.
pub(crate) async fn execute<QueryFut, ResT>(
    policy: &dyn SpeculativeExecutionPolicy,
    mut query_runner_generator: impl FnMut(bool) -> QueryFut,
) -> Result<ResT, ExecutionError>
where
    QueryFut: Future<Output = Option<Result<ResT, ExecutionError>>>,
{
    let retry_interval = policy.retry_interval();
    let mut retries_remaining = if retry_interval.is_zero() {
        0
    } else {
        policy.max_retry_count()
    };

    let mut async_tasks = FuturesUnordered::new();
    async_tasks.push(
        query_runner_generator(true)
            .instrument(trace_span!("Speculative execution: original query")),
    );

    let sleep = tokio::time::sleep(retry_interval).fuse();
    tokio::pin!(sleep);

    let mut last_error = None;
    loop {
        futures::select! {
            _ = &mut sleep => {
                if retries_remaining > 0 {
                    async_tasks.push(query_runner_generator(false).instrument(trace_span!("Speculative execution", retries_remaining = retries_remaining)));
                    retries_remaining -= 1;

                    // reset the timeout
                    sleep.set(tokio::time::sleep(retry_interval).fuse());
                }
            }
            res = async_tasks.select_next_some() => {
                if let Some(r) = res {
                    if !can_be_ignored(&r) {
                        return r;
                    } else {
                        last_error = Some(r)
                    }
                } else {
                    // No target was left for that attempt, so there is no
                    // reason to start any more of them.
                    // We can't always return - there may still be attempts running.
                    retries_remaining = 0;
                }
                if async_tasks.is_empty() && retries_remaining == 0 {
                    return last_error.unwrap_or_else(|| Err(no_target_error()));
                }
            }
        }
    }
}
