//! Policies shaping how a request is issued: whether a failed attempt is
//! retried, and whether a slow one gets a speculative duplicate.

pub mod retry;
pub mod speculative_execution;
