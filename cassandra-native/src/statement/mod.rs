//! Statements executed through a [`Session`](crate::client::session::Session).

use std::time::Duration;

pub mod prepared;
pub mod unprepared;

pub use crate::frame::types::{Consistency, SerialConsistency};
pub use prepared::PreparedStatement;
pub use unprepared::Statement;

use crate::frame::request::query::QueryParameters;
use crate::serialize::SerializedValues;

#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<SerialConsistency>,

    pub(crate) is_idempotent: bool,

    pub(crate) tracing: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) page_size: Option<i32>,
    pub(crate) request_timeout: Option<Duration>,
}

impl StatementConfig {
    /// Determines the consistency of a query
    #[must_use]
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }

    pub(crate) fn query_parameters(
        &self,
        consistency: Consistency,
        values: SerializedValues,
    ) -> QueryParameters {
        QueryParameters {
            consistency,
            serial_consistency: self.serial_consistency,
            timestamp: self.timestamp,
            page_size: self.page_size,
            paging_state: None,
            values,
        }
    }
}
