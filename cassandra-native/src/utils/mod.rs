#[cfg(test)]
pub(crate) mod test_utils;

use std::error::Error;

use tracing::{error, field::display, Span};

pub(crate) trait RecordError {
    fn record_error(self, span: &Span) -> Self;
}

impl<T, E> RecordError for Result<T, E>
where
    E: Error,
{
    fn record_error(self, span: &Span) -> Self {
        if let Err(ref err) = self {
            span.record_error(err);
        }
        self
    }
}

pub(crate) trait SpanExt {
    fn record_error(&self, error: &impl Error);
}

impl SpanExt for Span {
    fn record_error(&self, error: &impl Error) {
        self.record("status", "ERROR");
        self.record("error", display(error));
        self.in_scope(|| error!("{}", "Request finished with error"));
    }
}
