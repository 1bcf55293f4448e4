use std::sync::Arc;
use std::time::Duration;

use cassandra_native_cql::frame::request::{Request, RequestOpcode};
use cassandra_native_cql::frame::response::Response;

/// Specifies when an associated [`Reaction`] is performed.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Condition {
    True,

    False,

    Not(Box<Condition>),

    And(Box<Condition>, Box<Condition>),

    Or(Box<Condition>, Box<Condition>),

    /// True iff the request came on the n-th connection accepted by the node (counting from 0).
    ConnectionSeqNo(usize),

    /// True iff the request has the given opcode.
    RequestOpcode(RequestOpcode),

    /// True iff the request body contains the given byte slice, with case-sensitive comparison.
    BodyContainsCaseSensitive(Box<[u8]>),

    /// True iff the request body contains the given byte slice, with case-insensitive comparison (ASCII only).
    BodyContainsCaseInsensitive(Box<[u8]>),

    /// True for the first `n` requests it is evaluated against, false afterwards.
    TrueForLimitedTimes(usize),
}

/// The context in which [`Conditions`](Condition) are evaluated.
pub(crate) struct EvaluationContext<'a> {
    pub(crate) connection_seq_no: usize,
    pub(crate) opcode: RequestOpcode,
    pub(crate) body: &'a [u8],
}

impl Condition {
    pub(crate) fn eval(&mut self, ctx: &EvaluationContext<'_>) -> bool {
        match self {
            Condition::True => true,

            Condition::False => false,

            Condition::Not(c) => !c.eval(ctx),

            Condition::And(c1, c2) => c1.eval(ctx) && c2.eval(ctx),

            Condition::Or(c1, c2) => c1.eval(ctx) || c2.eval(ctx),

            Condition::ConnectionSeqNo(no) => *no == ctx.connection_seq_no,

            Condition::RequestOpcode(op) => *op == ctx.opcode,

            Condition::BodyContainsCaseSensitive(pattern) => ctx
                .body
                .windows(pattern.len())
                .any(|window| *window == **pattern),

            Condition::BodyContainsCaseInsensitive(pattern) => ctx
                .body
                .windows(pattern.len())
                .any(|window| window.eq_ignore_ascii_case(&**pattern)),

            Condition::TrueForLimitedTimes(times) => {
                let val = *times > 0;
                if val {
                    *times -= 1;
                }
                val
            }
        }
    }

    /// A convenience function for creating [Condition::Not] variant.
    #[allow(clippy::should_implement_trait)]
    pub fn not(c: Self) -> Self {
        Condition::Not(Box::new(c))
    }

    /// A convenience function for creating [Condition::And] variant.
    pub fn and(self, c2: Self) -> Self {
        Self::And(Box::new(self), Box::new(c2))
    }

    /// A convenience function for creating [Condition::Or] variant.
    pub fn or(self, c2: Self) -> Self {
        Self::Or(Box::new(self), Box::new(c2))
    }

    /// Matches requests whose body contains `text` (query strings, keyspace names).
    pub fn body_contains(text: &str) -> Self {
        Condition::BodyContainsCaseSensitive(text.as_bytes().into())
    }
}

/// Builds a response out of the request that triggered it.
pub type ResponseFn = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// What the node does with a request matched by a [`RequestRule`].
#[derive(Clone)]
#[non_exhaustive]
pub enum Reaction {
    /// Answer the way a healthy node would.
    Default,

    /// Answer with the given response.
    Respond(Response),

    /// Answer with a response computed from the request.
    RespondWith(ResponseFn),

    /// Never answer. The stream id stays in use on the driver side.
    Ignore,

    /// Close the connection the request came on.
    CloseConnection,

    /// Perform the inner reaction after a delay, without blocking
    /// other requests on the same connection.
    Delayed(Duration, Box<Reaction>),
}

impl Reaction {
    /// A convenience function for creating [Reaction::RespondWith] variant.
    pub fn respond_with(f: impl Fn(&Request) -> Response + Send + Sync + 'static) -> Self {
        Reaction::RespondWith(Arc::new(f))
    }

    /// A convenience function for creating [Reaction::Delayed] variant.
    pub fn delayed(self, delay: Duration) -> Self {
        Reaction::Delayed(delay, Box::new(self))
    }
}

/// A rule describing what the node should do with a request.
/// Rules are evaluated in order; the first one whose condition holds wins.
#[derive(Clone)]
pub struct RequestRule(pub Condition, pub Reaction);
