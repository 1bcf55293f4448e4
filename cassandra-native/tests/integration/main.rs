mod decoding;
mod keyspace;
mod new_session;
mod retries;
mod shutdown;
mod speculative;
mod stream_slots;
mod topology;
pub(crate) mod utils;
