mod connection;
pub(crate) use connection::{
    open_connection, Connection, ConnectionConfig, VerifiedKeyspaceName, DEFAULT_STREAM_SLOTS,
};

mod connection_pool;
pub(crate) use connection_pool::{ConnectionPool, PoolConfig, DEFAULT_MAX_POOL_SIZE};
