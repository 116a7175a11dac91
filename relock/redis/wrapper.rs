use deadpool_redis::{Config, Runtime};

use super::{RedisConn, RedisErr};
use crate::prelude::*;

/// A wrapper around a redis connection pool, the entrypoint for everything
/// else in this crate.
pub struct Redis {
    pool: deadpool_redis::Pool,
}

impl Redis {
    /// Create a new redis wrapper from the given Redis URL (like `redis://127.0.0.1`).
    pub fn new(redis_conn_str: impl Into<String>) -> RResult<Self, RedisErr> {
        let cfg = Config::from_url(redis_conn_str);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .change_context(RedisErr)?;

        Ok(Self { pool })
    }

    /// Like [`Redis::new`], but with an explicit cap on pooled connections.
    ///
    /// Useful when many tasks block server-side at once (e.g. lots of waiters
    /// parked on the same lock), which pins a connection per waiter.
    pub fn new_with_pool_size(
        redis_conn_str: impl Into<String>,
        max_size: usize,
    ) -> RResult<Self, RedisErr> {
        let cfg = Config::from_url(redis_conn_str);
        let pool = cfg
            .builder()
            .change_context(RedisErr)?
            .max_size(max_size)
            .runtime(Runtime::Tokio1)
            .build()
            .change_context(RedisErr)?;

        Ok(Self { pool })
    }

    /// Get a [`RedisConn`] redis can be called with.
    pub fn conn(&self) -> RedisConn<'_> {
        RedisConn::new(&self.pool)
    }

    /// Escape hatch to the underlying pool.
    pub fn get_inner_pool(&self) -> &deadpool_redis::Pool {
        &self.pool
    }
}
