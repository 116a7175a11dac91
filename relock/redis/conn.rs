#![allow(async_fn_in_trait)]

use deadpool_redis::redis::FromRedisValue;

use super::{script::RedisScriptInvoker, RedisErr};
use crate::prelude::*;

/// Wrapper around a lazy redis connection.
pub struct RedisConn<'a> {
    pool: &'a deadpool_redis::Pool,
    conn: Option<deadpool_redis::Connection>,
}

impl<'a> RedisConn<'a> {
    pub(crate) fn new(pool: &'a deadpool_redis::Pool) -> Self {
        Self { pool, conn: None }
    }
}

// Cloning is still technically heavy for the un-owned, as the active connection can't be reused.
impl Clone for RedisConn<'_> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool,
            conn: None,
        }
    }
}

/// An owned variant of [`RedisConn`]. Needed when the connection has to cross
/// a `'static` boundary, e.g. into a spawned background task.
pub struct RedisConnOwned {
    pool: deadpool_redis::Pool,
    conn: Option<deadpool_redis::Connection>,
}

impl Clone for RedisConnOwned {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            conn: None,
        }
    }
}

macro_rules! impl_debug_for_conn {
    ($conn_type:ty, $name:literal) => {
        impl std::fmt::Debug for $conn_type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct($name)
                    .field("pool", &self.pool)
                    .field("conn", &self.conn.is_some())
                    .finish()
            }
        }
    };
}

impl_debug_for_conn!(RedisConn<'_>, "RedisConn");
impl_debug_for_conn!(RedisConnOwned, "RedisConnOwned");

/// Generic methods over the [`RedisConn`] and [`RedisConnOwned`] types.
pub trait RedisConnLike: std::fmt::Debug + Send + Sized {
    /// Get an internal connection from the pool, connections are kept in the
    /// pool for reuse. Fails when the server is unreachable.
    async fn get_inner_conn(&mut self) -> RResult<&mut deadpool_redis::Connection, RedisErr>;

    /// Convert to the owned variant.
    fn into_owned(self) -> RedisConnOwned;

    /// Ping redis, returning true if it's up.
    async fn ping(&mut self) -> bool {
        if let Ok(conn) = self.get_inner_conn().await {
            redis::cmd("PING").query_async::<String>(conn).await.is_ok()
        } else {
            false
        }
    }

    /// Run a lua script on the server.
    ///
    /// The cached digest is tried first; on the server reporting the script
    /// unknown, the body is loaded and the invocation retried, exactly once.
    async fn script<R: FromRedisValue>(
        &mut self,
        invocation: RedisScriptInvoker<'_>,
    ) -> RResult<R, RedisErr> {
        let conn = self.get_inner_conn().await?;
        match invocation.eval_cmd().query_async::<R>(&mut *conn).await {
            Ok(val) => Ok(val),
            Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
                debug!("{} not cached.", invocation.script_name());
                invocation
                    .load_cmd()
                    .query_async::<String>(&mut *conn)
                    .await
                    .change_context(RedisErr)?;
                invocation
                    .eval_cmd()
                    .query_async::<R>(&mut *conn)
                    .await
                    .change_context(RedisErr)
            }
            Err(e) => Err(e).change_context(RedisErr),
        }
    }

    /// Blocking pop from the head of a list, waiting server-side for up to
    /// `timeout_secs` for an element to arrive. `0` waits indefinitely.
    ///
    /// Returns the popped `(list, element)` pair, or `None` on timeout.
    async fn blpop(
        &mut self,
        list: &str,
        timeout_secs: u64,
    ) -> RResult<Option<(String, Vec<u8>)>, RedisErr> {
        let conn = self.get_inner_conn().await?;
        redis::cmd("BLPOP")
            .arg(list)
            .arg(timeout_secs)
            .query_async(conn)
            .await
            .change_context(RedisErr)
    }
}

impl RedisConnLike for RedisConn<'_> {
    async fn get_inner_conn(&mut self) -> RResult<&mut deadpool_redis::Connection, RedisErr> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.pool.get().await.change_context(RedisErr)?,
        };
        Ok(self.conn.insert(conn))
    }

    fn into_owned(self) -> RedisConnOwned {
        RedisConnOwned {
            pool: self.pool.clone(),
            conn: self.conn,
        }
    }
}

impl RedisConnLike for RedisConnOwned {
    async fn get_inner_conn(&mut self) -> RResult<&mut deadpool_redis::Connection, RedisErr> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.pool.get().await.change_context(RedisErr)?,
        };
        Ok(self.conn.insert(conn))
    }

    fn into_owned(self) -> RedisConnOwned {
        self
    }
}
