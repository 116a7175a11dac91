mod conn;
mod script;
mod standalone_redis;
mod wrapper;

pub use conn::{RedisConn, RedisConnLike, RedisConnOwned};
pub use script::{RedisScript, RedisScriptInvoker};
pub use standalone_redis::RedisStandalone;
pub use wrapper::Redis;

// Re-exporting redis and deadpool_redis to be used outside if needed:
pub use deadpool_redis;
pub use redis;

use error_stack::Context;

/// Failure talking to the redis server. The transport error that caused it is
/// preserved in the report chain.
#[derive(Debug, Default)]
pub struct RedisErr;

impl std::fmt::Display for RedisErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RedisErr")
    }
}

impl Context for RedisErr {}

// Redis server can't be run on windows:
#[cfg(not(target_os = "windows"))]
#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use super::*;
    use crate::testing::prelude::*;

    async fn setup() -> RResult<(RedisStandalone, Redis), AnyErr> {
        let server = RedisStandalone::new_no_persistence().await?;
        let r = Redis::new(server.client_conn_str()).change_context(AnyErr)?;
        Ok((server, r))
    }

    #[rstest]
    #[tokio::test]
    async fn test_redis_ping(#[allow(unused_variables)] logging: ()) -> RResult<(), AnyErr> {
        let (_server, r) = setup().await?;
        assert!(r.conn().ping().await);

        // A client pointed at a dead port should report down rather than erroring:
        let fail_r = Redis::new("redis://localhost:1").change_context(AnyErr)?;
        assert!(!fail_r.conn().ping().await);

        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_script_reload_on_cache_miss(
        #[allow(unused_variables)] logging: (),
    ) -> RResult<(), AnyErr> {
        static ADD_SCRIPT: LazyLock<RedisScript> = LazyLock::new(|| {
            RedisScript::new(
                "ADD_SCRIPT",
                "return tonumber(ARGV[1]) + tonumber(ARGV[2])",
            )
        });

        let (_server, r) = setup().await?;
        let mut conn = r.conn();

        // First use on a fresh server goes through the load-and-retry path:
        assert_eq!(
            conn.script::<i64>(ADD_SCRIPT.invoker().arg(1).arg(2))
                .await
                .change_context(AnyErr)?,
            3
        );

        // Wipe the server-side cache, the next call must reload transparently:
        {
            let inner = conn.get_inner_conn().await.change_context(AnyErr)?;
            redis::cmd("SCRIPT")
                .arg("FLUSH")
                .query_async::<String>(inner)
                .await
                .change_context(AnyErr)?;
        }
        assert_eq!(
            conn.script::<i64>(ADD_SCRIPT.invoker().arg(2).arg(5))
                .await
                .change_context(AnyErr)?,
            7
        );

        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_blpop(#[allow(unused_variables)] logging: ()) -> RResult<(), AnyErr> {
        let (_server, r) = setup().await?;
        let mut conn = r.conn();

        // Nothing queued, a 1s wait comes back empty:
        assert_eq!(conn.blpop("empty-list", 1).await.change_context(AnyErr)?, None);

        {
            let inner = conn.get_inner_conn().await.change_context(AnyErr)?;
            redis::cmd("LPUSH")
                .arg("busy-list")
                .arg("x")
                .query_async::<i64>(inner)
                .await
                .change_context(AnyErr)?;
        }
        assert_eq!(
            conn.blpop("busy-list", 1).await.change_context(AnyErr)?,
            Some(("busy-list".to_string(), b"x".to_vec()))
        );

        Ok(())
    }
}
