use std::time::{Duration, Instant};

use super::{Redis, RedisConnLike};
use crate::log::record_exception;
use crate::prelude::*;

/// How long a freshly spawned server gets to start answering pings.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// A throwaway `redis-server` child process on its own free port.
///
/// Exists for tests: the `lock:`/`lock-signal:` keyspace is fixed, so suites
/// sharing one server would contend on each other's locks. Giving every suite
/// a private server sidesteps that. The process is killed on drop.
pub struct RedisStandalone {
    /// The port the server was started on.
    pub port: u16,
    child: std::process::Child,
}

impl RedisStandalone {
    /// Spawn a server with persistence turned off (no aof, no rdb snapshots).
    ///
    /// This is the variant tests want: these servers are disposable, and a
    /// dump file left on disk would leak one run's locks into the next.
    pub async fn new_no_persistence() -> RResult<Self, AnyErr> {
        Self::new_with_args(&["--appendonly", "no", "--save", "\"\""]).await
    }

    /// Spawn `redis-server` on a free port with the given extra arguments,
    /// returning once it answers pings.
    pub async fn new_with_args(extra_args: &[&str]) -> RResult<Self, AnyErr> {
        let port = portpicker::pick_unused_port()
            .ok_or_else(|| anyerr!("No free port to run a standalone redis server on."))?;
        let child = std::process::Command::new("redis-server")
            .arg("--port")
            .arg(port.to_string())
            .args(extra_args)
            .spawn()
            .change_context(AnyErr)?;
        let server = Self { port, child };

        // The process comes up asynchronously; "ready" here means exactly what
        // callers will rely on, a client connection that answers ping.
        let client = Redis::new(server.client_conn_str()).change_context(AnyErr)?;
        let started = Instant::now();
        loop {
            if client.conn().ping().await {
                return Ok(server);
            }
            if started.elapsed() > STARTUP_TIMEOUT {
                return Err(anyerr!(
                    "Standalone redis server on port {} not pingable after {:?}.",
                    server.port,
                    STARTUP_TIMEOUT
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// The url clients connect to this instance with.
    pub fn client_conn_str(&self) -> String {
        format!("redis://localhost:{}", self.port)
    }
}

impl Drop for RedisStandalone {
    fn drop(&mut self) {
        // Reap the child, a leak here strands a listening redis process.
        if let Err(e) = self.child.kill() {
            record_exception("Could not kill standalone redis server.", format!("{:?}", e));
        }
    }
}
