use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Notify;

use super::scripts::EXTEND_SCRIPT;
use crate::prelude::*;
use crate::redis::{RedisConnLike, RedisConnOwned};

/// Background task re-extending a held lock's ttl until told to stop.
///
/// The task shares only two things with the owning [`super::Lock`]: the
/// `held` flag, and the shutdown notify. It must be stopped (and joined)
/// before the lock key is deleted, so a late extend can never resurrect it.
pub(crate) struct RenewalWorker {
    shutdown: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
}

impl RenewalWorker {
    /// Spawn the renewer, ticking once per `interval`.
    pub(crate) fn spawn(
        conn: RedisConnOwned,
        key: String,
        id: Vec<u8>,
        expire_secs: u64,
        interval: Duration,
        held: Arc<AtomicBool>,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(renew_until_stopped(
            conn,
            key,
            id,
            expire_secs,
            interval,
            held,
            shutdown.clone(),
        ));
        Self { shutdown, handle }
    }

    /// Signal the worker and wait for it to exit.
    pub(crate) async fn stop(mut self) {
        self.shutdown.notify_one();
        let _ = (&mut self.handle).await;
    }

    /// Non-async teardown for drops; the task dies at its next await point.
    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}

async fn renew_until_stopped(
    conn: RedisConnOwned,
    key: String,
    id: Vec<u8>,
    expire_secs: u64,
    interval: Duration,
    held: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        // Fresh pooled connection per tick, nothing redis-side is held in between.
        let mut conn = conn.clone();
        let result = conn
            .script::<i64>(
                EXTEND_SCRIPT
                    .invoker()
                    .key(&key)
                    .arg(id.as_slice())
                    .arg(expire_secs * 1000),
            )
            .await;
        match result {
            Ok(1) => debug!("Extended '{}' for another {}s.", key, expire_secs),
            Ok(_) => {
                warn!("Ownership of '{}' was lost, stopping renewal.", key);
                held.store(false, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                // Transient server trouble; the next tick may still land in time.
                warn!("Failed to extend '{}', will retry next tick. Err: '{:?}'", key, e);
            }
        }
    }
}
