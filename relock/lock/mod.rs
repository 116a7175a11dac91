mod renewal;
mod scripts;

use std::{
    collections::BTreeSet,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use error_stack::Context;
use futures::FutureExt;
use redis::Value;

use crate::prelude::*;
use crate::redis::{Redis, RedisConn, RedisConnLike, RedisConnOwned};
use renewal::RenewalWorker;
use scripts::{EXTEND_SCRIPT, RESET_ALL_SCRIPT, RESET_SCRIPT, UNLOCK_SCRIPT};

/// Prefix of the keys whose existence means "this name is locked".
const LOCK_KEY_PREFIX: &str = "lock:";
/// Prefix of the paired wakeup lists.
const SIGNAL_KEY_PREFIX: &str = "lock-signal:";
/// Ttl put on signal pushes for locks configured without an expiry, so orphan
/// signals still decay.
const DEFAULT_SIGNAL_TTL_MS: u64 = 1000;
/// How many lock names a single RESET_ALL_SCRIPT invocation clears.
const RESET_ALL_CHUNK: usize = 100;

fn lock_key(name: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{name}")
}

fn signal_key(name: &str) -> String {
    format!("{SIGNAL_KEY_PREFIX}{name}")
}

/// The renewer fires once per two thirds of the expiry window, leaving a full
/// third of slack for the extend round-trip.
fn renewal_interval(expire_secs: u64) -> Duration {
    Duration::from_millis(expire_secs * 1000 * 2 / 3)
}

/// Errors surfaced by [`Lock`] operations and [`reset_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErr {
    /// Acquire on an instance that already holds the lock.
    AlreadyAcquired,
    /// Release/extend of a lock this instance does not hold (never acquired,
    /// expired server-side, or taken over after a reset).
    NotAcquired,
    /// Extend of a key stored without a ttl.
    NotExpirable,
    /// A timeout was combined with a non-blocking acquire.
    TimeoutNotUsable,
    /// The timeout outlives the configured expiry, so the wait could be woken
    /// by a signal from a lifetime it no longer cares about.
    TimeoutTooLarge,
    /// The timeout is not a positive number of seconds.
    InvalidTimeout,
    /// Bad construction parameters.
    InvalidConfig,
    /// The redis server could not be reached or misbehaved.
    Redis,
}

impl std::fmt::Display for LockErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockErr::AlreadyAcquired => write!(f, "Already acquired from this Lock instance"),
            LockErr::NotAcquired => write!(f, "Lock is not acquired or it already expired"),
            LockErr::NotExpirable => write!(f, "Lock has no assigned expiration time"),
            LockErr::TimeoutNotUsable => write!(f, "Timeout cannot be used with a non-blocking acquire"),
            LockErr::TimeoutTooLarge => write!(f, "Timeout cannot outlive the expiration time"),
            LockErr::InvalidTimeout => write!(f, "Timeout must be a positive number of seconds"),
            LockErr::InvalidConfig => write!(f, "Invalid lock configuration"),
            LockErr::Redis => write!(f, "Redis failure"),
        }
    }
}

impl Context for LockErr {}

/// Construction parameters for [`Lock`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Ttl in seconds put on the lock key. `None` means the key is held until
    /// explicitly released (or [`reset_all`]).
    pub expire: Option<u64>,
    /// The owner token stored as the key's value; a random 16-byte token is
    /// generated when omitted.
    pub id: Option<Vec<u8>>,
    /// Keep re-extending the key from a background worker while held.
    /// Requires `expire`.
    pub auto_renewal: bool,
    /// Ttl in milliseconds for signal pushes of locks without an `expire`.
    pub signal_expire_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expire: None,
            id: None,
            auto_renewal: false,
            signal_expire_ms: DEFAULT_SIGNAL_TTL_MS,
        }
    }
}

/// A distributed lock on a single redis server.
///
/// Holding the lock means being the sole owner of `lock:{name}`; waiters
/// block on the paired `lock-signal:{name}` list rather than polling. All
/// multi-step server updates go through atomic lua scripts, and only the
/// holder of the matching owner token can release or extend.
pub struct Lock<'a> {
    redis: &'a Redis,
    name: String,
    key: String,
    signal_key: String,
    id: Vec<u8>,
    expire: Option<u64>,
    auto_renewal: bool,
    signal_expire_ms: u64,
    /// Shared with the renewal worker, which clears it on ownership loss.
    held: Arc<AtomicBool>,
    renewal: Option<RenewalWorker>,
}

impl<'a> Lock<'a> {
    /// Create a new lock instance for `name`. Parameters are validated
    /// eagerly; nothing touches the server until [`Lock::acquire`].
    pub fn new(redis: &'a Redis, name: &str, config: LockConfig) -> RResult<Self, LockErr> {
        if name.is_empty() {
            return Err(err!(LockErr::InvalidConfig, "Lock name must not be empty."));
        }
        if name.contains(':') {
            return Err(err!(
                LockErr::InvalidConfig,
                "Lock name must not contain ':', it's reserved for key prefixes. Got: '{}'.",
                name
            ));
        }
        if config.expire == Some(0) {
            return Err(err!(
                LockErr::InvalidConfig,
                "Expire must be a positive number of seconds."
            ));
        }
        if config.auto_renewal && config.expire.is_none() {
            return Err(err!(
                LockErr::InvalidConfig,
                "Auto renewal requires expire to be set, otherwise there is nothing to renew."
            ));
        }
        let id = match config.id {
            Some(id) => {
                if id.is_empty() {
                    return Err(err!(LockErr::InvalidConfig, "Owner token must not be empty."));
                }
                id
            }
            None => uuid::Uuid::new_v4().as_bytes().to_vec(),
        };

        Ok(Self {
            redis,
            key: lock_key(name),
            signal_key: signal_key(name),
            name: name.to_string(),
            id,
            expire: config.expire,
            auto_renewal: config.auto_renewal,
            signal_expire_ms: config.signal_expire_ms,
            held: Arc::new(AtomicBool::new(false)),
            renewal: None,
        })
    }

    /// The name this lock was constructed with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This instance's owner token.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// Whether this instance currently believes it holds the lock. The server
    /// may have already revoked an expired key; the next ownership-checked
    /// operation will observe and report that.
    pub fn held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Try to take ownership of the lock.
    ///
    /// Returns `true` once acquired. Contention is not an error: a
    /// non-blocking attempt on a held lock, or a blocking one that ran out of
    /// `timeout` seconds, returns `false`.
    ///
    /// While waiting, the caller is parked on the signal list server-side and
    /// woken by the current holder's release; a wakeup is only a hint and the
    /// key is always re-contested with `SET NX`.
    pub async fn acquire(&mut self, blocking: bool, timeout: Option<u64>) -> RResult<bool, LockErr> {
        if self.held() {
            return Err(err!(
                LockErr::AlreadyAcquired,
                "'{}' is already acquired by this instance.",
                self.name
            ));
        }
        if let Some(timeout) = timeout {
            if !blocking {
                return Err(err!(
                    LockErr::TimeoutNotUsable,
                    "A timeout makes no sense for a non-blocking acquire."
                ));
            }
            if timeout == 0 {
                return Err(err!(
                    LockErr::InvalidTimeout,
                    "Timeout must be greater than 0, got {}.",
                    timeout
                ));
            }
            if let Some(expire) = self.expire {
                if timeout > expire {
                    return Err(err!(
                        LockErr::TimeoutTooLarge,
                        "Timeout ({}s) must not exceed expire ({}s).",
                        timeout,
                        expire
                    ));
                }
            }
        }

        debug!("Getting '{}' ...", self.key);
        let mut conn = self.redis.conn();
        let deadline = timeout.map(|t| Instant::now() + Duration::from_secs(t));
        let mut timed_out = false;
        loop {
            if self.try_set(&mut conn).await? {
                break;
            }
            if !blocking {
                debug!("Failed to get '{}'.", self.key);
                return Ok(false);
            }
            if timed_out {
                debug!("Timed out waiting for '{}'.", self.key);
                return Ok(false);
            }
            let wait_secs = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!("Timed out waiting for '{}'.", self.key);
                        return Ok(false);
                    }
                    // BLPOP granularity is seconds and 0 waits forever, so round up.
                    remaining.as_secs().max(1)
                }
                // Without a caller timeout, wake at least once per expiry window so a
                // crashed holder (whose key lapsed without a signal push) is noticed.
                None => self.expire.unwrap_or(0),
            };
            let popped = conn
                .blpop(&self.signal_key, wait_secs)
                .await
                .change_context(LockErr::Redis)?;
            if popped.is_none() && deadline.is_some() {
                // Server-side wait exhausted; one last SET attempt above.
                timed_out = true;
            }
        }

        self.held.store(true, Ordering::SeqCst);
        if self.auto_renewal {
            if let Some(expire) = self.expire {
                self.renewal = Some(RenewalWorker::spawn(
                    self.redis.conn().into_owned(),
                    self.key.clone(),
                    self.id.clone(),
                    expire,
                    renewal_interval(expire),
                    self.held.clone(),
                ));
            }
        }
        debug!("Got lock for '{}'.", self.key);
        Ok(true)
    }

    /// Release the lock.
    ///
    /// Fails with [`LockErr::NotAcquired`] when this instance does not hold
    /// the lock, or when the key expired/changed owner underneath it. With
    /// `force` the server state is cleared and a waiter woken regardless of
    /// ownership, and nothing is an error.
    pub async fn release(&mut self, force: bool) -> RResult<(), LockErr> {
        // The renewer is stopped and joined first so a late extend can never
        // land after the delete.
        if let Some(worker) = self.renewal.take() {
            worker.stop().await;
        }
        if !self.held() && !force {
            return Err(err!(
                LockErr::NotAcquired,
                "Cannot release '{}', not acquired by this instance.",
                self.name
            ));
        }

        debug!("Releasing '{}'.", self.key);
        let mut conn = self.redis.conn();
        if force {
            conn.script::<i64>(
                RESET_SCRIPT
                    .invoker()
                    .key(&self.key)
                    .key(&self.signal_key)
                    .arg(self.signal_ttl_ms()),
            )
            .await
            .change_context(LockErr::Redis)?;
            self.held.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let unlocked: i64 = conn
            .script(
                UNLOCK_SCRIPT
                    .invoker()
                    .key(&self.key)
                    .key(&self.signal_key)
                    .arg(self.id.as_slice())
                    .arg(self.signal_ttl_ms()),
            )
            .await
            .change_context(LockErr::Redis)?;
        self.held.store(false, Ordering::SeqCst);
        if unlocked != 1 {
            return Err(err!(
                LockErr::NotAcquired,
                "Cannot release '{}', the key expired or is owned by someone else.",
                self.name
            ));
        }
        Ok(())
    }

    /// Push the lock's expiry `expire` seconds into the future (defaulting to
    /// the construction-time expire). The new ttl replaces the remaining one,
    /// it is not added on top.
    pub async fn extend(&mut self, expire: Option<u64>) -> RResult<(), LockErr> {
        let new_expire = match expire.or(self.expire) {
            Some(0) => {
                return Err(err!(
                    LockErr::InvalidConfig,
                    "Expire must be a positive number of seconds."
                ))
            }
            Some(expire) => expire,
            None => {
                return Err(err!(
                    LockErr::NotExpirable,
                    "'{}' has no expiration time to extend.",
                    self.name
                ))
            }
        };
        if !self.held() {
            return Err(err!(
                LockErr::NotAcquired,
                "Cannot extend '{}', not acquired by this instance.",
                self.name
            ));
        }

        let mut conn = self.redis.conn();
        let extended: i64 = conn
            .script(
                EXTEND_SCRIPT
                    .invoker()
                    .key(&self.key)
                    .arg(self.id.as_slice())
                    .arg(new_expire * 1000),
            )
            .await
            .change_context(LockErr::Redis)?;
        match extended {
            1 => Ok(()),
            0 => {
                self.held.store(false, Ordering::SeqCst);
                Err(err!(
                    LockErr::NotAcquired,
                    "Cannot extend '{}', the key expired or is owned by someone else.",
                    self.name
                ))
            }
            _ => Err(err!(
                LockErr::NotExpirable,
                "Cannot extend '{}', the key is stored without a ttl.",
                self.name
            )),
        }
    }

    /// Administratively break the lock: clear the server state and wake a
    /// waiter, regardless of who owns it.
    pub async fn reset(&mut self) -> RResult<(), LockErr> {
        if let Some(worker) = self.renewal.take() {
            worker.stop().await;
        }
        let mut conn = self.redis.conn();
        conn.script::<i64>(
            RESET_SCRIPT
                .invoker()
                .key(&self.key)
                .key(&self.signal_key)
                .arg(self.signal_ttl_ms()),
        )
        .await
        .change_context(LockErr::Redis)?;
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Point-in-time probe of whether anyone holds the lock server-side. Not
    /// a claim of ownership by this instance.
    pub async fn locked(&self) -> RResult<bool, LockErr> {
        let mut conn = self.redis.conn();
        let inner = conn.get_inner_conn().await.change_context(LockErr::Redis)?;
        redis::cmd("EXISTS")
            .arg(&self.key)
            .query_async(inner)
            .await
            .change_context(LockErr::Redis)
    }

    /// The owner token currently stored at the key, which may differ from
    /// [`Lock::id`] if the lock was reset and re-acquired by someone else.
    pub async fn get_owner_id(&self) -> RResult<Option<Vec<u8>>, LockErr> {
        let mut conn = self.redis.conn();
        let inner = conn.get_inner_conn().await.change_context(LockErr::Redis)?;
        redis::cmd("GET")
            .arg(&self.key)
            .query_async(inner)
            .await
            .change_context(LockErr::Redis)
    }

    /// Scoped acquisition: block until acquired, run the future, release on
    /// the way out, handing back the future's output.
    ///
    /// The release happens on every exit path: normal completion, a panicking
    /// future (released before the panic resumes), and cancellation of the
    /// scoped future itself mid-section (e.g. under [`tokio::time::timeout`]),
    /// where a drop guard hands a best-effort release to the runtime.
    pub async fn scoped<T>(&mut self, fut: impl Future<Output = T>) -> RResult<T, LockErr> {
        self.acquire(true, None).await?;
        let mut guard = ScopedReleaseGuard {
            armed: true,
            conn: self.redis.conn().into_owned(),
            key: self.key.clone(),
            signal_key: self.signal_key.clone(),
            id: self.id.clone(),
            signal_ttl_ms: self.signal_ttl_ms(),
            held: self.held.clone(),
        };
        let result = AssertUnwindSafe(fut).catch_unwind().await;
        // From here the explicit release below owns the cleanup.
        guard.armed = false;
        match result {
            Ok(out) => {
                self.release(false).await?;
                Ok(out)
            }
            Err(payload) => {
                // Hand the lock back before letting the panic continue.
                if let Err(e) = self.release(false).await {
                    warn!("Failed to release '{}' while unwinding. Err: '{:?}'", self.key, e);
                }
                std::panic::resume_unwind(payload)
            }
        }
    }

    fn signal_ttl_ms(&self) -> u64 {
        self.expire.map(|e| e * 1000).unwrap_or(self.signal_expire_ms)
    }

    async fn try_set(&self, conn: &mut RedisConn<'_>) -> RResult<bool, LockErr> {
        let inner = conn.get_inner_conn().await.change_context(LockErr::Redis)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(&self.key).arg(self.id.as_slice()).arg("NX");
        if let Some(expire) = self.expire {
            cmd.arg("EX").arg(expire);
        }
        let result: Value = cmd
            .query_async(inner)
            .await
            .change_context(LockErr::Redis)?;
        Ok(matches!(result, Value::Okay))
    }
}

/// Cancellation backstop for [`Lock::scoped`].
///
/// Lives from the acquire to the explicit release; if the scoped future is
/// dropped in between, the critical section is over but no release ran, so
/// this fires one. It holds clones only, never a borrow of the [`Lock`].
struct ScopedReleaseGuard {
    armed: bool,
    conn: RedisConnOwned,
    key: String,
    signal_key: String,
    id: Vec<u8>,
    signal_ttl_ms: u64,
    held: Arc<AtomicBool>,
}

impl Drop for ScopedReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // A destructor can't await the unlock round-trip, so hand it to the
        // runtime. Should the task never run, the key's ttl (if any) remains
        // the backstop, same as for a crashed holder.
        self.held.store(false, Ordering::SeqCst);
        let mut conn = self.conn.clone();
        let key = std::mem::take(&mut self.key);
        let signal_key = std::mem::take(&mut self.signal_key);
        let id = std::mem::take(&mut self.id);
        let signal_ttl_ms = self.signal_ttl_ms;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn
                        .script::<i64>(
                            UNLOCK_SCRIPT
                                .invoker()
                                .key(&key)
                                .key(&signal_key)
                                .arg(id.as_slice())
                                .arg(signal_ttl_ms),
                        )
                        .await
                    {
                        warn!("Failed to release '{}' after cancellation. Err: '{:?}'", key, e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "No runtime to release '{}' after cancellation, relying on the ttl.",
                    key
                );
            }
        }
    }
}

impl std::fmt::Debug for Lock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("expire", &self.expire)
            .field("auto_renewal", &self.auto_renewal)
            .field("held", &self.held())
            .finish()
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        // A forgotten lock must not keep renewing itself forever; the key's
        // ttl (if any) then recovers the name.
        if let Some(worker) = self.renewal.take() {
            worker.abort();
        }
    }
}

/// Forcibly clear every lock and signal key on the server, waking all
/// waiters. Administrative/test tooling, never part of normal operation.
pub async fn reset_all(redis: &Redis) -> RResult<(), LockErr> {
    let mut conn = redis.conn();
    let mut names = scan_names(&mut conn, LOCK_KEY_PREFIX).await?;
    names.extend(scan_names(&mut conn, SIGNAL_KEY_PREFIX).await?);

    let names = names.into_iter().collect::<Vec<_>>();
    for chunk in names.chunks(RESET_ALL_CHUNK) {
        let mut invoker = RESET_ALL_SCRIPT.invoker().arg(DEFAULT_SIGNAL_TTL_MS);
        for name in chunk {
            invoker = invoker.arg(name.as_str());
        }
        conn.script::<i64>(invoker)
            .await
            .change_context(LockErr::Redis)?;
    }
    Ok(())
}

/// Cursor-scan all lock names under a prefix, without ever blocking the
/// server on a huge keyspace.
async fn scan_names(conn: &mut RedisConn<'_>, prefix: &str) -> RResult<BTreeSet<String>, LockErr> {
    let pattern = format!("{prefix}*");
    let mut names = BTreeSet::new();
    let mut cursor: u64 = 0;
    loop {
        let inner = conn.get_inner_conn().await.change_context(LockErr::Redis)?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(inner)
            .await
            .change_context(LockErr::Redis)?;
        names.extend(
            keys.into_iter()
                .filter_map(|key| key.strip_prefix(prefix).map(str::to_string)),
        );
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(names)
}
