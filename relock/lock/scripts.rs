use std::sync::LazyLock;

use crate::redis::RedisScript;

/// Atomically release an owned lock key and wake at most one waiter.
pub(crate) static UNLOCK_SCRIPT: LazyLock<RedisScript> =
    LazyLock::new(|| RedisScript::new("UNLOCK_SCRIPT", include_str!("lua_scripts/unlock.lua")));

/// Atomically re-extend the ttl of an owned lock key.
pub(crate) static EXTEND_SCRIPT: LazyLock<RedisScript> =
    LazyLock::new(|| RedisScript::new("EXTEND_SCRIPT", include_str!("lua_scripts/extend.lua")));

/// Forcibly clear one lock and wake a waiter, ignoring ownership.
pub(crate) static RESET_SCRIPT: LazyLock<RedisScript> =
    LazyLock::new(|| RedisScript::new("RESET_SCRIPT", include_str!("lua_scripts/reset.lua")));

/// Clear a chunk of locks by name, waking all their waiters.
pub(crate) static RESET_ALL_SCRIPT: LazyLock<RedisScript> =
    LazyLock::new(|| RedisScript::new("RESET_ALL_SCRIPT", include_str!("lua_scripts/reset_all.lua")));
