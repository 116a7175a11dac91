use deadpool_redis::redis::{Cmd, ToRedisArgs};

/// A lua script with its SHA-1 digest precomputed. These objects are cheap to
/// keep in statics and reuse for every invocation.
pub struct RedisScript {
    name: &'static str,
    lua: &'static str,
    hash: String,
}

impl RedisScript {
    /// Create a new script from the given static string.
    pub fn new(name: &'static str, lua: &'static str) -> Self {
        let mut sha = sha1_smol::Sha1::new();
        sha.update(lua.as_bytes());
        Self {
            name,
            lua,
            hash: sha.digest().to_string(),
        }
    }

    /// Start building an invocation of this script with keys and args.
    pub fn invoker(&self) -> RedisScriptInvoker<'_> {
        RedisScriptInvoker {
            script: self,
            keys: vec![],
            args: vec![],
        }
    }
}

/// A single invocation of a [`RedisScript`].
pub struct RedisScriptInvoker<'a> {
    script: &'a RedisScript,
    keys: Vec<Vec<u8>>,
    args: Vec<Vec<u8>>,
}

impl RedisScriptInvoker<'_> {
    /// Add a key the script will touch.
    pub fn key(mut self, key: impl ToRedisArgs) -> Self {
        self.keys.extend(key.to_redis_args());
        self
    }

    /// Add a script argument.
    pub fn arg(mut self, arg: impl ToRedisArgs) -> Self {
        self.args.extend(arg.to_redis_args());
        self
    }

    pub(crate) fn script_name(&self) -> &'static str {
        self.script.name
    }

    /// The `EVALSHA` command executing the (hopefully) server-cached script.
    pub(crate) fn eval_cmd(&self) -> Cmd {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(&self.script.hash).arg(self.keys.len());
        for key in &self.keys {
            cmd.arg(key);
        }
        for arg in &self.args {
            cmd.arg(arg);
        }
        cmd
    }

    /// The `SCRIPT LOAD` command caching the body server-side.
    pub(crate) fn load_cmd(&self) -> Cmd {
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(self.script.lua);
        cmd
    }
}
