//! Distributed lock over Redis SET NX EX.
//!
//! The lock value encodes the holder's pid and acquisition time so a release
//! can verify ownership: release runs a compare-and-delete script and never
//! removes a lock that expired and was re-acquired by another process.

use std::time::{SystemTime, UNIX_EPOCH};

use redis::Script;
use tracing::{debug, warn};

use novelgraph_core::keys;

use crate::client::KvClient;
use crate::error::KvError;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Build the lock value for the current process.
pub fn lock_value(pid: u32, unix_ts: u64) -> String {
    format!("{pid}_{unix_ts}")
}

/// Handle for a held lock; pass back to [`DistributedLock::release`].
#[derive(Debug, Clone)]
pub struct LockGuard {
    pub key: String,
    pub value: String,
}

#[derive(Clone)]
pub struct DistributedLock {
    kv: KvClient,
}

impl DistributedLock {
    pub fn new(kv: KvClient) -> Self {
        Self { kv }
    }

    /// Try to take the named lock. Non-blocking: returns None when another
    /// holder owns it.
    pub async fn try_acquire(&self, name: &str, ttl_secs: u64) -> Result<Option<LockGuard>, KvError> {
        let key = keys::lock(name);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let value = lock_value(std::process::id(), now);

        if self.kv.set_nx_ex(&key, &value, ttl_secs).await? {
            debug!(lock = %key, "acquired distributed lock");
            Ok(Some(LockGuard { key, value }))
        } else {
            debug!(lock = %key, "lock held elsewhere");
            Ok(None)
        }
    }

    /// Release a held lock. Returns false when the lock expired and someone
    /// else holds it now — that is not an error, only worth a warning.
    pub async fn release(&self, guard: LockGuard) -> Result<bool, KvError> {
        let mut con = self.kv.connection();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&guard.key)
            .arg(&guard.value)
            .invoke_async(&mut con)
            .await?;
        if deleted == 1 {
            debug!(lock = %guard.key, "released distributed lock");
            Ok(true)
        } else {
            warn!(lock = %guard.key, "lock already expired or re-acquired elsewhere");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_value_is_pid_and_timestamp() {
        let value = lock_value(1234, 1_700_000_000);
        assert_eq!(value, "1234_1700000000");
        let mut parts = value.splitn(2, '_');
        assert_eq!(parts.next().unwrap().parse::<u32>().unwrap(), 1234);
        assert_eq!(parts.next().unwrap().parse::<u64>().unwrap(), 1_700_000_000);
    }

    #[test]
    fn release_script_compares_before_deleting() {
        // The script must only DEL when the stored value matches ours.
        assert!(RELEASE_SCRIPT.contains(r#"redis.call("get", KEYS[1]) == ARGV[1]"#));
        assert!(RELEASE_SCRIPT.contains(r#"redis.call("del", KEYS[1])"#));
    }
}
