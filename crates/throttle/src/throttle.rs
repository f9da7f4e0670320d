//! Per-provider failure accounting, suspension, and rate limiting.
//!
//! All counters live in Redis with TTLs so no in-memory state must survive
//! a restart. When Redis is unreachable the throttle degrades to
//! process-local maps: non-atomic, best effort, but it keeps a single
//! worker honest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::Script;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use novelgraph_core::keys::{self, ttl, RULES_PROVIDER};
use novelgraph_kv::KvClient;
use novelgraph_store::ProviderStore;

use crate::error::ThrottleError;
use crate::permit::{decide, PermitDecision};

pub const MAX_CONSECUTIVE_FAILURES: i64 = 3;
pub const SUSPEND_SECS: u64 = ttl::SUSPENSION;

/// Fallback interval when the provider row cannot be read.
const DEFAULT_RATE_LIMIT_INTERVAL: u64 = 10;

/// How long a provider's configured interval is cached in-process.
const INTERVAL_CACHE_SECS: u64 = 60;

/// One indivisible read-check-write over the last-request timestamp, so
/// two concurrent workers cannot both observe an empty bucket.
/// Returns {1, "0"} when granted, {0, "<wait_seconds>"} otherwise.
const PERMIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local last = tonumber(redis.call("GET", KEYS[1]))
if not last or now - last >= interval then
    redis.call("SET", KEYS[1], ARGV[1], "EX", ARGV[3])
    return {1, "0"}
end
return {0, tostring(interval - (now - last))}
"#;

/// Hook fired when a provider crosses the failure threshold. The worker
/// pool installs an implementation that migrates the provider's queued
/// refs and pauses its running tasks.
#[async_trait]
pub trait SuspensionListener: Send + Sync {
    async fn on_suspended(&self, provider: &str);
}

pub struct ProviderThrottle {
    kv: KvClient,
    providers: ProviderStore,
    interval_cache: Mutex<HashMap<String, (u64, Instant)>>,
    // in-process degradation state
    local_fail_counts: Mutex<HashMap<String, i64>>,
    local_suspended_until: Mutex<HashMap<String, u64>>,
    local_last_request: Mutex<HashMap<String, f64>>,
    listener: RwLock<Option<Arc<dyn SuspensionListener>>>,
}

impl ProviderThrottle {
    pub fn new(kv: KvClient, providers: ProviderStore) -> Self {
        Self {
            kv,
            providers,
            interval_cache: Mutex::new(HashMap::new()),
            local_fail_counts: Mutex::new(HashMap::new()),
            local_suspended_until: Mutex::new(HashMap::new()),
            local_last_request: Mutex::new(HashMap::new()),
            listener: RwLock::new(None),
        }
    }

    pub async fn set_listener(&self, listener: Arc<dyn SuspensionListener>) {
        *self.listener.write().await = Some(listener);
    }

    fn now_secs() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    // ── suspension ───────────────────────────────────────────────────

    pub async fn is_suspended(&self, provider: &str) -> bool {
        let provider = keys::normalize_provider(provider);
        if provider == RULES_PROVIDER {
            return false;
        }
        match self.kv.exists(&keys::provider_suspend(&provider)).await {
            Ok(exists) => exists,
            Err(_) => {
                let now = Self::now_secs() as u64;
                let mut local = self.local_suspended_until.lock().await;
                match local.get(&provider) {
                    Some(until) if *until > now => true,
                    Some(_) => {
                        local.remove(&provider);
                        false
                    }
                    None => false,
                }
            }
        }
    }

    /// Suspend a provider for `secs` (admin entry point and threshold
    /// escalation). Fires the suspension listener.
    pub async fn suspend(&self, provider: &str, secs: u64) {
        let provider = keys::normalize_provider(provider);
        if provider == RULES_PROVIDER {
            return;
        }
        let key = keys::provider_suspend(&provider);
        let until = Self::now_secs() as u64 + secs;
        if let Err(e) = self.kv.set_ex(&key, &until.to_string(), secs).await {
            warn!(provider = %provider, error = %e, "redis unavailable, suspending in-process only");
            self.local_suspended_until.lock().await.insert(provider.clone(), until);
        }
        info!(provider = %provider, secs, "provider suspended");

        if let Some(listener) = self.listener.read().await.clone() {
            listener.on_suspended(&provider).await;
        }
    }

    pub async fn clear_suspension(&self, provider: &str) {
        let provider = keys::normalize_provider(provider);
        let _ = self.kv.del(&keys::provider_suspend(&provider)).await;
        self.local_suspended_until.lock().await.remove(&provider);
        info!(provider = %provider, "suspension cleared");
    }

    // ── failure accounting ───────────────────────────────────────────

    pub async fn failure_count(&self, provider: &str) -> i64 {
        let provider = keys::normalize_provider(provider);
        match self.kv.get(&keys::provider_fail(&provider)).await {
            Ok(value) => value.and_then(|v| v.parse().ok()).unwrap_or(0),
            Err(_) => *self.local_fail_counts.lock().await.get(&provider).unwrap_or(&0),
        }
    }

    pub async fn reset_failures(&self, provider: &str) {
        let provider = keys::normalize_provider(provider);
        let _ = self.kv.del(&keys::provider_fail(&provider)).await;
        self.local_fail_counts.lock().await.remove(&provider);
    }

    /// Count one consecutive failure. At the threshold the provider is
    /// suspended, its counter resets, and the listener fires. Already
    /// suspended providers are not re-counted.
    ///
    /// Returns `(current_count, suspended_now)`.
    pub async fn increment_failure(&self, provider: &str) -> (i64, bool) {
        let provider = keys::normalize_provider(provider);
        if provider == RULES_PROVIDER {
            return (0, false);
        }
        if self.is_suspended(&provider).await {
            return (self.failure_count(&provider).await, true);
        }

        let key = keys::provider_fail(&provider);
        let count = match self.kv.incr(&key).await {
            Ok(count) => {
                let _ = self.kv.expire(&key, ttl::FAILURE_COUNT as i64).await;
                count
            }
            Err(e) => {
                debug!(provider = %provider, error = %e, "counting failure in-process");
                let mut local = self.local_fail_counts.lock().await;
                let count = local.entry(provider.clone()).or_insert(0);
                *count += 1;
                *count
            }
        };

        if count >= MAX_CONSECUTIVE_FAILURES {
            warn!(
                provider = %provider,
                failures = count,
                "consecutive failure threshold reached, suspending"
            );
            self.suspend(&provider, SUSPEND_SECS).await;
            self.reset_failures(&provider).await;
            return (0, true);
        }

        (count, false)
    }

    // ── rate limiting ────────────────────────────────────────────────

    /// The provider's minimum inter-request interval, cached for 60 s.
    pub async fn rate_limit_interval(&self, provider: &str) -> u64 {
        let provider = keys::normalize_provider(provider);
        if provider == RULES_PROVIDER {
            return 0;
        }

        {
            let cache = self.interval_cache.lock().await;
            if let Some((interval, at)) = cache.get(&provider) {
                if at.elapsed().as_secs() < INTERVAL_CACHE_SECS {
                    return *interval;
                }
            }
        }

        let interval = match self.providers.rate_limit_interval(&provider).await {
            Ok(interval) => interval,
            Err(e) => {
                warn!(provider = %provider, error = %e, "rate-limit lookup failed, using default");
                DEFAULT_RATE_LIMIT_INTERVAL
            }
        };

        self.interval_cache
            .lock()
            .await
            .insert(provider, (interval, Instant::now()));
        interval
    }

    /// Try to take the one permitted request slot within the provider's
    /// interval. Exactly one of K concurrent callers is granted.
    pub async fn try_acquire_permit(&self, provider: &str) -> PermitDecision {
        let provider = keys::normalize_provider(provider);
        let interval = self.rate_limit_interval(&provider).await;
        if interval == 0 {
            return PermitDecision::granted();
        }

        let now = Self::now_secs();
        let mut con = self.kv.connection();
        let scripted: Result<(i64, String), redis::RedisError> = Script::new(PERMIT_SCRIPT)
            .key(keys::provider_last_request(&provider))
            .arg(now)
            .arg(interval)
            .arg(ttl::LAST_REQUEST)
            .invoke_async(&mut con)
            .await;

        match scripted {
            Ok((1, _)) => PermitDecision::granted(),
            Ok((_, wait)) => PermitDecision::wait(wait.parse().unwrap_or(interval as f64)),
            Err(e) => {
                debug!(provider = %provider, error = %e, "permit script failed, in-process fallback");
                let mut local = self.local_last_request.lock().await;
                let decision = decide(now, local.get(&provider).copied(), interval);
                if decision.granted {
                    local.insert(provider, now);
                }
                decision
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_script_grants_and_records_in_one_unit() {
        // The SET must happen inside the granted branch, before returning.
        let granted_branch = PERMIT_SCRIPT.find("now - last >= interval").unwrap();
        let set_call = PERMIT_SCRIPT.find(r#"redis.call("SET", KEYS[1]"#).unwrap();
        assert!(set_call > granted_branch);
        assert!(PERMIT_SCRIPT.contains(r#"return {1, "0"}"#));
        assert!(PERMIT_SCRIPT.contains("tostring(interval - (now - last))"));
    }

    #[test]
    fn threshold_matches_three_strikes() {
        assert_eq!(MAX_CONSECUTIVE_FAILURES, 3);
        assert_eq!(SUSPEND_SECS, 600);
    }
}
