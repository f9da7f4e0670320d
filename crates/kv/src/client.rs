use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::debug;

use crate::error::KvError;

/// Async Redis client shared by the queues, the throttle, and the workers.
///
/// Wraps a [`ConnectionManager`], which multiplexes one socket and reconnects
/// with backoff on its own. Blocking commands (`BRPOP`, subscriptions) pin
/// their socket, so consumers that block must open a dedicated `KvClient`
/// instead of sharing the short-op one.
#[derive(Clone)]
pub struct KvClient {
    manager: ConnectionManager,
}

impl KvClient {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        debug!(url = %url, "redis connected");
        Ok(Self { manager })
    }

    /// Clone of the underlying multiplexed connection, for scripted calls.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn ping(&self) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        redis::cmd("PING").query_async::<()>(&mut con).await?;
        Ok(())
    }

    // ── strings ──────────────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.manager.clone();
        Ok(con.get(key).await?)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    /// SET key value NX EX ttl — returns true if the key was set.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, KvError> {
        let mut con = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    /// INCR, returning the new value.
    pub async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut con = self.manager.clone();
        Ok(con.incr(key, 1).await?)
    }

    pub async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(key).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut con = self.manager.clone();
        Ok(con.exists(key).await?)
    }

    pub async fn ttl(&self, key: &str) -> Result<i64, KvError> {
        let mut con = self.manager.clone();
        Ok(con.ttl(key).await?)
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.expire::<_, ()>(key, ttl_secs).await?;
        Ok(())
    }

    // ── lists ────────────────────────────────────────────────────────

    pub async fn rpush(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    pub async fn rpush_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), KvError> {
        self.rpush(key, &serde_json::to_string(value)?).await
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.manager.clone();
        Ok(con.lpop(key, None).await?)
    }

    /// Blocking pop from the tail; returns None on timeout.
    ///
    /// Blocks the socket for up to `timeout_secs` — call only on a client
    /// dedicated to blocking consumption.
    pub async fn brpop(&self, key: &str, timeout_secs: f64) -> Result<Option<String>, KvError> {
        let mut con = self.manager.clone();
        let reply: Option<(String, String)> = con.brpop(key, timeout_secs).await?;
        Ok(reply.map(|(_, value)| value))
    }

    pub async fn llen(&self, key: &str) -> Result<usize, KvError> {
        let mut con = self.manager.clone();
        Ok(con.llen(key).await?)
    }

    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        let mut con = self.manager.clone();
        Ok(con.lrange(key, start, stop).await?)
    }

    // ── hashes ───────────────────────────────────────────────────────

    pub async fn hset_all(&self, key: &str, fields: &[(&str, String)]) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut con = self.manager.clone();
        Ok(con.hgetall(key).await?)
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut con = self.manager.clone();
        Ok(con.hget(key, field).await?)
    }

    pub async fn hdel(&self, key: &str, fields: &[&str]) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.hdel::<_, _, ()>(key, fields).await?;
        Ok(())
    }

    // ── discovery / pub-sub ──────────────────────────────────────────

    /// SCAN-based key discovery (cursor iteration, no blocking KEYS call).
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut con = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, chunk): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut con)
                .await?;
            keys.extend(chunk);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    pub async fn publish<T: Serialize>(&self, channel: &str, payload: &T) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        let body = serde_json::to_string(payload)?;
        con.publish::<_, _, ()>(channel, body).await?;
        Ok(())
    }
}
