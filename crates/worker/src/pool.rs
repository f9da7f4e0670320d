//! Worker process pool.
//!
//! Workers are processes, not threads: each child is a `kg-worker` binary
//! bound to one provider, with connection pools opened after spawn so no
//! pooled socket ever crosses a process boundary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use novelgraph_core::config::NodeConfig;

use crate::error::WorkerError;

/// True when the pid exists on this host (signal 0 probe).
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Decide which providers get new processes this cycle, respecting the
/// per-provider target and both hard caps. Returns one element per process
/// to spawn.
pub fn plan_spawns(
    existing: &HashMap<String, usize>,
    providers: &[String],
    per_provider: usize,
    max_total: usize,
    max_per_provider: usize,
) -> Vec<String> {
    let mut total: usize = existing.values().sum();
    let mut spawns = Vec::new();
    for provider in providers {
        let current = existing.get(provider).copied().unwrap_or(0);
        if current >= per_provider.min(max_per_provider) {
            continue;
        }
        let wanted = per_provider.min(max_per_provider) - current;
        for _ in 0..wanted {
            if total >= max_total {
                warn!(provider = %provider, "total process cap reached, skipping spawn");
                return spawns;
            }
            spawns.push(provider.clone());
            total += 1;
        }
    }
    spawns
}

struct WorkerChild {
    provider: String,
    child: Child,
}

pub struct WorkerPool {
    node: NodeConfig,
    worker_bin: PathBuf,
    children: Mutex<Vec<WorkerChild>>,
}

impl WorkerPool {
    /// The `kg-worker` binary is expected next to the running executable.
    pub fn new(node: NodeConfig) -> Result<Self, WorkerError> {
        let worker_bin = std::env::current_exe()?
            .parent()
            .map(|dir| dir.join("kg-worker"))
            .unwrap_or_else(|| PathBuf::from("kg-worker"));
        Ok(Self {
            node,
            worker_bin,
            children: Mutex::new(Vec::new()),
        })
    }

    /// Ensure the target number of live processes per provider. Returns how
    /// many were spawned.
    pub async fn ensure_workers(&self, providers: &[String]) -> usize {
        let mut children = self.children.lock().await;

        // Prune exited children first so dead slots free capacity.
        let mut alive = Vec::new();
        for mut wc in children.drain(..) {
            match wc.child.try_wait() {
                Ok(Some(status)) => {
                    warn!(provider = %wc.provider, %status, "worker process exited");
                }
                Ok(None) => alive.push(wc),
                Err(e) => {
                    warn!(provider = %wc.provider, error = %e, "worker wait failed, dropping handle");
                }
            }
        }
        *children = alive;

        let mut existing: HashMap<String, usize> = HashMap::new();
        for wc in children.iter() {
            *existing.entry(wc.provider.clone()).or_default() += 1;
        }

        let spawns = plan_spawns(
            &existing,
            providers,
            self.node.workers_per_provider,
            self.node.max_total_processes,
            self.node.max_processes_per_provider,
        );

        let mut spawned = 0usize;
        for provider in spawns {
            match Command::new(&self.worker_bin)
                .arg("--provider")
                .arg(&provider)
                .env("NODE_NAME", &self.node.name)
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => {
                    info!(provider = %provider, pid = child.id().unwrap_or(0), "spawned worker");
                    children.push(WorkerChild { provider, child });
                    spawned += 1;
                }
                Err(e) => {
                    error!(provider = %provider, bin = %self.worker_bin.display(), error = %e, "failed to spawn worker");
                }
            }
        }

        if spawned > 0 {
            info!(spawned, total = children.len(), "worker pool scaled");
        }
        spawned
    }

    pub async fn alive_count(&self) -> usize {
        let mut children = self.children.lock().await;
        let mut count = 0;
        for wc in children.iter_mut() {
            if matches!(wc.child.try_wait(), Ok(None)) {
                count += 1;
            }
        }
        count
    }

    /// Graceful stop: SIGTERM everyone, wait up to `timeout`, SIGKILL the
    /// stragglers.
    pub async fn stop_all(&self, timeout: Duration) {
        let mut children = self.children.lock().await;
        if children.is_empty() {
            return;
        }
        info!(count = children.len(), "stopping worker processes");

        for wc in children.iter() {
            if let Some(pid) = wc.child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for wc in children.iter_mut() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, wc.child.wait()).await {
                Ok(Ok(status)) => info!(provider = %wc.provider, %status, "worker exited"),
                Ok(Err(e)) => warn!(provider = %wc.provider, error = %e, "worker wait failed"),
                Err(_) => {
                    warn!(provider = %wc.provider, "worker did not exit in time, killing");
                    let _ = wc.child.start_kill();
                }
            }
        }
        children.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn plan_fills_missing_workers_per_provider() {
        let mut existing = HashMap::new();
        existing.insert("openai".to_string(), 1);
        let spawns = plan_spawns(&existing, &providers(&["openai", "rules"]), 2, 50, 10);
        assert_eq!(
            spawns,
            vec!["openai".to_string(), "rules".to_string(), "rules".to_string()]
        );
    }

    #[test]
    fn plan_skips_fully_staffed_providers() {
        let mut existing = HashMap::new();
        existing.insert("openai".to_string(), 2);
        let spawns = plan_spawns(&existing, &providers(&["openai"]), 2, 50, 10);
        assert!(spawns.is_empty());
    }

    #[test]
    fn plan_respects_total_cap() {
        let existing = HashMap::new();
        let spawns = plan_spawns(&existing, &providers(&["a", "b", "c"]), 2, 3, 10);
        assert_eq!(spawns.len(), 3);
    }

    #[test]
    fn plan_respects_per_provider_cap() {
        let existing = HashMap::new();
        let spawns = plan_spawns(&existing, &providers(&["a"]), 8, 50, 3);
        assert_eq!(spawns.len(), 3);
        assert!(spawns.iter().all(|p| p == "a"));
    }

    #[test]
    fn plan_counts_existing_toward_total_cap() {
        let mut existing = HashMap::new();
        existing.insert("a".to_string(), 4);
        let spawns = plan_spawns(&existing, &providers(&["b"]), 2, 5, 10);
        assert_eq!(spawns.len(), 1);
        assert_eq!(spawns[0], "b");
    }
}
