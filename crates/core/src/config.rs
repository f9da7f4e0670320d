use std::env;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub scheduler: SchedulerConfig,
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
    pub neo4j: Neo4jConfig,
    pub llm: LlmConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            node: NodeConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            postgres: PostgresConfig::from_env(),
            redis: RedisConfig::from_env(),
            neo4j: Neo4jConfig::from_env(),
            llm: LlmConfig::from_env(),
        }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  node:      name={}, workers_per_provider={}, guard_interval={}s",
            self.node.name,
            self.node.workers_per_provider,
            self.node.guard_interval_secs
        );
        tracing::info!(
            "  scheduler: interval={}s, batch_size={}",
            self.scheduler.check_interval_secs,
            self.scheduler.batch_size
        );
        tracing::info!("  postgres:  url={}", mask_url(&self.postgres.url));
        tracing::info!("  redis:     url={}", mask_url(&self.redis.url));
        tracing::info!("  neo4j:     uri={}, user={}", self.neo4j.uri, self.neo4j.user);
        tracing::info!("  llm:       request_timeout={}s", self.llm.request_timeout_secs);
    }
}

/// Mask the userinfo section of a connection URL for logging.
fn mask_url(url: &str) -> String {
    match (url.find("://"), url.find('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***@{}", &url[..scheme_end + 3], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

// ── Worker node ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable name identifying this host in `kg:nodes:<name>`.
    pub name: String,
    pub workers_per_provider: usize,
    /// Explicit provider list; None = discover active providers from the store.
    pub providers: Option<Vec<String>>,
    pub max_total_processes: usize,
    pub max_processes_per_provider: usize,
    pub guard_interval_secs: u64,
}

impl NodeConfig {
    fn from_env() -> Self {
        let providers = env_opt("PROVIDERS").map(|raw| {
            raw.split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        });
        Self {
            name: env_or("NODE_NAME", "worker-node"),
            workers_per_provider: env_usize("WORKERS_PER_PROVIDER", 2),
            providers,
            max_total_processes: env_usize("MAX_TOTAL_PROCESSES", 50),
            max_processes_per_provider: env_usize("MAX_PROCESSES_PER_PROVIDER", 10),
            guard_interval_secs: env_u64("GUARD_INTERVAL", 30),
        }
    }
}

// ── Batch scheduler ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub check_interval_secs: u64,
    pub batch_size: usize,
}

impl SchedulerConfig {
    fn from_env() -> Self {
        Self {
            check_interval_secs: env_u64("SCHEDULER_INTERVAL", 5),
            batch_size: env_usize("BATCH_SIZE", 10),
        }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    /// Workers open small pools: they hold at most one chapter in flight.
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env() -> Self {
        Self {
            url: env_or("DATABASE_URL", "postgres://postgres@localhost:5432/novelgraph"),
            max_connections: env_u64("PG_MAX_CONNECTIONS", 5) as u32,
        }
    }
}

// ── Redis ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    fn from_env() -> Self {
        Self {
            url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
        }
    }
}

// ── Neo4j ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

impl Neo4jConfig {
    fn from_env() -> Self {
        Self {
            uri: env_or("NEO4J_URI", "bolt://localhost:7687"),
            user: env_or("NEO4J_USER", "neo4j"),
            password: env_or("NEO4J_PASSWORD", ""),
        }
    }
}

// ── LLM runtime ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub request_timeout_secs: u64,
}

impl LlmConfig {
    fn from_env() -> Self {
        Self {
            request_timeout_secs: env_u64("LLM_TIMEOUT", 120),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_url_hides_userinfo() {
        assert_eq!(
            mask_url("postgres://user:secret@db:5432/novelgraph"),
            "postgres://***@db:5432/novelgraph"
        );
        assert_eq!(mask_url("redis://127.0.0.1:6379"), "redis://127.0.0.1:6379");
    }
}
