use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("kv error: {0}")]
    Kv(#[from] novelgraph_kv::KvError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("entry parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
