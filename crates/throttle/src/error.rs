use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("kv error: {0}")]
    Kv(#[from] novelgraph_kv::KvError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store error: {0}")]
    Store(#[from] novelgraph_store::StoreError),
}
