use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("kv error: {0}")]
    Kv(#[from] novelgraph_kv::KvError),

    #[error("store error: {0}")]
    Store(#[from] novelgraph_store::StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] novelgraph_queue::QueueError),

    #[error("extract error: {0}")]
    Extract(#[from] novelgraph_extractor::ExtractError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
