use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("store error: {0}")]
    Store(#[from] novelgraph_store::StoreError),

    #[error("graph error: {0}")]
    Graph(#[from] novelgraph_graph::GraphError),

    #[error("kv error: {0}")]
    Kv(#[from] novelgraph_kv::KvError),

    #[error("llm error: {0}")]
    Llm(#[from] novelgraph_llm::LlmError),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("provider '{0}' is suspended")]
    ProviderSuspended(String),

    #[error("chapter not found: {0}")]
    ChapterMissing(i64),

    #[error("novel not found: {0}")]
    NovelMissing(i64),
}
