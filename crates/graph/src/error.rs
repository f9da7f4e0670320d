use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("neo4j error: {0}")]
    Neo4j(#[from] neo4rs::Error),

    #[error("unsupported relation type: {0}")]
    UnsupportedRelation(String),
}
