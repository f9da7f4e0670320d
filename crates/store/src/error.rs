use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, i64),

    #[error("invalid state: {0}")]
    InvalidState(String),
}
