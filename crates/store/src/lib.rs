pub mod db;
pub mod error;
pub mod models;
pub mod novels;
pub mod plots;
pub mod providers;
pub mod tasks;

pub use db::init_pg_pool;
pub use error::StoreError;
pub use models::{AiProvider, Chapter, ChapterStatusRow, ExtractionConfig, KgTask, Novel};
pub use novels::NovelStore;
pub use plots::PlotStore;
pub use providers::ProviderStore;
pub use tasks::{ChapterOutcome, StartOutcome, StartRefusal, TaskStore};
