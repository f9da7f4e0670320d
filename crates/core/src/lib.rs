pub mod config;
pub mod keys;
pub mod progress;
pub mod status;

pub use config::Config;
pub use progress::ProgressEvent;
pub use status::{ChapterState, TaskCounters, TaskStatus};
