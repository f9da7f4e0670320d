pub mod client;
pub mod error;
pub mod lock;

pub use client::KvClient;
pub use error::KvError;
pub use lock::{DistributedLock, LockGuard};
