pub mod error;
pub mod guard;
pub mod heartbeat;
pub mod pool;
pub mod suspension;
pub mod worker;

pub use error::WorkerError;
pub use guard::Guard;
pub use heartbeat::{NodeHeartbeat, WorkerPresence};
pub use pool::WorkerPool;
pub use suspension::QueueReassigner;
pub use worker::WorkerLoop;
