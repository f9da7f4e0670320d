pub mod entry;
pub mod error;
pub mod queues;
pub mod scheduler;
pub mod selection;

pub use entry::QueueEntry;
pub use error::QueueError;
pub use queues::TaskQueues;
pub use scheduler::BatchScheduler;
pub use selection::{choose_provider_for_task, choose_shortest, reassign_provider_tasks};
