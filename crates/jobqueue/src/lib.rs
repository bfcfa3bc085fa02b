mod error;
mod job;
mod memory;
mod queue;
mod spool;

pub use error::{QueueError, Result};
pub use job::Job;
pub use memory::MemoryQueue;
pub use queue::{Observer, Queue};
pub use spool::SpoolQueue;
