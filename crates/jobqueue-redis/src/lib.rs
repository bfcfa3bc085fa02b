//! Redis-backed [`jobqueue::Queue`].
//!
//! Jobs are pushed with `LPUSH` and popped with `BRPOP`, so each job reaches
//! exactly one consumer. Connections are opened lazily on first use, which
//! makes a [`RedisQueue`] safe to hand to forked workers, and are wrapped in a
//! [`RedisAdapter`] that replays connect/auth/select once after the server
//! drops the connection.

mod adapter;
mod options;
mod queue;

pub use adapter::RedisAdapter;
pub use options::RedisOptions;
pub use queue::RedisQueue;
