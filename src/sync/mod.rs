//! Replication pipeline: master watcher, per-child queues and executors,
//! connection supervision, and the shared retry policy.

pub mod executor;
pub mod queue;
pub mod retry;
pub mod supervisor;
pub mod watcher;

pub use executor::ChildExecutor;
pub use queue::ReplicationQueue;
pub use supervisor::{ConnectionSupervisor, HealthBoard};
pub use watcher::{ChildChannel, MasterWatcher, SnapshotHandle};
