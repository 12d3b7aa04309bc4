//! Send-side runtime: the dispatch loop, its counters, and the thread that
//! runs it.

pub mod dispatch;
pub mod stats;
pub mod worker;

pub use dispatch::{DispatchExit, Dispatched, Dispatcher};
pub use stats::{StatsSnapshot, WorkerStats};
pub use worker::{THREAD_NAME, Worker, WorkerError, WorkerHandle};
