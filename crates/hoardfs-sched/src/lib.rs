#![warn(missing_docs)]

//! HoardFS scheduler subsystem: fair per-node task queue, worker pool, directory tree locking
//!
//! Tasks are queued per key (normally a storage node name). Each key is
//! served in FIFO order and keys are served round-robin so one busy node
//! cannot starve the rest of the fleet. A pool of OS threads drains the
//! queue; a fatal task error aborts every worker in the process.

pub mod abort;
pub mod error;
pub mod pool;
pub mod queue;
pub mod task;
pub mod updown;

pub use abort::AbortToken;
pub use error::{SchedError, SchedResult, TaskError, TaskResult};
pub use pool::{drain_serial, Connector, EmptyPool, NoopConnector, Pool, WorkerPool};
pub use queue::FairMultiFifoQueue;
pub use task::{Cleanup, Task, TaskContext, TaskQueue};
pub use updown::{DownGuard, UpDownLock, UpGuard};
