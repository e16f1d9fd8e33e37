//! Parallel execution substrate for the renderer: a fixed pool of worker
//! threads running caller-supplied operations with coordinated pause,
//! resume and abort, plus a cooperative compute-task layer that lets
//! sequential-looking driver code fork work across the pool and await it.
//!
//! The engine is domain-agnostic. It understands an ordered sequence of
//! procedures and a pool of workers, nothing else; scene preparation,
//! integrators and I/O are clients that submit work through [`Device`].
//!
//! Work is partitioned dynamically: every worker claims the next procedure
//! index from a shared atomic cursor, one at a time, so procedures of
//! wildly different cost balance across the pool without static slicing.
//! Pause and abort are observed cooperatively at [`Scheduler`] checkpoints;
//! a callback that never checks in cannot be forcibly stopped.

pub mod device;
pub mod lock;
pub mod operation;
pub mod scheduler;
pub mod signal;
pub mod task;
pub mod worker;

pub use device::Device;
pub use lock::{ScopedReadGuard, ScopedRwLock, ScopedUpgradeableGuard, ScopedWriteGuard};
pub use operation::{ClosureOperation, Operation, OperationCore, OperationFactory, Procedure};
pub use scheduler::{Interrupted, Scheduler};
pub use signal::SignalGate;
pub use task::{AsyncComputeOperation, ComputeScope, ComputeTask};
pub use worker::{Worker, WorkerStatus};
