use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::lock::ScopedRwLock;
use crate::scheduler::{Interrupted, Scheduler};
use crate::worker::Worker;

/// Progress tracker for one claimed slice of an operation's work.
///
/// Created per claim and owned exclusively by the executing worker for the
/// duration of one invocation.
#[derive(Debug, Clone)]
pub struct Procedure {
    index: u64,
    total_units: u32,
    completed_units: u32,
}

impl Procedure {
    pub(crate) fn new(index: u64) -> Self {
        Self {
            index,
            total_units: 0,
            completed_units: 0,
        }
    }

    /// Index this procedure was claimed under.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Resets sub-progress to `total_units` outstanding units.
    pub fn begin(&mut self, total_units: u32) {
        self.total_units = total_units;
        self.completed_units = 0;
    }

    /// Records one finished unit of intra-procedure progress.
    pub fn advance(&mut self) {
        debug_assert!(self.completed_units < self.total_units);
        self.completed_units += 1;
    }

    pub fn total_units(&self) -> u32 {
        self.total_units
    }

    pub fn completed_units(&self) -> u32 {
        self.completed_units
    }
}

/// Shared dispatch state common to every operation.
///
/// The claim cursor is the sole coordination point for dynamic partitioning:
/// workers claim one procedure index at a time with an atomic increment, so
/// uneven procedures balance across the pool without static slicing or a
/// work-stealing deque. The cursor never decreases.
pub struct OperationCore {
    cursor: CachePadded<AtomicU64>,
    completed: CachePadded<AtomicU64>,
    total: AtomicU64,
    workers: ScopedRwLock<Arc<[Worker]>>,
}

impl OperationCore {
    pub fn new(total_procedures: u64) -> Self {
        Self {
            cursor: CachePadded::new(AtomicU64::new(0)),
            completed: CachePadded::new(AtomicU64::new(0)),
            total: AtomicU64::new(total_procedures),
            workers: ScopedRwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Resets the cursor and snapshots the worker set for one dispatch.
    /// Must run exactly once per dispatch, before any worker pulls.
    pub fn reset(&self, workers: &[Worker]) {
        *self.workers.fetch_write() = Arc::from(workers.to_vec());
        self.cursor.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
    }

    /// Claims the next procedure index, or `None` once the range is drained.
    pub fn claim(&self) -> Option<u64> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        (index < self.total.load(Ordering::Relaxed)).then_some(index)
    }

    pub(crate) fn complete_one(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn add_procedures(&self, count: u64) {
        self.total.fetch_add(count, Ordering::AcqRel);
    }

    /// Whether unclaimed procedures remain.
    pub fn has_remaining(&self) -> bool {
        self.cursor.load(Ordering::Relaxed) < self.total.load(Ordering::Relaxed)
    }

    pub fn total_procedures(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn completed_procedures(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Worker snapshot taken at the last dispatch.
    pub fn workers(&self) -> Arc<[Worker]> {
        Arc::clone(&self.workers.fetch_read())
    }
}

/// A dynamically-partitioned unit of work distributed across the whole pool.
///
/// Implementors supply the per-procedure body; the provided methods carry
/// the claim/checkpoint discipline so every operation pauses and aborts the
/// same way. `Err(Interrupted)` out of [`execute`](Self::execute) is
/// cancellation and is caught at the worker main loop; any other failure
/// mode of client code (a panic) is a fatal defect the engine does not
/// recover.
pub trait Operation: Send + Sync {
    /// Shared dispatch state backing this operation.
    fn core(&self) -> &OperationCore;

    /// Runs the procedure claimed under `procedure.index()`. Long bodies
    /// must checkpoint through `scheduler` at least once per small chunk.
    fn execute_procedure(
        &self,
        procedure: &mut Procedure,
        scheduler: &dyn Scheduler,
    ) -> Result<(), Interrupted>;

    /// Called by the device once per dispatch, after the previous operation
    /// has fully drained and before any worker starts pulling.
    fn prepare(&self, workers: &[Worker]) {
        self.core().reset(workers);
    }

    /// Claims and runs the next procedure.
    ///
    /// Returns `Ok(true)` while more work is immediately available;
    /// `Ok(false)` tells the calling worker to stop pulling and go idle.
    fn execute(&self, scheduler: &dyn Scheduler) -> Result<bool, Interrupted> {
        scheduler.check_schedule()?;
        let core = self.core();
        let Some(index) = core.claim() else {
            return Ok(false);
        };
        let mut procedure = Procedure::new(index);
        self.execute_procedure(&mut procedure, scheduler)?;
        core.complete_one();
        Ok(core.has_remaining())
    }

    /// Whether more work is immediately available without claiming any.
    ///
    /// Workers make a final check through this under their state lock
    /// before going idle, so work published concurrently with the idle
    /// transition is either seen here or handed to the worker once idle.
    fn has_more(&self) -> bool {
        self.core().has_remaining()
    }

    fn total_procedure_count(&self) -> u64 {
        self.core().total_procedures()
    }

    fn completed_procedure_count(&self) -> u64 {
        self.core().completed_procedures()
    }
}

/// Builds (or reuses) an operation sized to the live worker set at dispatch
/// time, e.g. to allocate per-worker scratch contexts.
pub trait OperationFactory {
    fn create_operation(&mut self, workers: &[Worker]) -> Arc<dyn Operation>;
}

/// Adapts a closure plus a procedure count into an [`Operation`].
pub struct ClosureOperation<F> {
    core: OperationCore,
    body: F,
}

impl<F> ClosureOperation<F>
where
    F: Fn(&mut Procedure, &dyn Scheduler) -> Result<(), Interrupted> + Send + Sync + 'static,
{
    pub fn new(total_procedures: u64, body: F) -> Self {
        Self {
            core: OperationCore::new(total_procedures),
            body,
        }
    }
}

impl<F> Operation for ClosureOperation<F>
where
    F: Fn(&mut Procedure, &dyn Scheduler) -> Result<(), Interrupted> + Send + Sync + 'static,
{
    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn execute_procedure(
        &self,
        procedure: &mut Procedure,
        scheduler: &dyn Scheduler,
    ) -> Result<(), Interrupted> {
        (self.body)(procedure, scheduler)
    }
}
