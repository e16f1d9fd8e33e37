use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::operation::{Operation, OperationFactory};
use crate::signal::SignalGate;
use crate::worker::{Worker, WorkerEvents, WorkerStatus};

/// The fixed worker pool and the orchestration API clients use.
///
/// Workers are created once at construction and reused across dispatches;
/// the population defaults to the hardware thread count. Dispatch is always
/// preemptive: an operation still running when the next one arrives is
/// aborted and drained first, so two operations never interleave on one
/// device.
pub struct Device {
    workers: Box<[Worker]>,
    shared: Arc<DeviceShared>,
    /// Serializes dispatches against each other. `await_idle` parks on the
    /// idle gate without it, so a blocked waiter never wedges the dispatch
    /// whose preemption would drain the pool.
    management: Mutex<()>,
    disposed: AtomicBool,
}

struct DeviceShared {
    running: AtomicUsize,
    idle_gate: SignalGate,
}

impl WorkerEvents for DeviceShared {
    fn on_run(&self, _id: u32) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    fn on_idle(&self, _id: u32) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle_gate.signal();
        }
    }
}

impl Device {
    /// Creates a device with one worker per hardware thread.
    pub fn new() -> Self {
        Self::with_population(num_cpus::get().max(1))
    }

    /// Creates a device with exactly `population` workers.
    pub fn with_population(population: usize) -> Self {
        assert!(population >= 1, "device population must be at least 1");
        let shared = Arc::new(DeviceShared {
            running: AtomicUsize::new(0),
            idle_gate: SignalGate::new(),
        });
        let workers = (0..population as u32)
            .map(|id| Worker::new(id, Arc::clone(&shared) as Arc<dyn WorkerEvents>))
            .collect();
        debug!("device created with population {population}");
        Self {
            workers,
            shared,
            management: Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn population(&self) -> usize {
        self.workers.len()
    }

    /// The worker handles of this device, in id order.
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Hands `operation` to every worker.
    ///
    /// Preemptive: a previous operation still running is aborted and drained
    /// to idle first. The operation is `prepare`d after the drain, then
    /// pulled by all workers at once.
    pub fn dispatch(&self, operation: Arc<dyn Operation>) {
        let _management = self.management.lock();
        if self.shared.running.load(Ordering::Acquire) != 0 {
            debug!("dispatch preempting a running operation");
            for worker in self.workers.iter() {
                worker.abort();
            }
            self.wait_for_drain();
        }

        operation.prepare(&self.workers);
        debug!(
            "dispatching {} procedures across {} workers",
            operation.total_procedure_count(),
            self.workers.len()
        );
        for worker in self.workers.iter() {
            worker.dispatch(Arc::clone(&operation));
        }
    }

    /// Builds an operation sized to the live worker set, then dispatches it.
    pub fn dispatch_with(&self, factory: &mut dyn OperationFactory) {
        let operation = factory.create_operation(&self.workers);
        self.dispatch(operation);
    }

    /// Requests a pause on every worker; honored at the next checkpoint.
    /// Non-blocking.
    pub fn pause(&self) {
        for worker in self.workers.iter() {
            worker.pause();
        }
    }

    /// Releases every paused worker. Non-blocking.
    pub fn resume(&self) {
        for worker in self.workers.iter() {
            worker.resume();
        }
    }

    /// Requests an abort on every worker; observed cooperatively at the next
    /// checkpoint. Non-blocking.
    pub fn abort(&self) {
        debug!("abort requested");
        for worker in self.workers.iter() {
            worker.abort();
        }
    }

    /// Blocks until every worker is idle, or returns immediately once the
    /// device is disposed.
    ///
    /// Safe to call concurrently with `dispatch`: the caller parks on the
    /// idle gate only and never holds the management lock, so a preemptive
    /// dispatch can always abort and drain the operation the caller is
    /// waiting out.
    pub fn await_idle(&self) {
        self.wait_for_drain();
    }

    fn wait_for_drain(&self) {
        loop {
            let observed = self.shared.idle_gate.observe();
            if self.shared.running.load(Ordering::Acquire) == 0 {
                return;
            }
            if !self.shared.idle_gate.wait_from(observed) {
                // Gate disabled during disposal; nothing left to wait for.
                return;
            }
        }
    }

    /// Snapshot read; true when no worker holds an operation.
    pub fn is_idle(&self) -> bool {
        self.shared.running.load(Ordering::Acquire) == 0
    }

    /// Copies each worker's status flag into `statuses`, truncated to its
    /// capacity. Best-effort introspection; returns the number written.
    pub fn fill_statuses(&self, statuses: &mut [WorkerStatus]) -> usize {
        let count = self.workers.len().min(statuses.len());
        for (slot, worker) in statuses.iter_mut().zip(self.workers.iter()) {
            *slot = worker.status();
        }
        count
    }

    /// Aborts whatever is running, releases blocked `await_idle` callers, and
    /// joins every worker thread. Disposing twice is a bug in the caller.
    pub fn dispose(&self) {
        assert!(
            !self.disposed.swap(true, Ordering::AcqRel),
            "device disposed twice"
        );
        self.dispose_inner();
    }

    fn dispose_inner(&self) {
        debug!("device disposing");
        for worker in self.workers.iter() {
            worker.abort();
        }
        // Release blocked await_idle callers deterministically before the
        // workers are joined.
        self.shared.idle_gate.set_enabled(false);
        for worker in self.workers.iter() {
            worker.dispose();
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.dispose_inner();
        }
    }
}
