use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::operation::Operation;
use crate::scheduler::{Interrupted, Scheduler};
use crate::signal::SignalGate;

/// Execution state of a worker. Exactly one flag at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// No operation assigned; the backing thread is parked (or not started).
    Idle,
    /// Pulling procedures from the current operation.
    Running,
    /// Pause requested; honored at the next checkpoint.
    Pausing,
    /// Parked inside a checkpoint until resumed or aborted.
    Awaiting,
    /// Abort requested; the next checkpoint raises [`Interrupted`].
    Aborting,
    /// Terminal; the backing thread has been joined.
    Disposed,
}

/// Notifications fired on each crossing between idle and busy, used by the
/// device for O(1) running-count bookkeeping instead of rescanning workers.
pub(crate) trait WorkerEvents: Send + Sync {
    fn on_run(&self, id: u32);
    fn on_idle(&self, id: u32);
}

struct WorkerState {
    status: WorkerStatus,
    operation: Option<Arc<dyn Operation>>,
}

struct WorkerShared {
    id: u32,
    state: Mutex<WorkerState>,
    transition: Condvar,
    gate: SignalGate,
    events: Arc<dyn WorkerEvents>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// One pool thread plus its state machine. Cheap cloneable handle; clones
/// share the same underlying worker.
///
/// Created once at device construction and reused across dispatches. The
/// backing OS thread starts lazily on the first dispatch and lives until
/// disposal.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl Worker {
    pub(crate) fn new(id: u32, events: Arc<dyn WorkerEvents>) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                id,
                state: Mutex::new(WorkerState {
                    status: WorkerStatus::Idle,
                    operation: None,
                }),
                transition: Condvar::new(),
                gate: SignalGate::new(),
                events,
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.state.lock().status
    }

    /// Assigns an operation to this worker. Fails fast when the worker is
    /// not idle; work is never queued behind a busy worker.
    pub(crate) fn dispatch(&self, operation: Arc<dyn Operation>) {
        let mut state = self.shared.state.lock();
        assert!(
            state.status == WorkerStatus::Idle,
            "worker {} dispatched while {:?}",
            self.shared.id,
            state.status
        );
        state.status = WorkerStatus::Running;
        state.operation = Some(operation);
        self.shared.events.on_run(self.shared.id);
        drop(state);

        self.ensure_thread();
        self.shared.gate.signal();
    }

    /// Re-engages this worker with `operation` if it is idle. Used by the
    /// compute layer to wake drained workers when new callbacks arrive
    /// mid-dispatch. Returns whether the worker was engaged.
    pub(crate) fn offer(&self, operation: Arc<dyn Operation>) -> bool {
        let mut state = self.shared.state.lock();
        if state.status != WorkerStatus::Idle {
            return false;
        }
        state.status = WorkerStatus::Running;
        state.operation = Some(operation);
        self.shared.events.on_run(self.shared.id);
        drop(state);

        self.ensure_thread();
        self.shared.gate.signal();
        true
    }

    /// Requests a pause, honored at the next checkpoint. No-op unless
    /// running.
    pub(crate) fn pause(&self) {
        let mut state = self.shared.state.lock();
        if state.status == WorkerStatus::Running {
            state.status = WorkerStatus::Pausing;
            trace!("worker {} pausing", self.shared.id);
        }
    }

    /// Releases a paused worker back to running.
    pub(crate) fn resume(&self) {
        let mut state = self.shared.state.lock();
        if matches!(
            state.status,
            WorkerStatus::Pausing | WorkerStatus::Awaiting
        ) {
            state.status = WorkerStatus::Running;
            self.shared.transition.notify_all();
            trace!("worker {} resumed", self.shared.id);
        }
    }

    /// Requests an abort, observed at the next checkpoint (or loop
    /// iteration). A callback that never checks in cannot be killed.
    pub(crate) fn abort(&self) {
        let mut state = self.shared.state.lock();
        if matches!(
            state.status,
            WorkerStatus::Running | WorkerStatus::Pausing | WorkerStatus::Awaiting
        ) {
            state.status = WorkerStatus::Aborting;
            self.shared.transition.notify_all();
            trace!("worker {} aborting", self.shared.id);
        }
    }

    /// Aborts, waits for idle, then permanently retires the worker and joins
    /// its thread. Terminal.
    pub(crate) fn dispose(&self) {
        self.abort();
        {
            let mut state = self.shared.state.lock();
            assert!(
                state.status != WorkerStatus::Disposed,
                "worker {} disposed twice",
                self.shared.id
            );
            while state.status != WorkerStatus::Idle {
                self.shared.transition.wait(&mut state);
            }
            state.status = WorkerStatus::Disposed;
        }
        self.shared.gate.set_enabled(false);

        let thread = self.shared.thread.lock().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        trace!("worker {} disposed", self.shared.id);
    }

    fn ensure_thread(&self) {
        let mut slot = self.shared.thread.lock();
        if slot.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("helios-worker-{}", self.shared.id))
            .spawn(move || worker_main(shared))
            .expect("failed to spawn worker thread");
        *slot = Some(thread);
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

fn worker_main(shared: Arc<WorkerShared>) {
    loop {
        let observed = shared.gate.observe();
        let operation = {
            let state = shared.state.lock();
            if state.status == WorkerStatus::Disposed {
                break;
            }
            state.operation.clone()
        };
        let Some(operation) = operation else {
            if !shared.gate.wait_from(observed) {
                break;
            }
            continue;
        };

        let checkpoint = WorkerCheckpoint { shared: &shared };
        loop {
            match operation.execute(&checkpoint) {
                Ok(true) => {
                    let state = shared.state.lock();
                    // Pausing stays in the loop; the checkpoint parks it.
                    if !matches!(
                        state.status,
                        WorkerStatus::Running | WorkerStatus::Pausing
                    ) {
                        drop(state);
                        go_idle(&shared);
                        break;
                    }
                }
                Ok(false) => {
                    // Work published after the empty answer but before the
                    // idle transition would find this worker busy and skip
                    // it, so re-check under the lock that publishes Idle.
                    let mut state = shared.state.lock();
                    if state.status == WorkerStatus::Running && operation.has_more() {
                        continue;
                    }
                    state.operation = None;
                    state.status = WorkerStatus::Idle;
                    shared.transition.notify_all();
                    shared.events.on_idle(shared.id);
                    break;
                }
                Err(Interrupted) => {
                    trace!("worker {} interrupted", shared.id);
                    go_idle(&shared);
                    break;
                }
            }
        }
    }
}

fn go_idle(shared: &WorkerShared) {
    let mut state = shared.state.lock();
    state.operation = None;
    state.status = WorkerStatus::Idle;
    shared.transition.notify_all();
    // Fired under the state lock so the idle crossing is ordered with the
    // run crossing of any concurrent re-dispatch.
    shared.events.on_idle(shared.id);
}

struct WorkerCheckpoint<'a> {
    shared: &'a Arc<WorkerShared>,
}

impl Scheduler for WorkerCheckpoint<'_> {
    fn id(&self) -> u32 {
        self.shared.id
    }

    fn check_schedule(&self) -> Result<(), Interrupted> {
        let mut state = self.shared.state.lock();
        loop {
            match state.status {
                WorkerStatus::Running => return Ok(()),
                WorkerStatus::Pausing => {
                    state.status = WorkerStatus::Awaiting;
                    self.shared.transition.notify_all();
                    while state.status == WorkerStatus::Awaiting {
                        self.shared.transition.wait(&mut state);
                    }
                }
                WorkerStatus::Aborting => return Err(Interrupted),
                // A worker checkpointing in any other state has already been
                // retired out from under its callback; unwind as an abort.
                WorkerStatus::Idle | WorkerStatus::Awaiting | WorkerStatus::Disposed => {
                    return Err(Interrupted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ClosureOperation, Operation};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct CountingEvents {
        runs: AtomicUsize,
        idles: AtomicUsize,
    }

    impl CountingEvents {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                idles: AtomicUsize::new(0),
            })
        }
    }

    impl WorkerEvents for CountingEvents {
        fn on_run(&self, _id: u32) {
            self.runs.fetch_add(1, Ordering::AcqRel);
        }

        fn on_idle(&self, _id: u32) {
            self.idles.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() {
            assert!(start.elapsed() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn runs_an_operation_to_completion() {
        let events = CountingEvents::new();
        let worker = Worker::new(0, events.clone());
        let executed = Arc::new(AtomicUsize::new(0));

        let operation = Arc::new(ClosureOperation::new(64, {
            let executed = Arc::clone(&executed);
            move |_, _| {
                executed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }));
        operation.prepare(&[worker.clone()]);
        worker.dispatch(operation);

        wait_until(Duration::from_secs(5), || {
            worker.status() == WorkerStatus::Idle
        });
        assert_eq!(executed.load(Ordering::Relaxed), 64);
        assert_eq!(events.runs.load(Ordering::Relaxed), 1);
        assert_eq!(events.idles.load(Ordering::Relaxed), 1);

        worker.dispose();
        assert_eq!(worker.status(), WorkerStatus::Disposed);
    }

    #[test]
    fn pause_parks_at_the_checkpoint_until_resumed() {
        let worker = Worker::new(1, CountingEvents::new());
        let executed = Arc::new(AtomicUsize::new(0));

        // Effectively endless, so the pause always lands mid-flight.
        let operation = Arc::new(ClosureOperation::new(u64::MAX, {
            let executed = Arc::clone(&executed);
            move |_, scheduler| {
                scheduler.check_schedule()?;
                executed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }));
        operation.prepare(&[worker.clone()]);
        worker.dispatch(operation.clone());

        wait_until(Duration::from_secs(5), || {
            executed.load(Ordering::Relaxed) > 0
        });
        worker.pause();
        wait_until(Duration::from_secs(5), || {
            worker.status() == WorkerStatus::Awaiting
        });

        // Parked: no further procedures complete.
        let parked_at = executed.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(executed.load(Ordering::Relaxed), parked_at);

        worker.resume();
        wait_until(Duration::from_secs(5), || {
            executed.load(Ordering::Relaxed) > parked_at
        });

        worker.abort();
        wait_until(Duration::from_secs(5), || {
            worker.status() == WorkerStatus::Idle
        });
        worker.dispose();
    }

    #[test]
    fn abort_interrupts_a_parked_worker() {
        let worker = Worker::new(2, CountingEvents::new());
        let operation = Arc::new(ClosureOperation::new(u64::MAX, |_, scheduler| {
            scheduler.check_schedule()?;
            Ok(())
        }));
        operation.prepare(&[worker.clone()]);
        worker.dispatch(operation.clone());

        worker.pause();
        wait_until(Duration::from_secs(5), || {
            worker.status() == WorkerStatus::Awaiting
        });
        worker.abort();
        wait_until(Duration::from_secs(5), || {
            worker.status() == WorkerStatus::Idle
        });
        assert!(operation.completed_procedure_count() <= operation.total_procedure_count());
        worker.dispose();
    }

    #[test]
    #[should_panic(expected = "dispatched while")]
    fn dispatching_a_busy_worker_fails_fast() {
        let worker = Worker::new(3, CountingEvents::new());
        let blocked = Arc::new(AtomicUsize::new(0));

        let slow = Arc::new(ClosureOperation::new(1, {
            let blocked = Arc::clone(&blocked);
            move |_, _| {
                blocked.store(1, Ordering::Release);
                thread::sleep(Duration::from_millis(200));
                Ok(())
            }
        }));
        slow.prepare(&[worker.clone()]);
        worker.dispatch(slow);
        while blocked.load(Ordering::Acquire) == 0 {
            thread::yield_now();
        }

        let second = Arc::new(ClosureOperation::new(1, |_, _| Ok(())));
        second.prepare(&[worker.clone()]);
        worker.dispatch(second);
    }

    #[test]
    fn dispose_joins_a_never_started_worker() {
        let worker = Worker::new(4, CountingEvents::new());
        worker.dispose();
        assert_eq!(worker.status(), WorkerStatus::Disposed);
    }
}
