//! Cooperative compute-task layer on top of the worker pool.
//!
//! An [`AsyncComputeOperation`] hosts a single driver future written as
//! ordinary sequential code. The driver forks work back onto the pool
//! through its [`ComputeScope`] and awaits the returned [`ComputeTask`]s;
//! while a task is outstanding the driver suspends and its worker thread
//! goes back to pulling scheduled callbacks, so a logical thread of control
//! may hop across worker threads between awaits.
//!
//! The driver must only await [`ComputeTask`]s of its own operation (or
//! futures that resolve without external wakeups); awaiting a foreign
//! future would suspend the driver with no worker left to resume it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};

use crossbeam_queue::SegQueue;
use log::trace;
use parking_lot::Mutex;

use crate::operation::{Operation, OperationCore, Procedure};
use crate::scheduler::{Interrupted, Scheduler};
use crate::worker::Worker;

type DriverFuture = Pin<Box<dyn Future<Output = Result<(), Interrupted>> + Send>>;

/// An [`Operation`] that runs a driver future and the callbacks it forks.
///
/// Workers executing the operation first drain scheduled callbacks, then
/// poll the driver once it has been woken. Every scheduled invocation is
/// accounted as a virtual procedure in the operation's progress counters.
/// One dispatch per instance; the driver is consumed when it completes.
pub struct AsyncComputeOperation {
    core: Arc<OperationCore>,
    shared: Arc<ComputeShared>,
    /// Exclusive driver slot; a `try_lock` loser hands its wakeup back
    /// instead of blocking a worker behind another poll.
    driver: Mutex<Option<DriverFuture>>,
}

impl AsyncComputeOperation {
    /// Builds the operation around `driver`, handing it the scope used to
    /// fork work back onto the pool.
    pub fn new<F, Fut>(driver: F) -> Arc<Self>
    where
        F: FnOnce(ComputeScope) -> Fut,
        Fut: Future<Output = Result<(), Interrupted>> + Send + 'static,
    {
        Arc::new_cyclic(|operation| {
            let core = Arc::new(OperationCore::new(0));
            let shared = Arc::new(ComputeShared {
                operation: operation.clone(),
                core: Arc::clone(&core),
                calls: SegQueue::new(),
                driver_ready: AtomicBool::new(true),
                finished: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
            });
            let scope = ComputeScope {
                shared: Arc::clone(&shared),
            };
            let future: DriverFuture = Box::pin(driver(scope));
            Self {
                core,
                shared,
                driver: Mutex::new(Some(future)),
            }
        })
    }

    /// Scope handle for scheduling work from outside the driver.
    pub fn scope(&self) -> ComputeScope {
        ComputeScope {
            shared: Arc::clone(&self.shared),
        }
    }

    fn poll_driver(&self, wake_with: &Arc<ComputeShared>) -> Result<bool, Interrupted> {
        // A competing poller holds the slot; hand the wakeup back so the
        // poll is retried once the slot frees up.
        let Some(mut slot) = self.driver.try_lock() else {
            self.shared.driver_ready.store(true, Ordering::Release);
            return Ok(true);
        };
        let Some(future) = slot.as_mut() else {
            return Ok(false);
        };

        let waker = Waker::from(Arc::new(DriverWaker {
            shared: Arc::clone(wake_with),
        }));
        let mut context = Context::from_waker(&waker);
        match future.as_mut().poll(&mut context) {
            Poll::Ready(outcome) => {
                *slot = None;
                self.shared.finished.store(true, Ordering::Release);
                trace!("compute driver finished");
                outcome.map(|()| false)
            }
            Poll::Pending => Ok(true),
        }
    }
}

impl Operation for AsyncComputeOperation {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn execute_procedure(
        &self,
        _procedure: &mut Procedure,
        _scheduler: &dyn Scheduler,
    ) -> Result<(), Interrupted> {
        unreachable!("compute operations claim work through their call queue")
    }

    fn prepare(&self, workers: &[Worker]) {
        self.core.reset(workers);
        self.shared.driver_ready.store(true, Ordering::Release);
    }

    // Counts queued calls unconditionally: a call that raced the driver's
    // completion must still be picked up by the re-checking worker rather
    // than stranded behind the finished flag.
    fn has_more(&self) -> bool {
        !self.shared.calls.is_empty() || self.shared.has_work()
    }

    fn execute(&self, scheduler: &dyn Scheduler) -> Result<bool, Interrupted> {
        if let Err(interrupted) = scheduler.check_schedule() {
            self.shared.fail_pending();
            if let Some(mut slot) = self.driver.try_lock() {
                *slot = None;
            }
            return Err(interrupted);
        }

        if let Some(call) = self.shared.calls.pop() {
            let _ = self.core.claim();
            match call.run(scheduler) {
                Ok(()) => {
                    self.core.complete_one();
                    return Ok(self.shared.has_work());
                }
                Err(interrupted) => {
                    self.shared.fail_pending();
                    return Err(interrupted);
                }
            }
        }

        if self.shared.driver_ready.swap(false, Ordering::AcqRel) {
            let more = self.poll_driver(&self.shared)?;
            if !more {
                return Ok(false);
            }
        }

        Ok(self.shared.has_work())
    }
}

struct ComputeShared {
    operation: std::sync::Weak<AsyncComputeOperation>,
    core: Arc<OperationCore>,
    calls: SegQueue<Box<dyn ScheduledCall>>,
    /// Set when the driver needs a poll; consumed by the worker that polls.
    driver_ready: AtomicBool,
    finished: AtomicBool,
    aborted: AtomicBool,
}

impl ComputeShared {
    fn is_retired(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.aborted.load(Ordering::Acquire)
    }

    fn has_work(&self) -> bool {
        if self.is_retired() {
            return false;
        }
        !self.calls.is_empty() || self.driver_ready.load(Ordering::Acquire)
    }

    /// Wakes idle workers of the dispatch snapshot so freshly scheduled
    /// callbacks (or a runnable driver) are picked up again.
    fn kick(&self) {
        if self.is_retired() {
            // A call pushed after the operation retired has no worker left
            // to claim it; fail it here instead of leaving it queued.
            self.drain_pending();
            return;
        }
        let Some(operation) = self.operation.upgrade() else {
            return;
        };
        for worker in self.core.workers().iter() {
            worker.offer(Arc::clone(&operation) as Arc<dyn Operation>);
        }
    }

    fn wake_driver(&self) {
        self.driver_ready.store(true, Ordering::Release);
        self.kick();
    }

    fn drain_pending(&self) {
        while let Some(call) = self.calls.pop() {
            call.cancel();
        }
    }

    /// Marks the operation aborted and fails every callback still queued,
    /// so pending awaits resolve to `Err(Interrupted)` instead of hanging.
    fn fail_pending(&self) {
        self.aborted.store(true, Ordering::Release);
        self.drain_pending();
    }
}

struct DriverWaker {
    shared: Arc<ComputeShared>,
}

impl Wake for DriverWaker {
    fn wake(self: Arc<Self>) {
        self.shared.wake_driver();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.wake_driver();
    }
}

/// Handle used by a driver (or monitoring code) to fork callbacks onto the
/// pool of the owning operation.
#[derive(Clone)]
pub struct ComputeScope {
    shared: Arc<ComputeShared>,
}

impl ComputeScope {
    /// Enqueues one callback for execution by some worker.
    ///
    /// The returned task completes with the callback's value once that
    /// invocation finishes. The callback receives the executing worker's
    /// checkpoint and may propagate its cancellation with `?`. Scheduling
    /// onto an operation whose driver has already finished (or that was
    /// aborted) fails the task with `Err(Interrupted)` instead of queuing
    /// work no worker will ever claim.
    pub fn schedule<T, F>(&self, action: F) -> ComputeTask<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Scheduler) -> Result<T, Interrupted> + Send + 'static,
    {
        let state = Arc::new(TaskState::new(1));
        if self.shared.is_retired() {
            state.finish_one(Err(Interrupted));
        } else {
            self.shared.core.add_procedures(1);
            self.shared.calls.push(Box::new(SingleCall {
                action,
                state: Arc::clone(&state),
            }));
            self.shared.kick();
        }
        ComputeTask {
            state,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fork-join: enqueues `count` independent invocations of `action`,
    /// distributed dynamically across the pool one claim at a time.
    ///
    /// `action` receives the invocation index in `0..count`. The returned
    /// task completes only once all `count` invocations finish; invocation
    /// order and completion order across workers are unspecified.
    pub fn schedule_many<F>(&self, count: u64, action: F) -> ComputeTask<()>
    where
        F: Fn(u64, &dyn Scheduler) -> Result<(), Interrupted> + Send + Sync + 'static,
    {
        let state = Arc::new(TaskState::new(count));
        if count == 0 {
            state.lock.lock().result = Some(Ok(()));
        } else if self.shared.is_retired() {
            let mut progress = state.lock.lock();
            progress.remaining = 0;
            progress.result = Some(Err(Interrupted));
        } else {
            let action = Arc::new(action);
            self.shared.core.add_procedures(count);
            for index in 0..count {
                self.shared.calls.push(Box::new(ForkCall {
                    index,
                    action: Arc::clone(&action),
                    state: Arc::clone(&state),
                }));
            }
            self.shared.kick();
        }
        ComputeTask {
            state,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn total_procedure_count(&self) -> u64 {
        self.shared.core.total_procedures()
    }

    pub fn completed_procedure_count(&self) -> u64 {
        self.shared.core.completed_procedures()
    }
}

trait ScheduledCall: Send {
    fn run(self: Box<Self>, scheduler: &dyn Scheduler) -> Result<(), Interrupted>;
    fn cancel(self: Box<Self>);
}

struct SingleCall<T, F> {
    action: F,
    state: Arc<TaskState<T>>,
}

impl<T, F> ScheduledCall for SingleCall<T, F>
where
    T: Send,
    F: FnOnce(&dyn Scheduler) -> Result<T, Interrupted> + Send,
{
    fn run(self: Box<Self>, scheduler: &dyn Scheduler) -> Result<(), Interrupted> {
        let SingleCall { action, state } = *self;
        let outcome = action(scheduler);
        let propagate = outcome.as_ref().err().copied();
        state.finish_one(outcome);
        match propagate {
            Some(interrupted) => Err(interrupted),
            None => Ok(()),
        }
    }

    fn cancel(self: Box<Self>) {
        self.state.finish_one(Err(Interrupted));
    }
}

struct ForkCall<F> {
    index: u64,
    action: Arc<F>,
    state: Arc<TaskState<()>>,
}

impl<F> ScheduledCall for ForkCall<F>
where
    F: Fn(u64, &dyn Scheduler) -> Result<(), Interrupted> + Send + Sync,
{
    fn run(self: Box<Self>, scheduler: &dyn Scheduler) -> Result<(), Interrupted> {
        let outcome = (self.action)(self.index, scheduler);
        self.state.finish_one(outcome);
        outcome
    }

    fn cancel(self: Box<Self>) {
        self.state.finish_one(Err(Interrupted));
    }
}

struct TaskState<T> {
    lock: Mutex<TaskProgress<T>>,
}

struct TaskProgress<T> {
    remaining: u64,
    result: Option<Result<T, Interrupted>>,
    waker: Option<Waker>,
}

impl<T> TaskState<T> {
    fn new(remaining: u64) -> Self {
        Self {
            lock: Mutex::new(TaskProgress {
                remaining,
                result: None,
                waker: None,
            }),
        }
    }

    /// Records one finished invocation. The first value wins; an error
    /// overrides any value and the first error sticks.
    fn finish_one(&self, outcome: Result<T, Interrupted>) {
        let mut progress = self.lock.lock();
        match outcome {
            Ok(value) => {
                if progress.result.is_none() {
                    progress.result = Some(Ok(value));
                }
            }
            Err(interrupted) => {
                if !matches!(progress.result, Some(Err(_))) {
                    progress.result = Some(Err(interrupted));
                }
            }
        }
        progress.remaining = progress.remaining.saturating_sub(1);
        if progress.remaining == 0 {
            let waker = progress.waker.take();
            drop(progress);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

/// Awaitable handle correlating a scheduled callback (or fork-join batch)
/// with the continuation that resumes on its completion.
///
/// Tasks may be awaited in any order and complete out of order; each
/// preserves its captured state exactly, since it is logically single-owner
/// until resumed. Once the owning operation aborts, every outstanding poll
/// resolves to `Err(Interrupted)`.
pub struct ComputeTask<T> {
    state: Arc<TaskState<T>>,
    shared: Arc<ComputeShared>,
}

impl<T> ComputeTask<T> {
    /// True once the callback (or whole batch) has finished.
    pub fn is_finished(&self) -> bool {
        self.state.lock.lock().remaining == 0
    }
}

impl<T: Send> Future for ComputeTask<T> {
    type Output = Result<T, Interrupted>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut progress = self.state.lock.lock();
        if progress.remaining == 0 {
            if let Some(result) = progress.result.take() {
                return Poll::Ready(result);
            }
            // Every completion path records a result before the count hits
            // zero; reaching here means the task was already consumed.
            return Poll::Ready(Err(Interrupted));
        }
        if self.shared.aborted.load(Ordering::Acquire) {
            return Poll::Ready(Err(Interrupted));
        }
        progress.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::task::{RawWaker, RawWakerVTable};

    fn noop_waker() -> Waker {
        unsafe fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        unsafe fn wake(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake, wake);
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }

    struct FreeRunner;

    impl Scheduler for FreeRunner {
        fn id(&self) -> u32 {
            0
        }

        fn check_schedule(&self) -> Result<(), Interrupted> {
            Ok(())
        }
    }

    fn poll_once<T: Send>(task: &mut ComputeTask<T>) -> Poll<Result<T, Interrupted>> {
        let waker = noop_waker();
        let mut context = Context::from_waker(&waker);
        Pin::new(task).poll(&mut context)
    }

    #[test]
    fn empty_fork_join_completes_immediately() {
        let operation = AsyncComputeOperation::new(|_| async { Ok(()) });
        let mut task = operation.scope().schedule_many(0, |_, _| Ok(()));
        assert!(task.is_finished());
        assert_eq!(poll_once(&mut task), Poll::Ready(Ok(())));
    }

    #[test]
    fn scheduled_callback_carries_its_value() {
        let operation = AsyncComputeOperation::new(|_| async { Ok(()) });
        operation.prepare(&[]);
        let mut task = operation.scope().schedule(|_| Ok(42u32));
        assert!(!task.is_finished());

        // Drive the queue by hand; no worker threads involved.
        while operation.execute(&FreeRunner).unwrap() {}
        assert!(task.is_finished());
        assert_eq!(poll_once(&mut task), Poll::Ready(Ok(42)));
    }

    #[test]
    fn fork_join_counts_every_invocation() {
        let operation = AsyncComputeOperation::new(|_| async { Ok(()) });
        operation.prepare(&[]);
        let counter = Arc::new(AtomicU64::new(0));
        let mut task = operation.scope().schedule_many(25, {
            let counter = Arc::clone(&counter);
            move |_, _| {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });

        while operation.execute(&FreeRunner).unwrap() {}
        assert_eq!(counter.load(Ordering::Relaxed), 25);
        assert_eq!(poll_once(&mut task), Poll::Ready(Ok(())));
        assert_eq!(operation.completed_procedure_count(), 25);
        assert_eq!(operation.total_procedure_count(), 25);
    }

    #[test]
    fn scheduling_after_the_driver_finishes_fails_fast() {
        let operation = AsyncComputeOperation::new(|_| async { Ok(()) });
        operation.prepare(&[]);
        while operation.execute(&FreeRunner).unwrap() {}

        let mut task = operation.scope().schedule(|_| Ok(7u32));
        assert!(task.is_finished());
        assert_eq!(poll_once(&mut task), Poll::Ready(Err(Interrupted)));

        let mut batch = operation.scope().schedule_many(3, |_, _| Ok(()));
        assert_eq!(poll_once(&mut batch), Poll::Ready(Err(Interrupted)));
        // Nothing was queued behind the finished driver.
        assert!(!operation.has_more());
    }

    #[test]
    fn aborted_operation_fails_pending_awaits() {
        struct AbortingRunner;

        impl Scheduler for AbortingRunner {
            fn id(&self) -> u32 {
                0
            }

            fn check_schedule(&self) -> Result<(), Interrupted> {
                Err(Interrupted)
            }
        }

        let operation = AsyncComputeOperation::new(|_| async { Ok(()) });
        operation.prepare(&[]);
        let mut task = operation.scope().schedule(|_| Ok(1u32));

        assert_eq!(operation.execute(&AbortingRunner), Err(Interrupted));
        assert_eq!(poll_once(&mut task), Poll::Ready(Err(Interrupted)));
    }
}
