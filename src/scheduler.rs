use thiserror::Error;

/// Cancellation signal raised at a checkpoint while the owning worker is
/// aborting. Always caught at the worker main loop; it never surfaces as a
/// client-visible error of the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution interrupted by an abort request")]
pub struct Interrupted;

/// Cooperation contract between a long-running procedure and the worker
/// executing it.
///
/// Implemented by the worker; a procedure body must call
/// [`check_schedule`](Self::check_schedule) at least once per reasonably
/// small chunk of work (one scanline, one row of a tile) so that pause and
/// abort requests are honored promptly. Callback code between checkpoints is
/// never preempted.
pub trait Scheduler {
    /// Stable identifier of the calling execution context.
    ///
    /// Exactly one live worker owns a given id at a time, so client code may
    /// use it to index per-worker resources (RNG streams, scratch
    /// allocators) without extra locking.
    fn id(&self) -> u32;

    /// No-op while running. While pausing, parks the worker in `Awaiting`
    /// until resumed or aborted. Returns `Err(Interrupted)` once the worker
    /// is aborting; the caller propagates it with `?`.
    fn check_schedule(&self) -> Result<(), Interrupted>;
}
