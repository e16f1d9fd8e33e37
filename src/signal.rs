use parking_lot::{Condvar, Mutex};

/// Boolean-gated broadcast primitive used to park worker threads and
/// `await_idle` callers.
///
/// A signal wakes every thread currently blocked in [`wait`](Self::wait)
/// without latching any state; disabling the gate wakes all waiters
/// permanently so no thread can park across a shutdown.
///
/// Checking a predicate and then waiting leaves a window where a signal can
/// slip by unobserved. [`observe`](Self::observe) and
/// [`wait_from`](Self::wait_from) close it: snapshot the generation first,
/// check the predicate, then wait only while the generation is unchanged.
pub struct SignalGate {
    state: Mutex<GateState>,
    released: Condvar,
}

struct GateState {
    enabled: bool,
    generation: u64,
}

impl SignalGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                enabled: true,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Snapshot of the current signal generation.
    pub fn observe(&self) -> u64 {
        self.state.lock().generation
    }

    /// Blocks until a signal arrives after `observed` was taken.
    ///
    /// Returns `false` without blocking when the gate is disabled, `true`
    /// once released by a signal (including signals that landed between the
    /// `observe` call and this one).
    pub fn wait_from(&self, observed: u64) -> bool {
        let mut state = self.state.lock();
        loop {
            if !state.enabled {
                return false;
            }
            if state.generation != observed {
                return true;
            }
            self.released.wait(&mut state);
        }
    }

    /// Blocks until the next signal or until the gate is disabled.
    pub fn wait(&self) -> bool {
        self.wait_from(self.observe())
    }

    /// Wakes all current waiters. The enabled flag is unchanged.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        self.released.notify_all();
    }

    /// Enables or disables the gate. Disabling wakes all waiters and makes
    /// every subsequent wait return immediately.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.enabled = enabled;
        if !enabled {
            self.released.notify_all();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }
}

impl Default for SignalGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn disabled_gate_releases_immediately() {
        let gate = SignalGate::new();
        gate.set_enabled(false);
        assert!(!gate.wait());
        assert!(!gate.wait_from(gate.observe()));
    }

    #[test]
    fn signal_wakes_all_waiters() {
        let gate = Arc::new(SignalGate::new());
        let released = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let released = Arc::clone(&released);
                thread::spawn(move || {
                    assert!(gate.wait());
                    released.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        // Give the waiters time to park before broadcasting.
        thread::sleep(Duration::from_millis(50));
        gate.signal();

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(released.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn observed_generation_catches_early_signal() {
        let gate = SignalGate::new();
        let observed = gate.observe();
        gate.signal();
        // The signal landed before the wait; the snapshot must still see it.
        let start = Instant::now();
        assert!(gate.wait_from(observed));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn disable_releases_parked_waiter() {
        let gate = Arc::new(SignalGate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(50));
        gate.set_enabled(false);
        assert!(!waiter.join().unwrap());
    }
}
