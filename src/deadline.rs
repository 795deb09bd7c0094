//! Cancellable wall-clock deadline backing process timeouts.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A one-shot deadline armed on its own timer thread.
///
/// The thread parks until the deadline elapses or the deadline is
/// cancelled, then runs the expiry action at most once. Dropping the
/// handle cancels, so re-arming a process replaces its previous deadline
/// and an abandoned supervisor never fires a stale timer.
#[derive(Debug)]
pub(crate) struct Deadline {
    state: Arc<State>,
}

#[derive(Debug)]
struct State {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Deadline {
    /// Arms a deadline `after` from now. `on_expire` runs on the timer
    /// thread if the deadline is reached before cancellation.
    pub(crate) fn arm<F>(after: Duration, on_expire: F) -> std::io::Result<Deadline>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(State {
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        });
        let timer_state = Arc::clone(&state);

        std::thread::Builder::new()
            .name("deadline".to_string())
            .spawn(move || {
                let guard = timer_state
                    .cancelled
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let (guard, timeout) = timer_state
                    .wake
                    .wait_timeout_while(guard, after, |cancelled| !*cancelled)
                    .unwrap_or_else(PoisonError::into_inner);
                let fired = timeout.timed_out() && !*guard;
                drop(guard);
                if fired {
                    on_expire();
                }
            })?;

        Ok(Deadline { state })
    }

    /// Cancels the deadline. The expiry action will not run once this
    /// returns, unless it was already in progress on the timer thread.
    pub(crate) fn cancel(&self) {
        let mut cancelled = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.state.wake.notify_all();
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel();
    }
}
