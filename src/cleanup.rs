//! Process-wide guarantee that no supervised process outlives the harness.
//!
//! Every spawned child is recorded in a registry that is drained exactly
//! once by whichever exit path fires first: normal program termination
//! (`atexit`, which a panic unwinding off the top of the stack also
//! reaches) or a terminating signal delivered to the harness itself (a
//! panic compiled to abort arrives as SIGABRT). A panic caught by
//! `catch_unwind` is recoverable and drains nothing. The drain sends
//! each still-live child the cooperative quit signal and waits for it to
//! go away.
//!
//! The registry is a fixed-size table of atomic pid slots guarded by an
//! atomic one-shot flag, never a lock: the signal-path drain runs inside
//! a handler and is restricted to async-signal-safe operations (atomics,
//! `kill`, `waitpid`, `sigaction`, `raise`).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Once;
use std::time::Duration;

use nix::sys::signal::{
    kill, raise, sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow,
    Signal,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use tracing::info;

/// The cooperative shutdown signal supervised processes must honor.
///
/// A collaborator receiving it is expected to flush, release exclusive
/// resources, and exit within [`QUIT_WAIT`]; only an unresponsive
/// process is escalated to SIGKILL.
pub const QUIT_SIGNAL: Signal = Signal::SIGQUIT;

/// Cooperative exit window granted after [`QUIT_SIGNAL`].
pub const QUIT_WAIT: Duration = Duration::from_secs(10);

const QUIT_POLL: Duration = Duration::from_millis(50);

/// Upper bound on concurrently supervised processes. Fixed so the
/// signal-path drain can walk the table without allocating or locking.
pub(crate) const REGISTRY_CAPACITY: usize = 128;

/// Harness-terminating signals that trigger the drain. SIGINT is
/// included: an interrupted harness must not leak its simulator.
const FATAL_SIGNALS: [Signal; 5] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGABRT,
    Signal::SIGTERM,
];

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static HOOKS: Once = Once::new();

/// Registers a live child. Returns the slot to release on reap, or
/// `None` when the table is full (the caller must not leave the child
/// unsupervised).
pub(crate) fn register(pid: Pid) -> Option<usize> {
    // Force the registry into existence before any hook can observe it.
    let registry = &*REGISTRY;
    HOOKS.call_once(install_hooks);
    registry.register(pid)
}

/// Clears a slot once the supervisor has reaped its child.
pub(crate) fn release(slot: usize, pid: Pid) {
    REGISTRY.release(slot, pid);
}

/// Ends every still-live supervised process now.
///
/// Returns how many processes were live and got the quit signal. The
/// drain is one-shot for the life of the harness process: the first
/// invocation from any path wins and every later one is a no-op
/// returning 0.
pub fn drain_now() -> usize {
    let registry = &*REGISTRY;
    if registry.is_drained() {
        return 0;
    }
    info!("running supervised-process cleanup");
    let ended = registry.drain(true);
    if ended > 0 {
        info!(ended, "cleanup ended live processes");
    }
    ended
}

struct Registry {
    slots: [AtomicI32; REGISTRY_CAPACITY],
    drained: AtomicBool,
}

impl Registry {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicI32::new(0)),
            drained: AtomicBool::new(false),
        }
    }

    fn register(&self, pid: Pid) -> Option<usize> {
        let raw = pid.as_raw();
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(0, raw, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(idx);
            }
        }
        None
    }

    fn release(&self, slot: usize, pid: Pid) {
        // CAS so a drain that already claimed the slot is not clobbered.
        let _ = self.slots[slot].compare_exchange(
            pid.as_raw(),
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    /// One-shot drain. Concurrent invocations race on the flag; the
    /// loser returns immediately. Each slot is claimed with a swap so a
    /// pid can never be handled twice. `log` must be false on the
    /// signal path, where only async-signal-safe calls are allowed.
    fn drain(&self, log: bool) -> usize {
        if self.drained.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let mut ended = 0;
        for slot in &self.slots {
            let raw = slot.swap(0, Ordering::SeqCst);
            if raw <= 0 {
                continue;
            }
            if log {
                info!(pid = raw, "ending supervised process");
            }
            if end_process(Pid::from_raw(raw)) {
                ended += 1;
            }
        }
        ended
    }
}

/// Cooperatively ends one child. Returns false when the process was
/// already gone (exited, reaped elsewhere, or never ours); such entries
/// are skipped without error.
fn end_process(pid: Pid) -> bool {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => {}
        _ => return false,
    }
    let _ = kill(pid, QUIT_SIGNAL);
    let mut waited = Duration::ZERO;
    while waited < QUIT_WAIT {
        std::thread::sleep(QUIT_POLL);
        waited += QUIT_POLL;
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            _ => return true,
        }
    }
    // Unresponsive past the cooperative window.
    let _ = kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
    true
}

fn install_hooks() {
    // Normal termination. An uncaught unwinding panic ends here too,
    // via the runtime's exit; an aborting panic arrives as SIGABRT
    // below. There is no panic hook: one would also fire for panics
    // the program catches and recovers from.
    // SAFETY: the callback is an extern "C" fn using ordinary (non-signal
    // context) operations.
    unsafe {
        libc::atexit(at_exit_drain);
    }

    // Terminating signals aimed at the harness itself. They are held
    // back while the handlers go in, so none can fire before its prior
    // disposition has been recorded.
    let mut fatal = SigSet::empty();
    for sig in FATAL_SIGNALS {
        fatal.add(sig);
    }
    let mut prior_mask = SigSet::empty();
    let _ = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&fatal), Some(&mut prior_mask));
    for sig in FATAL_SIGNALS {
        // SAFETY: the handler is restricted to async-signal-safe calls.
        unsafe {
            hook_fatal_signal(sig);
        }
    }
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&prior_mask), None);
}

extern "C" fn at_exit_drain() {
    drain_now();
}

const SIGNAL_TABLE: usize = 32;
const NO_ACTION: Option<SigAction> = None;

/// Prior dispositions of the hooked signals, written once inside
/// `HOOKS.call_once` while the signals are blocked.
struct PrevActions(UnsafeCell<[Option<SigAction>; SIGNAL_TABLE]>);

// SAFETY: each entry is written exactly once, with its signal blocked so
// the handler cannot run first, and only read from that handler
// afterwards.
unsafe impl Sync for PrevActions {}

static PREV_ACTIONS: PrevActions = PrevActions(UnsafeCell::new([NO_ACTION; SIGNAL_TABLE]));

unsafe fn hook_fatal_signal(sig: Signal) {
    let action = SigAction::new(
        SigHandler::Handler(on_fatal_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    if let Ok(previous) = sigaction(sig, &action) {
        (*PREV_ACTIONS.0.get())[sig as usize] = Some(previous);
    }
}

/// Drains the registry, restores the prior disposition for the signal,
/// then re-delivers it to self so the default OS semantics (exit code,
/// core dump) are preserved.
extern "C" fn on_fatal_signal(signo: libc::c_int) {
    REGISTRY.drain(false);
    let Ok(sig) = Signal::try_from(signo) else {
        return;
    };
    let idx = signo as usize;
    let previous = if idx < SIGNAL_TABLE {
        (unsafe { &*PREV_ACTIONS.0.get() })[idx]
    } else {
        None
    };
    // An unrecorded disposition falls back to the default one.
    let restore = previous
        .unwrap_or_else(|| SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()));
    let _ = unsafe { sigaction(sig, &restore) };
    let _ = raise(sig);
}
