//! Supervised child processes with expectation, exit checking, and
//! guaranteed end-of-harness termination.

use std::collections::HashMap;
use std::fs::File;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::cleanup;
use crate::deadline::Deadline;
use crate::drain;
use crate::error::{Error, Result};
use crate::expect;
use crate::queue::{self, LineReceiver};

/// Default wait window for [`Supervised::success`].
pub const DEFAULT_SUCCESS_TIMEOUT: Duration = Duration::from_secs(20);

const EXIT_POLL: Duration = Duration::from_millis(50);

/// How a supervised process is started.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Command line, program first.
    pub argv: Vec<String>,
    /// When set, replaces the parent environment entirely. `None`
    /// inherits it.
    pub env: Option<HashMap<String, String>>,
    /// Whole-second deadline after which the process is killed and the
    /// blocked caller gets a `Timeout`.
    pub deadline: Option<Duration>,
}

impl SpawnConfig {
    /// Builds a config for the given command line.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: None,
            deadline: None,
        }
    }

    /// Replaces the child's environment with `env` (override, not merge).
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Adds one variable to the replacement environment.
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Arms a deadline of `secs` seconds, rounded to whole seconds the
    /// way the coarse wall-clock timer counts them. A value that rounds
    /// to zero arms nothing, as a zero alarm would.
    pub fn deadline_secs(mut self, secs: f64) -> Self {
        self.deadline = match round_to_secs(secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        self
    }
}

pub(crate) fn round_to_secs(secs: f64) -> u64 {
    if secs > 0.0 {
        secs.round() as u64
    } else {
        0
    }
}

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The child is (as far as we know) still running.
    Running,
    /// The child exited on its own and was reaped.
    Exited,
    /// The child was forcibly killed by its deadline.
    Killed,
}

/// State shared with the drain-, deadline- and expect-side of one
/// process.
#[derive(Debug)]
pub(crate) struct Shared {
    name: String,
    pid: i32,
    timed_out: AtomicBool,
    deadline_secs: AtomicU64,
}

/// An external process whose lifecycle, output, and termination are
/// managed by the harness.
///
/// Construction spawns the child with stdout and stderr merged into one
/// stream, registers it for end-of-harness cleanup, and starts a
/// background drain that tees every output line to the harness's stdout
/// and queues it for [`expect`](Supervised::expect). Dropping the handle
/// does not kill the child; the cleanup registry ends whatever is still
/// alive when the harness itself goes away.
#[derive(Debug)]
pub struct Supervised {
    child: Child,
    shared: Arc<Shared>,
    queue: LineReceiver,
    deadline: Option<Deadline>,
    slot: Option<usize>,
    status: Option<ExitStatus>,
    state: ProcessState,
}

impl Supervised {
    /// Spawns and supervises a child process.
    ///
    /// Fails with [`Error::Spawn`] when the OS cannot create the
    /// process, when `argv` is empty, or when the supervision registry
    /// is full.
    pub fn spawn(config: SpawnConfig) -> Result<Supervised> {
        let Some(name) = config.argv.first().cloned() else {
            return Err(Error::Spawn {
                name: "<empty>".to_string(),
                source: std::io::Error::other("empty argv"),
            });
        };

        info!(command = %config.argv.join(" "), "running supervised command");
        if let Some(env) = &config.env {
            debug!(env = ?env, "with replacement environment");
        }

        // One pipe shared by stdout and stderr, so the two streams
        // interleave in emission order just as they would on a console.
        let (read_end, write_end) = nix::unistd::pipe().map_err(|e| Error::Spawn {
            name: name.clone(),
            source: e.into(),
        })?;
        let stderr_end = write_end.try_clone().map_err(|source| Error::Spawn {
            name: name.clone(),
            source,
        })?;

        let mut command = Command::new(&name);
        command
            .args(&config.argv[1..])
            .stdin(Stdio::inherit())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end));
        if let Some(env) = &config.env {
            command.env_clear();
            command.envs(env);
        }

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            name: name.clone(),
            source,
        })?;
        // Close the parent's copies of the write ends so the drain sees
        // EOF once the child side closes.
        drop(command);

        let pid = child.id() as i32;
        let Some(slot) = cleanup::register(Pid::from_raw(pid)) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Spawn {
                name,
                source: std::io::Error::other("supervision registry full"),
            });
        };

        let (tx, rx) = queue::channel();
        if let Err(source) = drain::spawn(&name, File::from(read_end), tx) {
            let _ = child.kill();
            let _ = child.wait();
            cleanup::release(slot, Pid::from_raw(pid));
            return Err(Error::Spawn { name, source });
        }

        let shared = Arc::new(Shared {
            name,
            pid,
            timed_out: AtomicBool::new(false),
            deadline_secs: AtomicU64::new(0),
        });

        let deadline = match config.deadline {
            Some(after) => match arm_deadline(&shared, after) {
                Ok(deadline) => Some(deadline),
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    cleanup::release(slot, Pid::from_raw(pid));
                    return Err(err);
                }
            },
            None => None,
        };

        Ok(Supervised {
            child,
            shared,
            queue: rx,
            deadline,
            slot: Some(slot),
            status: None,
            state: ProcessState::Running,
        })
    }

    /// Blocks until an output line matches `pattern` (unanchored regex
    /// search), consuming every line up to and including the match.
    ///
    /// Fails with [`Error::EofBeforeMatch`] when the stream closes
    /// first, or [`Error::Timeout`] when the deadline killed the
    /// process.
    pub fn expect(&mut self, pattern: &str) -> Result<()> {
        expect::wait_for_match(
            &self.queue,
            pattern,
            &self.shared.name,
            &self.shared.timed_out,
            &self.shared.deadline_secs,
        )
    }

    /// Waits up to `timeout` (default 20s) for the process to exit with
    /// code 0.
    ///
    /// Fails with [`Error::Timeout`] while it is still running at the
    /// end of the window (or once the deadline killed it), and with
    /// [`Error::NonZeroExit`] when it exited with a failing status.
    pub fn success(&mut self, timeout: impl Into<Option<Duration>>) -> Result<bool> {
        let limit = timeout.into().unwrap_or(DEFAULT_SUCCESS_TIMEOUT);
        let start = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return self.reaped(status),
                Ok(None) => {}
                Err(source) => {
                    return Err(Error::Wait {
                        name: self.shared.name.clone(),
                        source,
                    })
                }
            }
            if start.elapsed() >= limit {
                return Err(Error::Timeout {
                    name: self.shared.name.clone(),
                    elapsed: limit,
                });
            }
            std::thread::sleep(EXIT_POLL);
        }
    }

    /// Forwards an OS signal to the child. No effect is guaranteed; a
    /// process that already finished is left alone.
    pub fn send_signal(&self, sig: Signal) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        kill(Pid::from_raw(self.shared.pid), sig)?;
        Ok(())
    }

    /// Replaces this process's deadline with a fresh one of `secs`
    /// seconds. The previous deadline, if any, is cancelled; a value
    /// that rounds to zero only cancels.
    pub fn set_deadline(&mut self, secs: f64) -> Result<()> {
        self.deadline = None;
        let after = round_to_secs(secs);
        if after > 0 {
            self.deadline = Some(arm_deadline(&self.shared, Duration::from_secs(after))?);
        }
        Ok(())
    }

    /// The supervised command's name (argv\[0\]).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// OS process id of the child.
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.shared.pid)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    fn reaped(&mut self, status: ExitStatus) -> Result<bool> {
        self.status = Some(status);
        self.deadline = None;
        if let Some(slot) = self.slot.take() {
            cleanup::release(slot, Pid::from_raw(self.shared.pid));
        }
        if self.shared.timed_out.load(Ordering::SeqCst) {
            self.state = ProcessState::Killed;
            return Err(Error::Timeout {
                name: self.shared.name.clone(),
                elapsed: Duration::from_secs(self.shared.deadline_secs.load(Ordering::SeqCst)),
            });
        }
        debug!(name = %self.shared.name, %status, "supervised process exited");
        self.state = ProcessState::Exited;
        if status.success() {
            Ok(true)
        } else {
            Err(Error::NonZeroExit {
                name: self.shared.name.clone(),
                status,
            })
        }
    }
}

fn arm_deadline(shared: &Arc<Shared>, after: Duration) -> Result<Deadline> {
    let secs = after.as_secs();
    shared.deadline_secs.store(secs, Ordering::SeqCst);
    let state = Arc::clone(shared);
    Deadline::arm(Duration::from_secs(secs), move || {
        state.timed_out.store(true, Ordering::SeqCst);
        warn!(name = %state.name, pid = state.pid, secs, "deadline elapsed, killing process");
        let _ = kill(Pid::from_raw(state.pid), Signal::SIGKILL);
    })
    .map_err(|source| Error::Spawn {
        name: shared.name.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_secs_rounds_like_alarm() {
        assert_eq!(round_to_secs(2.4), 2);
        assert_eq!(round_to_secs(2.6), 3);
        assert_eq!(round_to_secs(0.2), 0);
        assert_eq!(round_to_secs(-1.0), 0);

        let config = SpawnConfig::new(["true"]).deadline_secs(179.6);
        assert_eq!(config.deadline, Some(Duration::from_secs(180)));

        // Sub-half-second values round to zero and arm no deadline.
        let config = SpawnConfig::new(["true"]).deadline_secs(0.2);
        assert_eq!(config.deadline, None);
    }

    #[test]
    fn test_env_var_builds_replacement_environment() {
        let config = SpawnConfig::new(["vp"])
            .env_var("QQVP_IMAGE_DIR", "/imgs")
            .env_var("PWD", "/work");
        let env = config.env.unwrap();
        assert_eq!(env.get("QQVP_IMAGE_DIR").map(String::as_str), Some("/imgs"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_empty_argv_is_a_spawn_error() {
        let err = Supervised::spawn(SpawnConfig::new(Vec::<String>::new())).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[test]
    fn test_missing_binary_is_a_spawn_error() {
        let err =
            Supervised::spawn(SpawnConfig::new(["/nonexistent/definitely-not-here"])).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[test]
    fn test_expect_and_success_on_quick_child() {
        let mut child = Supervised::spawn(SpawnConfig::new(["echo", "hello world"])).unwrap();
        child.expect("hello").unwrap();
        assert!(child.success(Duration::from_secs(5)).unwrap());
        assert_eq!(child.state(), ProcessState::Exited);
        assert!(child.exit_status().is_some());
    }

    #[test]
    fn test_replacement_env_overrides_not_merges() {
        let mut child = Supervised::spawn(
            SpawnConfig::new(["/bin/sh", "-c", "echo m=${MARKER}_h=${HOME}_end"])
                .env_var("MARKER", "set"),
        )
        .unwrap();
        // HOME came from the parent and must be gone; MARKER must be set.
        child.expect("m=set_h=_end").unwrap();
        child.success(Duration::from_secs(5)).unwrap();
    }
}
