//! Error types for supervised-process operations.

use std::process::ExitStatus;
use std::time::Duration;

/// Result type alias for supervision operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of failure kinds surfaced by the harness.
///
/// Every variant is fatal to the calling test scenario and is returned
/// unmodified; the only internal retry is the SSH reachability probe.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS could not create the child process.
    #[error("failed to spawn '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A deadline or wait window elapsed while the process was still busy.
    ///
    /// Only proves that the clock ran out, not that the interrupted call
    /// was the slow one.
    #[error("timed out after {elapsed:?} waiting on '{name}'")]
    Timeout { name: String, elapsed: Duration },

    /// The output stream closed before the expected pattern appeared.
    ///
    /// Carries the most recent lines seen by this `expect` call so the
    /// failure is diagnosable without rerunning.
    #[error("expected '{pattern}' but got EOF\ncontext:\n{}", .context.concat())]
    EofBeforeMatch { pattern: String, context: Vec<String> },

    /// The process exited on its own with a failing status.
    #[error("expected exit code 0 from '{name}' but got {status}")]
    NonZeroExit { name: String, status: ExitStatus },

    /// Every SSH reachability probe in the budget failed.
    #[error("failed to connect to sshd after {attempts} attempts")]
    Connect { attempts: usize },

    /// The expectation pattern did not compile.
    #[error("invalid expect pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Signal delivery to the child failed.
    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::Error),

    /// Waiting on the child failed at the OS level.
    #[error("failed to wait on '{name}': {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
