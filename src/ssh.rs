//! SSH sessions into the simulated guest, gated on a reachability probe.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::supervisor::{SpawnConfig, Supervised};

/// Probe attempts before giving up on the guest's sshd.
pub const DEFAULT_ATTEMPTS: usize = 6;

/// Per-attempt bound on one reachability probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// How an SSH session is established.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Forwarded guest SSH port on localhost.
    pub port: u16,
    /// When set, a verbose session transcript is written here.
    pub logfile: Option<PathBuf>,
    /// Replacement environment for the real session (probes inherit the
    /// parent environment).
    pub env: Option<HashMap<String, String>>,
    /// Deadline for the real session.
    pub deadline: Option<Duration>,
    /// Reachability probe budget.
    pub attempts: usize,
    /// Bound on each probe, as its deadline and its exit wait.
    pub probe_timeout: Duration,
}

impl SshConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            logfile: None,
            env: None,
            deadline: None,
            attempts: DEFAULT_ATTEMPTS,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn logfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.logfile = Some(path.into());
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Session deadline in whole seconds; a value that rounds to zero
    /// arms nothing.
    pub fn deadline_secs(mut self, secs: f64) -> Self {
        self.deadline = match crate::supervisor::round_to_secs(secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        self
    }
}

/// Opens a supervised SSH session running `command_args` on the guest.
///
/// Host-key checking and known-hosts persistence are disabled; the
/// guest is a throwaway VM whose key changes on every boot. Before the
/// real session is spawned, the guest's sshd is probed with the trivial
/// remote command `true`, up to [`SshConfig::attempts`] times; each
/// probe is bounded by [`SshConfig::probe_timeout`]. A probe failing
/// with `Timeout` or `NonZeroExit` consumes one attempt. Once the
/// budget is exhausted the whole call fails with [`Error::Connect`].
pub fn connect<I, S>(command_args: I, config: SshConfig) -> Result<Supervised>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let base = base_argv(&config);
    ensure_connects(&base, config.attempts, config.probe_timeout)?;

    let mut argv = base;
    argv.extend(command_args.into_iter().map(Into::into));
    Supervised::spawn(SpawnConfig {
        argv,
        env: config.env,
        deadline: config.deadline,
    })
}

/// Canonical ssh argument vector for one guest session.
fn base_argv(config: &SshConfig) -> Vec<String> {
    let mut argv = vec![
        "ssh".to_string(),
        "-p".to_string(),
        config.port.to_string(),
        "root@localhost".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
    ];
    if let Some(logfile) = &config.logfile {
        argv.push("-v".to_string());
        argv.push("-E".to_string());
        argv.push(logfile.display().to_string());
    }
    argv
}

/// Runs short-lived probes until one of them reaches the guest.
fn ensure_connects(base: &[String], attempts: usize, probe_timeout: Duration) -> Result<()> {
    for attempt in 1..=attempts {
        let mut argv = base.to_vec();
        argv.push("true".to_string());
        let probe = SpawnConfig {
            deadline: Some(probe_timeout),
            ..SpawnConfig::new(argv)
        };

        match Supervised::spawn(probe).and_then(|mut p| p.success(probe_timeout)) {
            Ok(_) => {
                info!(attempt, "ssh connection test passed");
                return Ok(());
            }
            Err(Error::Timeout { .. }) | Err(Error::NonZeroExit { .. }) => {
                warn!(attempt, attempts, "ssh reachability probe failed");
            }
            // A probe that cannot even spawn will not be fixed by retrying.
            Err(other) => return Err(other),
        }
    }
    Err(Error::Connect { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_argv_disables_host_key_checks() {
        let argv = base_argv(&SshConfig::new(2222));
        assert_eq!(
            argv,
            vec![
                "ssh",
                "-p",
                "2222",
                "root@localhost",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "StrictHostKeyChecking=no",
            ]
        );
    }

    #[test]
    fn test_base_argv_appends_transcript_flags() {
        let argv = base_argv(&SshConfig::new(2200).logfile("/tmp/session.log"));
        assert!(argv.ends_with(&[
            "-v".to_string(),
            "-E".to_string(),
            "/tmp/session.log".to_string()
        ]));
    }

    #[test]
    fn test_session_deadline_rounds_like_alarm() {
        assert_eq!(
            SshConfig::new(2222).deadline_secs(90.4).deadline,
            Some(Duration::from_secs(90))
        );
        assert_eq!(SshConfig::new(2222).deadline_secs(0.3).deadline, None);
    }
}
