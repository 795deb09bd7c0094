//! Non-interactive expect-style supervision of simulator and SSH test
//! processes.
//!
//! A test harness spawns a virtual-platform binary (or an SSH session
//! into its guest), watches its merged output stream for ordered
//! patterns, checks its exit status, and is guaranteed to terminate it
//! no matter how the harness itself exits. Each supervised process gets
//! a background drain thread that tees output to the harness's stdout
//! and queues it for matching; a per-process wall-clock deadline kills
//! runaways and surfaces as [`Error::Timeout`] to whichever call is
//! blocked; a process-wide registry ends every still-live child when
//! the harness terminates, whether it exits, dies of an uncaught
//! panic, or is killed by a signal.
//!
//! ```no_run
//! use std::time::Duration;
//! use vpexpect::{SpawnConfig, Supervised, ssh};
//!
//! fn boot_and_probe() -> vpexpect::Result<()> {
//!     let mut vp = Supervised::spawn(
//!         SpawnConfig::new(["./vp", "--gs_luafile", "conf.lua"])
//!             .env_var("QQVP_IMAGE_DIR", "/images")
//!             .deadline_secs(180.0),
//!     )?;
//!     vp.expect(r"DSP Image Creation Date:.+")?;
//!
//!     let mut session = ssh::connect(
//!         ["/mnt/bin/fastrpc_calc_test", "0", "100", "3"],
//!         ssh::SshConfig::new(2222).deadline_secs(180.0),
//!     )?;
//!     session.expect("- success")?;
//!     session.success(Duration::from_secs(20))?;
//!     Ok(())
//! }
//! ```
//!
//! Timeouts are deadline-shaped, not call-shaped: a `Timeout` error
//! means the process's deadline elapsed, not necessarily that the call
//! reporting it was the slow one.

mod deadline;
mod drain;
mod error;
mod expect;
mod queue;
mod supervisor;

pub mod cleanup;
pub mod ssh;

pub use error::{Error, Result};
pub use supervisor::{ProcessState, SpawnConfig, Supervised, DEFAULT_SUCCESS_TIMEOUT};
