//! The process-wide cleanup registry, exercised through its public
//! drain entry point. Draining is one-shot for the whole process, so
//! the full story lives in a single test.

use std::time::Duration;

use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::kill;
use vpexpect::{cleanup, SpawnConfig, Supervised};

#[test]
fn test_drain_ends_live_children_exactly_once() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir()?;
    let marker = dir.path().join("quit-marker");

    // A child that acknowledges the quit signal by touching a marker.
    let script = format!(
        "trap 'touch {}; exit 0' QUIT; while true; do sleep 0.1; done",
        marker.display()
    );
    let live = Supervised::spawn(SpawnConfig::new(["sh", "-c", script.as_str()]))?;
    let live_pid = live.pid();

    // A child that exits on its own and is never waited on here.
    let gone = Supervised::spawn(SpawnConfig::new(["true"]))?;
    let gone_pid = gone.pid();

    // A child whose exit is collected; success() must deregister it.
    let mut reaped = Supervised::spawn(SpawnConfig::new(["true"]))?;
    assert!(reaped.success(Duration::from_secs(5))?);

    std::thread::sleep(Duration::from_millis(300));

    // Only the live child needs ending; the exited one is skipped and
    // the reaped one is no longer registered.
    assert_eq!(cleanup::drain_now(), 1);
    assert!(marker.exists(), "child never saw the quit signal");
    assert_eq!(kill(live_pid, None), Err(Errno::ESRCH));
    assert_eq!(kill(gone_pid, None), Err(Errno::ESRCH));

    // Draining again is a no-op.
    assert_eq!(cleanup::drain_now(), 0);
    Ok(())
}
