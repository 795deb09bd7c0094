//! End-of-harness behavior across the three ways a harness dies: a
//! normal exit, an unwinding panic, and a terminating signal.
//!
//! Each scenario re-runs this test binary with a filter selecting one
//! of the `helper_*` tests below; the helper hands the pid of its
//! supervised child back through a file in a shared scratch directory.
//! The helpers are inert unless `VPEXPECT_SCENARIO` selects them, so a
//! plain `cargo test` run sees them pass as no-ops.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use vpexpect::{SpawnConfig, Supervised};

fn scenario() -> Option<String> {
    std::env::var("VPEXPECT_SCENARIO").ok()
}

fn spawn_scenario_child(with_banner: bool) -> Result<Supervised> {
    let marker = PathBuf::from(std::env::var("VPEXPECT_MARKER").context("marker path not set")?);
    // The trap must be armed before the banner: the banner is the
    // readiness handshake the helper waits on, and a harness exiting
    // right after it would otherwise QUIT a still-trapless shell.
    let banner = if with_banner { "echo TEE_PROOF; " } else { "" };
    let script = format!(
        "trap 'touch {}; exit 0' QUIT; {banner}while true; do sleep 0.1; done",
        marker.display()
    );
    let child = Supervised::spawn(SpawnConfig::new(["sh", "-c", script.as_str()]))?;
    announce(&child, &marker)?;
    Ok(child)
}

/// Hands the supervised child's pid to the launching test, written to a
/// temporary name first so a polling reader never sees a partial write.
fn announce(child: &Supervised, marker: &Path) -> Result<()> {
    let dir = marker.parent().context("marker path has no parent")?;
    let tmp = dir.join("child-pid.tmp");
    std::fs::write(&tmp, child.pid().to_string())?;
    std::fs::rename(tmp, dir.join("child-pid"))?;
    Ok(())
}

#[test]
fn helper_exits_cleanly() -> Result<()> {
    if scenario().as_deref() != Some("exit") {
        return Ok(());
    }
    let mut child = spawn_scenario_child(true)?;
    child.expect("TEE_PROOF")?;
    // Returning lets the binary finish normally; the at-exit hook must
    // end the still-running child.
    Ok(())
}

#[test]
fn helper_panics() -> Result<()> {
    if scenario().as_deref() != Some("panic") {
        return Ok(());
    }
    let _child = spawn_scenario_child(false)?;
    panic!("simulated harness failure");
}

#[test]
fn helper_sleeps_until_signalled() -> Result<()> {
    if scenario().as_deref() != Some("sleep") {
        return Ok(());
    }
    let _child = spawn_scenario_child(false)?;
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

struct Scenario {
    helper: Child,
    child_pid: Pid,
    marker: PathBuf,
    _dir: tempfile::TempDir,
}

fn launch(scenario: &str, helper_test: &str) -> Result<Scenario> {
    let dir = tempfile::tempdir()?;
    let marker = dir.path().join("drained");
    let mut helper = Command::new(std::env::current_exe()?)
        .args([helper_test, "--exact", "--nocapture", "--test-threads", "1"])
        .env("VPEXPECT_SCENARIO", scenario)
        .env("VPEXPECT_MARKER", &marker)
        .stdout(Stdio::piped())
        .spawn()?;

    // The pid comes through a file; the helper's stdout interleaves
    // test-runner chatter with tee output and has no reliable line
    // framing.
    let child_pid = match await_child_pid(&dir.path().join("child-pid"), Duration::from_secs(20)) {
        Ok(pid) => pid,
        Err(err) => {
            let _ = helper.kill();
            let _ = helper.wait();
            return Err(err);
        }
    };

    Ok(Scenario {
        helper,
        child_pid,
        marker,
        _dir: dir,
    })
}

fn await_child_pid(path: &Path, limit: Duration) -> Result<Pid> {
    let start = Instant::now();
    loop {
        if let Ok(text) = std::fs::read_to_string(path) {
            return Ok(Pid::from_raw(text.trim().parse()?));
        }
        if start.elapsed() >= limit {
            bail!("helper never announced its supervised child");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> Result<ExitStatus> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if start.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            bail!("helper did not finish within {limit:?}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn assert_child_was_ended(scenario: &Scenario) {
    assert!(
        scenario.marker.exists(),
        "supervised child never saw the quit signal"
    );
    assert_eq!(kill(scenario.child_pid, None), Err(Errno::ESRCH));
}

#[test]
fn test_normal_exit_ends_registered_children() -> Result<()> {
    let mut scenario = launch("exit", "helper_exits_cleanly")?;
    let status = wait_with_deadline(&mut scenario.helper, Duration::from_secs(30))?;
    assert!(status.success(), "helper failed: {status}");
    assert_child_was_ended(&scenario);

    // The drain tees child output to the harness's own stdout. The
    // test-runner's unterminated progress line may sit glued in front
    // of it, so only the substring counts.
    let mut output = String::new();
    scenario
        .helper
        .stdout
        .take()
        .context("helper stdout was not piped")?
        .read_to_string(&mut output)?;
    assert!(
        output.contains("TEE_PROOF"),
        "child output never reached the harness stdout: {output:?}"
    );
    Ok(())
}

#[test]
fn test_panic_ends_registered_children() -> Result<()> {
    let mut scenario = launch("panic", "helper_panics")?;
    let status = wait_with_deadline(&mut scenario.helper, Duration::from_secs(30))?;
    assert!(!status.success(), "helper should have failed its test run");
    assert_child_was_ended(&scenario);
    Ok(())
}

#[test]
fn test_terminating_signal_ends_children_and_reraises() -> Result<()> {
    use std::os::unix::process::ExitStatusExt;

    let mut scenario = launch("sleep", "helper_sleeps_until_signalled")?;
    kill(Pid::from_raw(scenario.helper.id() as i32), Signal::SIGTERM)?;
    let status = wait_with_deadline(&mut scenario.helper, Duration::from_secs(30))?;
    // The handler re-raises after draining, so the helper still dies
    // of SIGTERM rather than exiting.
    assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    assert_child_was_ended(&scenario);
    Ok(())
}
