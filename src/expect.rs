//! Pattern expectation against a supervised process's output queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use regex::RegexBuilder;

use crate::error::{Error, Result};
use crate::queue::{Entry, LineReceiver};

/// Most-recent-lines window kept for failure diagnostics.
pub(crate) const CONTEXT_CAPACITY: usize = 30;

/// How long a wait sleeps on an idle queue before rechecking the
/// deadline flag.
const WAKE_POLL: Duration = Duration::from_millis(50);

/// Bounded history of lines skipped while searching for a match.
///
/// Used only for diagnostics. Matching always happens against the single
/// line currently at the head of the queue.
pub(crate) struct ContextRing {
    lines: VecDeque<String>,
}

impl ContextRing {
    pub(crate) fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(CONTEXT_CAPACITY),
        }
    }

    /// Appends a line, evicting the oldest once the window is full.
    pub(crate) fn push(&mut self, line: String) {
        if self.lines.len() == CONTEXT_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub(crate) fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lines.len()
    }
}

/// Consumes queue entries until one matches `pattern`.
///
/// Matching is consumption: the matched line and every line skipped
/// before it are gone from the queue, so a later call only sees lines
/// after this match point. A single queued line is the unit of match;
/// patterns never span lines.
///
/// On EOF the call fails with the ring of recently skipped lines, or
/// with `Timeout` when the process's deadline killed it first. The
/// queue is polled rather than blocked on outright: a fired deadline
/// wakes the wait even while some inherited copy of the stream's write
/// end keeps it open.
pub(crate) fn wait_for_match(
    queue: &LineReceiver,
    pattern: &str,
    name: &str,
    timed_out: &AtomicBool,
    deadline_secs: &AtomicU64,
) -> Result<()> {
    // Queued lines keep their trailing newline, so `$` must be able to
    // match just before it.
    let regex = RegexBuilder::new(pattern).multi_line(true).build()?;
    let mut recent = ContextRing::new();
    loop {
        let Some(entry) = queue.recv_timeout(WAKE_POLL) else {
            if timed_out.load(Ordering::SeqCst) {
                return Err(deadline_error(name, deadline_secs));
            }
            continue;
        };
        match entry {
            Entry::Line(line) => {
                if regex.is_match(&line) {
                    return Ok(());
                }
                recent.push(line);
            }
            Entry::Eof => {
                if timed_out.load(Ordering::SeqCst) {
                    return Err(deadline_error(name, deadline_secs));
                }
                return Err(Error::EofBeforeMatch {
                    pattern: pattern.to_string(),
                    context: recent.into_lines(),
                });
            }
        }
    }
}

fn deadline_error(name: &str, deadline_secs: &AtomicU64) -> Error {
    Error::Timeout {
        name: name.to_string(),
        elapsed: Duration::from_secs(deadline_secs.load(Ordering::SeqCst)),
    }
}
