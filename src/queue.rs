//! Ordered line hand-off between a drain thread and the expecting caller.

use std::sync::mpsc;
use std::time::Duration;

/// One entry in a process's output queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Entry {
    /// A single output line, trailing newline preserved.
    Line(String),
    /// End of the merged stream. Pushed at most once, always last.
    Eof,
}

/// Producer half, owned by the drain thread.
pub(crate) struct LineSender(mpsc::Sender<Entry>);

/// Consumer half, owned by the supervising caller.
#[derive(Debug)]
pub(crate) struct LineReceiver(mpsc::Receiver<Entry>);

/// Creates an unbounded queue. A slow consumer makes the queue grow,
/// never lose lines.
pub(crate) fn channel() -> (LineSender, LineReceiver) {
    let (tx, rx) = mpsc::channel();
    (LineSender(tx), LineReceiver(rx))
}

impl LineSender {
    /// Enqueues one line. A vanished consumer is not an error; the drain
    /// keeps teeing output regardless.
    pub(crate) fn send(&self, line: String) {
        let _ = self.0.send(Entry::Line(line));
    }

    /// Marks end of stream. Consumes the sender so `Eof` cannot be
    /// followed by further entries.
    pub(crate) fn close(self) {
        let _ = self.0.send(Entry::Eof);
    }
}

impl LineReceiver {
    /// Blocks for the next entry. A disconnected producer counts as EOF.
    #[cfg(test)]
    pub(crate) fn recv(&self) -> Entry {
        self.0.recv().unwrap_or(Entry::Eof)
    }

    /// Blocks up to `timeout` for the next entry. `None` means nothing
    /// arrived in time; a disconnected producer counts as EOF.
    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Option<Entry> {
        match self.0.recv_timeout(timeout) {
            Ok(entry) => Some(entry),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(Entry::Eof),
        }
    }
}
