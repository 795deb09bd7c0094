//! Background drain of a child's merged output stream.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::thread::JoinHandle;

use tracing::debug;

use crate::queue::LineSender;

/// Starts the drain thread for one supervised process.
///
/// Reads the merged stream line by line until it closes. Each line is
/// tee'd to the harness's stdout the moment it is read, then enqueued,
/// so output stays visible even when nobody is expecting. Lines are
/// never reordered or dropped. On stream close the queue is closed with
/// its EOF marker and the thread exits.
pub(crate) fn spawn(name: &str, stream: File, queue: LineSender) -> std::io::Result<JoinHandle<()>> {
    let thread_name = format!("drain-{name}");
    let name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        // Simulator consoles are not always clean UTF-8.
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        tee(&line);
                        queue.send(line);
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(name = %name, error = %e, "output stream read failed");
                        break;
                    }
                }
            }
            debug!(name = %name, "output stream closed");
            queue.close();
        })
}

/// Raw passthrough to the harness's own stdout, flushed per line.
fn tee(line: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(line.as_bytes());
    let _ = out.flush();
}
