//! Line sinks shared by the JSON logger and telemetry adapters.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

/// A sink that receives pre-formatted, newline-terminated lines.
pub trait LogSink: Send + Sync {
    /// Write a line to the sink.
    fn write_line(&self, line: &str);
}

/// Log sink that writes to stderr.
///
/// Each line is written under the stderr lock so lines from concurrent write
/// tasks never interleave.
#[derive(Debug, Default)]
pub struct StderrLogSink;

impl LogSink for StderrLogSink {
    fn write_line(&self, line: &str) {
        let mut stderr = std::io::stderr().lock();
        if let Err(error) = stderr.write_all(line.as_bytes()) {
            tracing::warn!(%error, "log sink write failed");
        }
    }
}

/// In-memory sink, used when lines need to be inspected (tests, `config check`).
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain captured lines.
    pub fn take(&self) -> Vec<String> {
        let mut guard = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }

    /// Number of lines captured so far.
    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for MemoryLogSink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_captures_lines_in_order() {
        let sink = MemoryLogSink::new();
        sink.write_line("connected\n");
        sink.write_line("subscribed\n");

        assert_eq!(sink.len(), 2);
        let lines = sink.take();
        assert_eq!(lines, vec!["connected\n", "subscribed\n"]);
        assert!(sink.is_empty());
    }
}
