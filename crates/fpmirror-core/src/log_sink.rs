//! Narrow logging capability handed to the protocol core.
//!
//! The handshake engine and stream decryptor never pick a log backend
//! themselves. They receive an `Arc<dyn LogSink>` and emit leveled,
//! pre-formatted lines through it. [`TracingSink`] is the default adapter and
//! forwards everything to `tracing` under the `fpmirror` target.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::Level;

/// A sink for leveled log lines.
pub trait LogSink: Send + Sync {
    /// Record `message` at `level`.
    fn log(&self, level: Level, message: &str);
}

/// Forwards log lines to the global `tracing` dispatcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "fpmirror", "{message}"),
            Level::WARN => tracing::warn!(target: "fpmirror", "{message}"),
            Level::INFO => tracing::info!(target: "fpmirror", "{message}"),
            Level::DEBUG => tracing::debug!(target: "fpmirror", "{message}"),
            Level::TRACE => tracing::trace!(target: "fpmirror", "{message}"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _level: Level, _message: &str) {}
}

/// Keeps every line in memory. Used by tests and by embedders that want to
/// attach recent protocol lines to a diagnostics report.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the recorded lines.
    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any recorded line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(_, line)| line.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: Level, message: &str) {
        // A panic elsewhere while holding the lock must not silence the sink.
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.push((level, message.to_string()));
    }
}

/// The sink used when the caller does not supply one.
pub fn default_sink() -> Arc<dyn LogSink> {
    Arc::new(TracingSink)
}
