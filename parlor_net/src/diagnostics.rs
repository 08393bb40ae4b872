// Bounded diagnostic log for the lobby UI.
//
// Human-readable lines describing what the connection manager did (attempts,
// retries, relay restarts, ICE transitions). Oldest entries fall off once the
// capacity is reached. Nothing in the manager reads this back; control flow
// lives in the manager's own fields.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiagnosticEntry {
    /// Time since the lobby was initialized.
    pub elapsed: Duration,
    pub message: String,
}

#[derive(Debug)]
pub struct Diagnostics {
    entries: VecDeque<DiagnosticEntry>,
    capacity: usize,
    started: Instant,
}

impl Diagnostics {
    pub fn new(capacity: usize, started: Instant) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            started,
        }
    }

    pub fn push(&mut self, now: Instant, message: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let message = message.into();
        tracing::debug!(diagnostic = %message);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(DiagnosticEntry {
            elapsed: now.saturating_duration_since(self.started),
            message,
        });
    }

    /// Forget everything and restart the clock at `started`.
    pub fn reset(&mut self, started: Instant) {
        self.entries.clear();
        self.started = started;
    }

    pub fn entries(&self) -> impl Iterator<Item = &DiagnosticEntry> {
        self.entries.iter()
    }

    pub fn messages(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.message.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entries_fall_off() {
        let t0 = Instant::now();
        let mut diag = Diagnostics::new(3, t0);
        for i in 0..5 {
            diag.push(t0 + Duration::from_millis(i * 10), format!("line {i}"));
        }
        assert_eq!(diag.messages(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(
            diag.entries().next().unwrap().elapsed,
            Duration::from_millis(20)
        );
    }

    #[test]
    fn reset_clears() {
        let t0 = Instant::now();
        let mut diag = Diagnostics::new(2, t0);
        diag.push(t0, "x");
        diag.reset(t0);
        assert!(diag.is_empty());
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let t0 = Instant::now();
        let mut diag = Diagnostics::new(0, t0);
        diag.push(t0, "x");
        assert_eq!(diag.len(), 0);
    }
}
