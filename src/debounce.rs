//! Edit coalescing over a quiescence window.
//!
//! The debouncer is clock-agnostic: callers pass the current instant, and
//! the driving loop sleeps until [`Debouncer::deadline`].

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Debouncer<T> {
    window: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    /// Record an edit; it replaces any edit still waiting.
    pub fn push(&mut self, value: T, now: Instant) {
        self.pending = Some((value, now + self.window));
    }

    /// When the waiting edit settles, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, due)| *due)
    }

    /// Take the waiting edit if the window has elapsed without another edit.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some((_, due)) if *due <= now => self.pending.take().map(|(value, _)| value),
            _ => None,
        }
    }

    /// Take the waiting edit regardless of the window.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|(value, _)| value)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(500);

    #[test]
    fn test_edits_within_window_coalesce() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);

        debouncer.push("e", start);
        debouncer.push("ex", start + Duration::from_millis(200));
        debouncer.push("exp", start + Duration::from_millis(400));

        // 500ms after the first edit, but only 100ms after the last
        assert_eq!(debouncer.take_due(start + Duration::from_millis(500)), None);
        assert_eq!(debouncer.deadline(), Some(start + Duration::from_millis(900)));
        assert_eq!(debouncer.take_due(start + Duration::from_millis(900)), Some("exp"));
        assert!(!debouncer.is_pending());
    }

    #[test]
    fn test_nothing_due_without_edits() {
        let mut debouncer: Debouncer<String> = Debouncer::new(WINDOW);
        assert_eq!(debouncer.deadline(), None);
        assert_eq!(debouncer.take_due(Instant::now()), None);
    }

    #[test]
    fn test_flush_ignores_window() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.push(1, now);
        assert_eq!(debouncer.flush(), Some(1));
        assert_eq!(debouncer.flush(), None);
    }
}
