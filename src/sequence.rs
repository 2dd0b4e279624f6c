//! Last-write-wins ordering for results of requests that cannot be cancelled.

/// Sequence number attached to one submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Issues monotonically increasing tickets and accepts only the newest.
#[derive(Debug, Default)]
pub struct SequenceGate {
    issued: u64,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self) -> Ticket {
        self.issued += 1;
        Ticket(self.issued)
    }

    /// Whether a result carrying `ticket` may still be applied.
    pub fn is_current(&self, ticket: Ticket) -> bool {
        ticket.0 == self.issued
    }

    /// Stale every outstanding ticket without issuing a usable one.
    pub fn invalidate(&mut self) {
        self.issued += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_older_result_arriving_last_is_dropped() {
        let mut gate = SequenceGate::new();
        let a = gate.issue();
        let b = gate.issue();

        // B arrives first and is applied; A arrives after and is stale
        assert!(gate.is_current(b));
        assert!(!gate.is_current(a));
    }

    #[test]
    fn test_single_request_is_current() {
        let mut gate = SequenceGate::new();
        let a = gate.issue();
        assert!(gate.is_current(a));
        assert_eq!(a.value(), 1);
    }

    #[test]
    fn test_invalidate_stales_outstanding() {
        let mut gate = SequenceGate::new();
        let a = gate.issue();
        gate.invalidate();
        assert!(!gate.is_current(a));
        assert!(gate.issue() > a);
    }
}
