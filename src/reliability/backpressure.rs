/// Pending-depth limit per mailbox.
#[derive(Debug, Clone, Copy)]
pub struct Backpressure {
    enabled: bool,
    max_pending: usize,
}

impl Backpressure {
    pub fn new(enabled: bool, max_pending: usize) -> Self {
        Self {
            enabled,
            max_pending: max_pending.max(1),
        }
    }

    /// True when one more message may be written on top of `pending`.
    pub fn admits(&self, pending: usize) -> bool {
        !self.enabled || pending < self.max_pending
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}
