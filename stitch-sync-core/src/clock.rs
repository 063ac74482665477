use std::sync::atomic::{AtomicI64, Ordering};

/// Per-engine monotonically increasing tag, one per sync pass; used to defer
/// repeatedly-touched documents within a single pass. Wraps at `i64::MAX`
/// back to zero rather than overflowing.
#[derive(Debug, Default)]
pub struct LogicalClock {
    current: AtomicI64,
}

impl LogicalClock {
    pub fn new() -> Self {
        LogicalClock {
            current: AtomicI64::new(0),
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Advances the clock to the next tick, wrapping `i64::MAX` to `0`, and
    /// returns the new value. Called once at the start of each sync pass.
    pub fn tick(&self) -> i64 {
        loop {
            let current = self.current.load(Ordering::SeqCst);
            let next = if current == i64::MAX { 0 } else { current + 1 };
            if self
                .current
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_increments() {
        let clock = LogicalClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn tick_wraps_at_max() {
        let clock = LogicalClock {
            current: AtomicI64::new(i64::MAX),
        };
        assert_eq!(clock.tick(), 0);
    }
}
