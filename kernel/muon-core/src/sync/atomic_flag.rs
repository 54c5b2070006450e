//! Single-word atomic flag.
//!
//! For boolean state read and written outside any lock, such as the
//! process-wide "scheduler started" flag that parked cores spin on during
//! the boot rendezvous. This is a deliberate busy-wait signal, not a
//! general synchronization pattern.

use core::sync::atomic::{AtomicBool, Ordering};

/// A boolean flag with atomic read/write semantics.
///
/// Writes use `Release` and reads use `Acquire`, so everything written
/// before `write(true)` is visible to a reader that observes `true`.
pub struct AtomicFlag {
    inner: AtomicBool,
}

impl AtomicFlag {
    /// Creates a new flag with the given initial value.
    #[must_use]
    pub const fn new(value: bool) -> Self {
        Self {
            inner: AtomicBool::new(value),
        }
    }

    /// Reads the current value.
    #[must_use]
    pub fn read(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }

    /// Writes a new value.
    pub fn write(&self, value: bool) {
        self.inner.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_initial_value() {
        assert!(!AtomicFlag::new(false).read());
        assert!(AtomicFlag::new(true).read());
    }

    #[test]
    fn write_is_visible() {
        let flag = AtomicFlag::new(false);
        flag.write(true);
        assert!(flag.read());
        flag.write(false);
        assert!(!flag.read());
    }
}
