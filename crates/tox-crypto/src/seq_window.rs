//! Sliding counter window for transport-message replay protection.
//!
//! The window remembers the highest accepted counter and a bitmap of the
//! `size` counters just below it. A counter is acceptable when it is newer
//! than the highest one, or inside the window and not yet marked.
//!
//! # Thread Safety
//!
//! Not thread-safe on its own; each `RecvCipher` owns one and sessions guard
//! the cipher with their lock.

/// Sliding window over received counters.
#[derive(Debug, Clone)]
pub struct SequenceWindow {
    /// Highest counter accepted, `None` until the first one
    highest: Option<u64>,
    /// Bit `n` set = counter `highest - n` accepted
    bitmap: u128,
    size: u64,
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceWindow {
    /// Largest window the bitmap can represent.
    pub const MAX_SIZE: u64 = 128;

    pub fn new() -> Self {
        Self::with_size(Self::MAX_SIZE)
    }

    /// # Panics
    /// Panics if size is 0 or greater than 128.
    pub fn with_size(size: u64) -> Self {
        assert!(
            size > 0 && size <= Self::MAX_SIZE,
            "window size must be 1-128"
        );
        Self {
            highest: None,
            bitmap: 0,
            size,
        }
    }

    /// Would `counter` be accepted? Does not modify the window.
    pub fn check(&self, counter: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if counter > highest {
            return true;
        }
        let offset = highest - counter;
        offset < self.size && self.bitmap & (1u128 << offset) == 0
    }

    /// Accept `counter` if `check` allows it. Returns whether it was accepted.
    pub fn accept(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }

        match self.highest {
            Some(highest) if counter <= highest => {
                self.bitmap |= 1u128 << (highest - counter);
            }
            Some(highest) => {
                let shift = counter - highest;
                self.bitmap = if shift >= 128 {
                    1
                } else {
                    (self.bitmap << shift) | 1
                };
                self.highest = Some(counter);
            }
            None => {
                self.bitmap = 1;
                self.highest = Some(counter);
            }
        }
        true
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    pub fn reset(&mut self) {
        self.highest = None;
        self.bitmap = 0;
    }
}
