//! Buffer memory budget.
//!
//! Two ceilings bound buffer memory: one per connection (read plus write
//! buffer capacity) and one for the whole process. Either may be zero for
//! "unlimited". Buffers grow in steps of 10% of their current size, never
//! less than the minimum buffer size, clamped to whatever room the ceilings
//! leave.

use std::fmt;

/// Default (and minimum) size of a connection buffer.
pub const MIN_BUFFER: usize = 4096;

/// What stopped a buffer from growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ceiling {
    PerConnection,
    Global,
    /// The budget allowed the growth but the allocator refused it. Never
    /// returned by [`Budget`] itself.
    Allocation,
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerConnection => f.write_str("per-connection buffer limit"),
            Self::Global => f.write_str("total buffer limit"),
            Self::Allocation => f.write_str("buffer allocation failure"),
        }
    }
}

/// Ceiling configuration. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetConfig {
    pub per_connection: usize,
    pub total: usize,
    pub min_buffer: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_connection: 0,
            total: 0,
            min_buffer: MIN_BUFFER,
        }
    }
}

/// Process-wide buffer accounting.
///
/// `total()` always equals the sum of the capacities of every live buffer;
/// the engine calls [`charge`](Self::charge) and [`release`](Self::release)
/// on every allocation and resize.
#[derive(Debug, Default)]
pub struct Budget {
    config: BudgetConfig,
    total: usize,
}

impl Budget {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config, total: 0 }
    }

    #[inline]
    pub fn config(&self) -> BudgetConfig {
        self.config
    }

    /// Change the ceilings. Existing buffers are left alone even if they
    /// now exceed a limit; they only stop growing.
    pub fn set_limits(&mut self, per_connection: usize, total: usize) {
        self.config.per_connection = per_connection;
        self.config.total = total;
    }

    /// Bytes currently allocated to connection buffers.
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn charge(&mut self, bytes: usize) {
        self.total += bytes;
    }

    pub fn release(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.total);
        self.total = self.total.saturating_sub(bytes);
    }

    /// Check that a fresh allocation of `bytes` (for a connection currently
    /// holding `conn_total`) fits both ceilings.
    pub fn admit(&self, bytes: usize, conn_total: usize) -> Result<(), Ceiling> {
        let per = self.config.per_connection;
        if per != 0 && conn_total + bytes > per {
            return Err(Ceiling::PerConnection);
        }
        let total = self.config.total;
        if total != 0 && self.total + bytes > total {
            return Err(Ceiling::Global);
        }
        Ok(())
    }

    /// Capacity a buffer of `current` bytes should grow to, given that its
    /// connection's buffers hold `conn_total` bytes in all.
    pub fn grow_target(&self, current: usize, conn_total: usize) -> Result<usize, Ceiling> {
        let mut delta = (current / 10).max(self.config.min_buffer).max(1);
        let mut hit = None;

        let per = self.config.per_connection;
        if per != 0 {
            let room = per.saturating_sub(conn_total);
            if delta > room {
                delta = room;
                hit = Some(Ceiling::PerConnection);
            }
        }
        let total = self.config.total;
        if total != 0 {
            let room = total.saturating_sub(self.total);
            if delta > room {
                delta = room;
                hit = Some(Ceiling::Global);
            }
        }

        match (delta, hit) {
            (0, Some(ceiling)) => Err(ceiling),
            _ => Ok(current + delta),
        }
    }

    /// Capacity to shrink a drained buffer back to, if it is worth it.
    pub fn shrink_target(&self, current: usize, unread: usize) -> Option<usize> {
        let min = self.config.min_buffer;
        (current > min && unread < min / 2).then_some(min)
    }
}
