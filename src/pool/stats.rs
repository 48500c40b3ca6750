use std::fmt;
use std::ops::AddAssign;

/// A snapshot of pool occupancy, for one route or for the whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Entries currently leased, including connections still being established.
    pub leased: usize,

    /// Lease requests waiting for capacity.
    pub pending: usize,

    /// Free entries ready for reuse.
    pub available: usize,

    /// The applicable maximum number of leased entries.
    pub max: usize,
}

impl PoolStats {
    /// Returns `true` when nothing is leased or waiting.
    pub fn is_quiescent(&self) -> bool {
        self.leased == 0 && self.pending == 0
    }
}

impl AddAssign for PoolStats {
    fn add_assign(&mut self, other: Self) {
        self.leased += other.leased;
        self.pending += other.pending;
        self.available += other.available;
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[leased: {}; pending: {}; available: {}; max: {}]",
            self.leased, self.pending, self.available, self.max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let stats = PoolStats {
            leased: 1,
            pending: 2,
            available: 3,
            max: 4,
        };
        assert_eq!(
            stats.to_string(),
            "[leased: 1; pending: 2; available: 3; max: 4]"
        );
        assert!(!stats.is_quiescent());
    }

    #[test]
    fn accumulate_keeps_max() {
        let mut total = PoolStats {
            max: 10,
            ..Default::default()
        };
        total += PoolStats {
            leased: 1,
            pending: 0,
            available: 2,
            max: 5,
        };
        total += PoolStats {
            leased: 0,
            pending: 1,
            available: 0,
            max: 5,
        };

        assert_eq!(
            total,
            PoolStats {
                leased: 1,
                pending: 1,
                available: 2,
                max: 10
            }
        );
    }
}
