//! Connection selection strategies for the pool.

/// How the pool picks the next connection for an operation.
///
/// Only round-robin is implemented today; the enum leaves room for weighted
/// or least-loaded strategies without touching call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
}

impl BalanceStrategy {
    /// The index to use after `current`, for a pool of `max` connections.
    pub fn next_index(self, current: u32, max: u32) -> u32 {
        match self {
            BalanceStrategy::RoundRobin => {
                if max == 0 {
                    0
                } else {
                    (current + 1) % max
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_visits_every_index_evenly() {
        for max in [1u32, 2, 7, 15] {
            let mut visits = vec![0u32; max as usize];
            let mut current = max - 1;
            for _ in 0..10 * max {
                current = BalanceStrategy::RoundRobin.next_index(current, max);
                visits[current as usize] += 1;
            }
            assert!(
                visits.iter().all(|&count| count == 10),
                "uneven visits for max={max}: {visits:?}"
            );
        }
    }

    #[test]
    fn empty_pool_maps_to_index_zero() {
        assert_eq!(BalanceStrategy::RoundRobin.next_index(5, 0), 0);
    }

    #[test]
    fn wraps_around_at_the_end() {
        assert_eq!(BalanceStrategy::RoundRobin.next_index(14, 15), 0);
    }
}
