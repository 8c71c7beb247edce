//! Discovery configuration.

use std::time::Duration;

/// Tunable parameters for the Kademlia discovery core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Concurrency width per lookup round, and the number of disjoint
    /// lookup paths (default: 3).
    pub alpha: usize,
    /// Bucket size and lookup result width (default: 10).
    pub k: usize,
    /// Maximum depth of non-home branches in the routing tree; the home
    /// branch may split deeper (default: 5).
    pub b: usize,
    /// Consecutive probe failures before a node becomes an eviction
    /// candidate (default: 3).
    pub max_timeouts: u32,
    /// Deadline for a single RPC (default: 500 ms).
    pub response_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            alpha: 3,
            k: 10,
            b: 5,
            max_timeouts: 3,
            response_timeout: Duration::from_millis(500),
        }
    }
}

impl DiscoveryConfig {
    /// Smaller widths and a short RPC deadline, for tests.
    pub fn for_testing() -> Self {
        Self {
            alpha: 2,
            k: 3,
            b: 2,
            max_timeouts: 2,
            response_timeout: Duration::from_millis(50),
        }
    }
}
