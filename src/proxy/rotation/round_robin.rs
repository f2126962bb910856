//! Round-robin upstream pool

use parking_lot::Mutex;
use std::sync::Arc;

use super::ProxySelector;
use crate::error::{GatewayError, Result};
use crate::models::Upstream;

/// Hands out upstreams in configuration order, wrapping at the end
///
/// The cursor always points at the entry returned by the next call. The lock is
/// held only for the read-and-advance.
pub struct RoundRobinPool {
    entries: Vec<Arc<Upstream>>,
    cursor: Mutex<usize>,
}

impl RoundRobinPool {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            cursor: Mutex::new(0),
        }
    }

    /// Append an upstream. Only used while building the pool.
    pub fn add(&mut self, upstream: Upstream) {
        self.entries.push(Arc::new(upstream));
    }

    /// Return the upstream at the cursor and advance it
    pub fn next(&self) -> Result<Arc<Upstream>> {
        if self.entries.is_empty() {
            return Err(GatewayError::PoolEmpty);
        }

        let mut cursor = self.cursor.lock();
        let upstream = self.entries[*cursor].clone();
        *cursor = (*cursor + 1) % self.entries.len();

        Ok(upstream)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RoundRobinPool {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<Upstream> for RoundRobinPool {
    fn from_iter<I: IntoIterator<Item = Upstream>>(iter: I) -> Self {
        let mut pool = Self::new();
        for upstream in iter {
            pool.add(upstream);
        }
        pool
    }
}

impl ProxySelector for RoundRobinPool {
    fn select(&self) -> Result<Arc<Upstream>> {
        self.next()
    }

    fn available_count(&self) -> usize {
        self.len()
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}
