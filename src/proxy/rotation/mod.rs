//! Upstream rotation
//!
//! The gateway only ever rotates round robin; the trait is the seam the
//! request handler depends on.

mod round_robin;

pub use round_robin::RoundRobinPool;

use std::sync::Arc;

use crate::error::Result;
use crate::models::Upstream;

/// Trait for upstream selection
pub trait ProxySelector: Send + Sync {
    /// Select the upstream for the next request
    ///
    /// Returns an error if no upstreams are configured
    fn select(&self) -> Result<Arc<Upstream>>;

    /// Get the number of configured upstreams
    fn available_count(&self) -> usize;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}
