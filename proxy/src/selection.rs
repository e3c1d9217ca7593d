//! Upstream server selection
//!
//! Picks the upstream a new session should be opened against.

use crate::error::{RelayError, RelayResult};
use crate::registry::Endpoint;
use tracing::debug;

/// Closest selection - the healthy endpoint with the lowest measured latency.
///
/// Ties go to the endpoint listed first in the registry.
pub fn best_server(endpoints: &[Endpoint]) -> RelayResult<Endpoint> {
    let favorite = endpoints
        .iter()
        .filter(|e| e.is_up())
        .min_by_key(|e| e.latency)
        .cloned()
        .ok_or(RelayError::NoHealthyServers)?;

    debug!(
        hostname = %favorite.hostname,
        port = favorite.port,
        latency_ms = favorite.latency.as_secs_f64() * 1000.0,
        "Best server"
    );
    Ok(favorite)
}
