//! `/health` endpoint.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections across every endpoint.
    pub connections: usize,
    /// Live connections per endpoint path.
    pub endpoints: BTreeMap<String, usize>,
}

/// Build a health response from per-endpoint connection counts.
pub fn health_check<'a>(
    start_time: Instant,
    endpoints: impl IntoIterator<Item = (&'a str, usize)>,
) -> HealthResponse {
    let endpoints: BTreeMap<String, usize> = endpoints
        .into_iter()
        .map(|(path, count)| (path.to_owned(), count))
        .collect();
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: endpoints.values().sum(),
        endpoints,
    }
}
