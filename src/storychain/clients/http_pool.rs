//! HTTP client pool for maintaining persistent connections per base URL.
//!
//! Every provider client built for the same base URL shares one `reqwest::Client`, so
//! connections, DNS lookups and TLS sessions are reused across agents and runs.
//!
//! The clients are configured for long-lived streaming responses: no whole-request timeout,
//! only a connect timeout plus TCP keepalive.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

lazy_static! {
    static ref HTTP_CLIENT_POOL: Mutex<HashMap<String, reqwest::Client>> =
        Mutex::new(HashMap::new());
}

/// Get or create the shared HTTP client for the given base URL.
pub fn shared_http_client(base_url: &str) -> Result<reqwest::Client, reqwest::Error> {
    let mut pool = match HTTP_CLIENT_POOL.lock() {
        Ok(pool) => pool,
        Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(client) = pool.get(base_url) {
        return Ok(client.clone());
    }

    let client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    pool.insert(base_url.to_string(), client.clone());
    Ok(client)
}
