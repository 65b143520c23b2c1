//! Bounded-timeout HTTP health probing for supervised services.

use std::time::Duration;

/// Probes a service's health endpoint on the loopback interface.
///
/// A probe succeeds only if the endpoint answers with a 2xx status within
/// the configured timeout; connection errors, timeouts and non-2xx answers
/// all count as unhealthy.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// One GET against `http://127.0.0.1:{port}{path}`.
    pub async fn check(&self, port: u16, path: &str) -> bool {
        let url = format!("http://127.0.0.1:{}{}", port, path);
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(resp) => {
                let healthy = resp.status().is_success();
                if !healthy {
                    tracing::debug!("Health probe {} returned {}", url, resp.status());
                }
                healthy
            }
            Err(e) => {
                tracing::debug!("Health probe {} failed: {}", url, e);
                false
            }
        }
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
