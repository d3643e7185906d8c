use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};

use crate::state::StateStore;

/// Registers this instance with the central coordinator. The coordinator
/// confirms by calling back into the verify endpoint with the token posted
/// here; only a confirmed registration unlocks proxy mutation.
pub struct PingerClient {
    url: String,
    hostname: String,
    state: Arc<dyn StateStore>,
    client: reqwest::Client,
}

impl PingerClient {
    pub fn new(
        url: String,
        hostname: String,
        state: Arc<dyn StateStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            url,
            hostname,
            state,
            client: reqwest::Client::builder()
                .user_agent(concat!("blockwatch/", env!("CARGO_PKG_VERSION")))
                .timeout(timeout)
                .build()
                .unwrap(),
        }
    }

    /// Attempts registration and records the outcome. Returns whether the
    /// coordinator confirmed. Transport and coordinator failures are recorded
    /// in state, not raised; only a broken state store errors.
    pub async fn register(&self) -> Result<bool> {
        let token = match self.state.ping_token()? {
            Some(token) => token,
            None => {
                let token = generate_token();
                self.state.set_ping_token(&token)?;
                token
            }
        };

        // The coordinator needs an address to call back; best effort from the
        // last completed check, empty if none happened yet.
        let ip = self
            .state
            .last_check()?
            .and_then(|check| check.resolved_ips.first().cloned())
            .unwrap_or_default();

        let params = [
            ("site_url", format!("https://{}", self.hostname)),
            ("ip", ip),
            ("token", token),
        ];

        let response = match self.client.post(&self.url).form(&params).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("pinger registration failed: {}", e);
                self.state.set_registered(false)?;
                self.state.set_pinger_error(Some(&e.to_string()))?;
                return Ok(false);
            }
        };

        let code = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
        let confirmed = body.get("status").and_then(|s| s.as_str()) == Some("success");

        self.state.set_registered(confirmed)?;
        if confirmed {
            info!("pinger registration confirmed");
            self.state.set_pinger_error(None)?;
        } else {
            let detail = body
                .get("details")
                .or_else(|| body.get("error"))
                .and_then(|d| d.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}: unexpected response", code));
            warn!("pinger registration not confirmed: {}", detail);
            self.state.set_pinger_error(Some(&detail))?;
        }

        Ok(confirmed)
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
