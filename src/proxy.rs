use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// A candidate A record in the managed zone. Consumed by the configuration
/// surface only; the check loop never lists records.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RecordSummary {
    pub id: String,
    pub name: String,
    pub address: String,
    pub proxied: bool,
}

/// Zone API failure. Upstream rejections carry the API's `errors` array
/// verbatim so operators see exactly what the provider said.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("zone API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("zone API returned invalid JSON")]
    InvalidBody,

    #[error("zone API rejected the request: {0}")]
    Upstream(String),
}

/// Read/write access to the "proxied" flag on zone DNS records.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Current proxied flag of a record.
    async fn proxied(&self, record_id: &str) -> Result<bool, ProxyError>;

    /// Enables or disables the reverse proxy for a record.
    async fn set_proxied(&self, record_id: &str, enabled: bool) -> Result<(), ProxyError>;

    /// All A records in the zone, for the configuration surface.
    async fn list_a_records(&self) -> Result<Vec<RecordSummary>, ProxyError>;

    /// Confirms the bearer token is accepted by the provider.
    async fn verify_token(&self) -> Result<(), ProxyError>;
}

/// Minimal Cloudflare API v4 client. Requires a token scoped to
/// Zone > DNS > Edit.
pub struct CloudflareApi {
    base_url: String,
    token: String,
    zone_id: String,
    client: reqwest::Client,
}

impl CloudflareApi {
    pub fn new(token: String, zone_id: String, timeout: Duration) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token,
            zone_id,
            client: reqwest::Client::builder()
                .user_agent(concat!("blockwatch/", env!("CARGO_PKG_VERSION")))
                .timeout(timeout)
                .build()
                .unwrap(),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Envelope, ProxyError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        // The API answers 4xx with the same envelope, so the body is parsed
        // regardless of status and the envelope decides success.
        let response = request.send().await?;
        let body = response.text().await?;
        parse_envelope(&body)
    }
}

#[async_trait]
impl ProxyClient for CloudflareApi {
    async fn proxied(&self, record_id: &str) -> Result<bool, ProxyError> {
        let path = format!("/zones/{}/dns_records/{}", self.zone_id, record_id);
        let envelope = self.request(Method::GET, &path, None).await?;
        envelope
            .result
            .get("proxied")
            .and_then(|v| v.as_bool())
            .ok_or(ProxyError::InvalidBody)
    }

    async fn set_proxied(&self, record_id: &str, enabled: bool) -> Result<(), ProxyError> {
        let path = format!("/zones/{}/dns_records/{}", self.zone_id, record_id);
        self.request(Method::PATCH, &path, Some(json!({ "proxied": enabled })))
            .await?;
        Ok(())
    }

    async fn list_a_records(&self) -> Result<Vec<RecordSummary>, ProxyError> {
        let path = format!("/zones/{}/dns_records?type=A", self.zone_id);
        let envelope = self.request(Method::GET, &path, None).await?;
        Ok(record_summaries(&envelope.result))
    }

    async fn verify_token(&self) -> Result<(), ProxyError> {
        self.request(Method::GET, "/user/tokens/verify", None)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
    #[serde(default)]
    result: serde_json::Value,
}

fn parse_envelope(body: &str) -> Result<Envelope, ProxyError> {
    let envelope: Envelope = serde_json::from_str(body).map_err(|_| ProxyError::InvalidBody)?;
    if !envelope.success {
        let detail = if envelope.errors.is_empty() {
            "Unknown error".to_string()
        } else {
            serde_json::to_string(&envelope.errors)
                .unwrap_or_else(|_| "Unknown error".to_string())
        };
        return Err(ProxyError::Upstream(detail));
    }
    Ok(envelope)
}

/// Maps the record-list `result` array, skipping entries that are missing
/// fields rather than failing the whole listing.
fn record_summaries(result: &serde_json::Value) -> Vec<RecordSummary> {
    let Some(items) = result.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            Some(RecordSummary {
                id: item.get("id")?.as_str()?.to_string(),
                name: item.get("name")?.as_str()?.to_string(),
                address: item.get("content")?.as_str()?.to_string(),
                proxied: item.get("proxied").and_then(|v| v.as_bool()).unwrap_or(false),
            })
        })
        .collect()
}
