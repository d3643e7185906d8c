use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::warn;

/// Record type code for an A record in a DNS-over-HTTPS JSON answer.
const TYPE_A: u16 = 1;

/// Resolves a hostname to its current public IPv4 addresses.
///
/// An empty result means "could not resolve right now" and callers are
/// expected to skip the cycle, never to treat it as "no addresses configured".
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Vec<String>;
}

/// DNS-over-HTTPS resolver against a public JSON endpoint.
pub struct DohResolver {
    url: String,
    client: reqwest::Client,
}

impl DohResolver {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            url,
            client: reqwest::Client::builder()
                .user_agent(concat!("blockwatch/", env!("CARGO_PKG_VERSION")))
                .timeout(timeout)
                .build()
                .unwrap(),
        }
    }
}

#[async_trait]
impl Resolver for DohResolver {
    async fn resolve(&self, hostname: &str) -> Vec<String> {
        if hostname.is_empty() {
            return Vec::new();
        }

        let response = self
            .client
            .get(&self.url)
            .query(&[("name", hostname), ("type", "A")])
            .header(ACCEPT, "application/dns-json")
            .send()
            .await;

        match response {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => match resp.text().await {
                Ok(body) => ipv4_answers(&body),
                Err(e) => {
                    warn!("DNS lookup for {} failed reading body: {}", hostname, e);
                    Vec::new()
                }
            },
            Ok(resp) => {
                warn!("DNS lookup for {} returned HTTP {}", hostname, resp.status());
                Vec::new()
            }
            Err(e) => {
                warn!("DNS lookup for {} failed: {}", hostname, e);
                Vec::new()
            }
        }
    }
}

#[derive(Deserialize)]
struct DnsReply {
    #[serde(rename = "Answer", default)]
    answer: Vec<DnsAnswer>,
}

#[derive(Deserialize)]
struct DnsAnswer {
    #[serde(rename = "type")]
    rr_type: u16,
    data: String,
}

/// Extracts well-formed IPv4 literals from A answers, keeping answer order and
/// dropping duplicates. Any payload that does not parse yields an empty list.
fn ipv4_answers(body: &str) -> Vec<String> {
    let reply: DnsReply = match serde_json::from_str(body) {
        Ok(reply) => reply,
        Err(_) => return Vec::new(),
    };

    let mut ips: Vec<String> = Vec::new();
    for answer in reply.answer {
        if answer.rr_type != TYPE_A {
            continue;
        }
        let ip = answer.data.trim();
        if ip.parse::<Ipv4Addr>().is_err() {
            continue;
        }
        if !ips.iter().any(|seen| seen == ip) {
            ips.push(ip.to_string());
        }
    }
    ips
}
