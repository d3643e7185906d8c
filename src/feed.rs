use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use thiserror::Error;

/// An IP currently listed as blocked, with the epoch second of the state
/// change that put it there. Recomputed every cycle, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub ip: String,
    pub since: i64,
}

/// Fetch failure. Deliberately a distinct type from "fetched fine, nothing is
/// blocked": conflating the two would re-enable a paused proxy during a feed
/// outage.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("feed returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("feed payload missing the data field")]
    MalformedBody,
}

#[async_trait]
pub trait BlocklistFeed: Send + Sync {
    async fn fetch(&self) -> Result<Vec<BlockEntry>, FeedError>;
}

/// The published status feed: JSON with a top-level `data` array of tracked
/// IPs, each carrying its history of timestamped block/unblock transitions.
pub struct StatusFeed {
    url: String,
    client: reqwest::Client,
}

impl StatusFeed {
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
impl BlocklistFeed for StatusFeed {
    async fn fetch(&self) -> Result<Vec<BlockEntry>, FeedError> {
        let response = self.client.get(&self.url).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(FeedError::Status(response.status()));
        }
        let body = response.text().await?;
        blocked_entries(&body)
    }
}

#[derive(Deserialize)]
struct FeedEntry {
    ip: String,
    #[serde(rename = "stateChanges")]
    state_changes: Vec<StateChange>,
}

#[derive(Deserialize)]
struct StateChange {
    timestamp: String,
    state: bool,
}

/// Reduces the feed body to the IPs whose most recent state change is
/// state=true. The latest change is picked by string ordering of the ISO-8601
/// timestamps, which sorts temporally. Entries that are malformed or missing
/// required fields are skipped; a body without the `data` array is an error.
fn blocked_entries(body: &str) -> Result<Vec<BlockEntry>, FeedError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|_| FeedError::MalformedBody)?;
    let data = value
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or(FeedError::MalformedBody)?;

    let mut blocked = Vec::new();
    for raw in data {
        let Ok(entry) = serde_json::from_value::<FeedEntry>(raw.clone()) else {
            continue;
        };
        if entry.ip.is_empty() {
            continue;
        }
        let Some(latest) = entry
            .state_changes
            .iter()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp))
        else {
            continue;
        };
        if !latest.state {
            continue;
        }
        let since = DateTime::parse_from_rfc3339(&latest.timestamp)
            .map(|t| t.timestamp())
            .unwrap_or(0);
        blocked.push(BlockEntry {
            ip: entry.ip,
            since,
        });
    }

    Ok(blocked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_ips_whose_latest_change_is_blocked() {
        let body = r#"{"data": [
            {"ip": "203.0.113.5", "stateChanges": [
                {"timestamp": "2024-01-01T10:00:00Z", "state": true}
            ]},
            {"ip": "198.51.100.7", "stateChanges": [
                {"timestamp": "2024-01-01T08:00:00Z", "state": true},
                {"timestamp": "2024-01-01T09:00:00Z", "state": false}
            ]}
        ]}"#;

        let entries = blocked_entries(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ip, "203.0.113.5");
        assert_eq!(entries[0].since, 1704103200);
    }

    #[test]
    fn picks_latest_change_from_unordered_history() {
        let body = r#"{"data": [
            {"ip": "203.0.113.5", "stateChanges": [
                {"timestamp": "2024-01-01T12:00:00Z", "state": true},
                {"timestamp": "2024-01-01T08:00:00Z", "state": false},
                {"timestamp": "2024-01-01T10:00:00Z", "state": false}
            ]}
        ]}"#;

        let entries = blocked_entries(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].since, 1704110400);
    }

    #[test]
    fn skips_malformed_entries_without_failing() {
        let body = r#"{"data": [
            {"ip": "203.0.113.5"},
            {"stateChanges": [{"timestamp": "2024-01-01T10:00:00Z", "state": true}]},
            {"ip": "", "stateChanges": [{"timestamp": "2024-01-01T10:00:00Z", "state": true}]},
            {"ip": "198.51.100.7", "stateChanges": []},
            {"ip": "192.0.2.9", "stateChanges": [
                {"timestamp": "2024-01-01T10:00:00Z", "state": true}
            ]}
        ]}"#;

        let entries = blocked_entries(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ip, "192.0.2.9");
    }

    #[test]
    fn unparsable_timestamp_falls_back_to_zero() {
        let body = r#"{"data": [
            {"ip": "203.0.113.5", "stateChanges": [
                {"timestamp": "yesterday-ish", "state": true}
            ]}
        ]}"#;

        let entries = blocked_entries(body).unwrap();
        assert_eq!(entries[0].since, 0);
    }

    #[test]
    fn missing_data_field_is_an_error() {
        assert!(matches!(
            blocked_entries(r#"{"estado": []}"#),
            Err(FeedError::MalformedBody)
        ));
        assert!(matches!(
            blocked_entries("not json"),
            Err(FeedError::MalformedBody)
        ));
    }

    #[test]
    fn empty_data_is_success_not_failure() {
        let entries = blocked_entries(r#"{"data": []}"#).unwrap();
        assert!(entries.is_empty());
    }
}
