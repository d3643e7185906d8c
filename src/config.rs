use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Check intervals (minutes) the scheduler accepts. Anything else falls back
/// to the first entry.
pub const ALLOWED_INTERVALS_MIN: [u64; 5] = [5, 10, 15, 30, 60];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// The hostname whose public address is monitored. Empty means every
    /// cycle no-ops at the resolve step.
    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub cloudflare: CloudflareConfig,

    #[serde(default)]
    pub check: CheckConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub pinger: PingerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    #[serde(default = "default_doh_url")]
    pub doh_url: String,
    #[serde(default = "default_lookup_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,
    #[serde(default = "default_lookup_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CloudflareConfig {
    /// Token scoped to Zone > DNS > Edit.
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub zone_id: String,
    #[serde(default)]
    pub record_id: String,
    #[serde(default = "default_zone_api_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckConfig {
    #[serde(default = "default_check_interval")]
    pub interval_minutes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default)]
    pub smtp_relay: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default)]
    pub from: String,
    /// Empty disables notifications.
    #[serde(default)]
    pub to: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_enable")]
    pub enable: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PingerConfig {
    #[serde(default = "default_register_url")]
    pub register_url: String,
    #[serde(default = "default_pinger_enable")]
    pub enable: bool,
    #[serde(default = "default_register_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Defaults
fn default_doh_url() -> String {
    "https://dns.google/resolve".to_string()
}
fn default_feed_url() -> String {
    "https://hayahora.futbol/estado/data.json".to_string()
}
fn default_lookup_timeout() -> u64 {
    10
}
fn default_zone_api_timeout() -> u64 {
    15
}
fn default_check_interval() -> u64 {
    ALLOWED_INTERVALS_MIN[0]
}
fn default_smtp_port() -> u16 {
    587
}
fn default_sqlite_path() -> String {
    "blockwatch.db".to_string()
}
fn default_api_enable() -> bool {
    true
}
fn default_api_port() -> u16 {
    8080
}
fn default_register_url() -> String {
    "https://hayfutbol.alexrivas.net/".to_string()
}
fn default_pinger_enable() -> bool {
    true
}
fn default_register_timeout() -> u64 {
    20
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            resolver: ResolverConfig::default(),
            feed: FeedConfig::default(),
            cloudflare: CloudflareConfig::default(),
            check: CheckConfig::default(),
            notify: NotifyConfig::default(),
            state: StateConfig::default(),
            api: ApiConfig::default(),
            pinger: PingerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            doh_url: default_doh_url(),
            timeout_secs: default_lookup_timeout(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            timeout_secs: default_lookup_timeout(),
        }
    }
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            zone_id: String::new(),
            record_id: String::new(),
            timeout_secs: default_zone_api_timeout(),
        }
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_check_interval(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            smtp_relay: String::new(),
            smtp_port: default_smtp_port(),
            smtp_username: String::new(),
            smtp_password: String::new(),
            from: String::new(),
            to: String::new(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enable: default_api_enable(),
            port: default_api_port(),
        }
    }
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            register_url: default_register_url(),
            enable: default_pinger_enable(),
            timeout_secs: default_register_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config TOML")?;
        Ok(config)
    }
}

impl CheckConfig {
    /// The configured interval clamped to the allowed set.
    pub fn interval_minutes(&self) -> u64 {
        if ALLOWED_INTERVALS_MIN.contains(&self.interval_minutes) {
            self.interval_minutes
        } else {
            ALLOWED_INTERVALS_MIN[0]
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes() * 60)
    }
}

impl CloudflareConfig {
    /// Token and zone are enough to talk to the API (record listing).
    pub fn has_credentials(&self) -> bool {
        !self.api_token.is_empty() && !self.zone_id.is_empty()
    }

    /// Everything needed to toggle the proxy on a specific record.
    pub fn is_complete(&self) -> bool {
        self.has_credentials() && !self.record_id.is_empty()
    }
}
