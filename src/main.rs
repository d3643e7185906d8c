use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use blockwatch::api::{start_api_server, ApiState};
use blockwatch::config::Config;
use blockwatch::engine::{BlockCheck, ProxyTarget};
use blockwatch::feed::StatusFeed;
use blockwatch::init::setup_logging;
use blockwatch::notify::{MailNotifier, Notifier};
use blockwatch::pinger::PingerClient;
use blockwatch::proxy::{CloudflareApi, ProxyClient};
use blockwatch::resolver::DohResolver;
use blockwatch::state::{SqliteStore, StateStore, ToggleLock};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load Config
    let config_path = std::env::args().nth(1).unwrap_or("config.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path).await?
    } else {
        Config::default()
    };

    // 2. Setup Logging
    setup_logging(&config);
    info!("Starting blockwatch...");

    if !std::path::Path::new(&config_path).exists() {
        info!("Config file not found, using defaults.");
    }
    if config.hostname.is_empty() {
        warn!("No hostname configured; checks will be skipped until one is set.");
    }

    // 3. Open State Store
    let store = Arc::new(SqliteStore::open(&config.state.sqlite_path)?);
    info!("State store opened at {}", config.state.sqlite_path);

    // 4. Build Resolver & Feed
    let resolver = Arc::new(DohResolver::new(
        config.resolver.doh_url.clone(),
        Duration::from_secs(config.resolver.timeout_secs),
    ));
    let feed = Arc::new(StatusFeed::new(
        config.feed.url.clone(),
        Duration::from_secs(config.feed.timeout_secs),
    ));

    // 5. Build Zone API Client (when credentials are present)
    let zone_client: Option<Arc<dyn ProxyClient>> = if config.cloudflare.has_credentials() {
        Some(Arc::new(CloudflareApi::new(
            config.cloudflare.api_token.clone(),
            config.cloudflare.zone_id.clone(),
            Duration::from_secs(config.cloudflare.timeout_secs),
        )))
    } else {
        info!("Zone credentials not configured; running in monitor-only mode.");
        None
    };

    let proxy_target = match &zone_client {
        Some(client) if config.cloudflare.is_complete() => Some(ProxyTarget {
            client: client.clone(),
            record_id: config.cloudflare.record_id.clone(),
        }),
        _ => None,
    };

    // 6. Build Notifier
    let notifier: Option<Arc<dyn Notifier>> = if config.notify.to.is_empty() {
        None
    } else {
        match MailNotifier::new(&config.notify, &config.hostname) {
            Ok(notifier) => Some(Arc::new(notifier)),
            Err(e) => {
                warn!("Notifier disabled: {}", e);
                None
            }
        }
    };

    // 7. Build the Check Engine
    let engine = Arc::new(BlockCheck::new(
        config.hostname.clone(),
        resolver,
        feed,
        proxy_target,
        store.clone() as Arc<dyn StateStore>,
        store.clone() as Arc<dyn ToggleLock>,
        notifier,
    ));

    // 8. Pinger Registration (prerequisite for proxy mutation)
    let pinger = if config.pinger.enable && !config.hostname.is_empty() {
        Some(Arc::new(PingerClient::new(
            config.pinger.register_url.clone(),
            config.hostname.clone(),
            store.clone() as Arc<dyn StateStore>,
            Duration::from_secs(config.pinger.timeout_secs),
        )))
    } else {
        None
    };

    if let Some(pinger) = &pinger {
        if !store.registered().unwrap_or(false) {
            match pinger.register().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Pinger registration unconfirmed; proxy toggling stays disabled.")
                }
                Err(e) => warn!("Pinger registration errored: {}", e),
            }
        }
    }

    // 9. Spawn Periodic Check Loop
    let check_sender = blockwatch::sched::spawn(engine, config.check.interval());
    info!(
        "Checking every {} minutes.",
        config.check.interval_minutes()
    );

    // 10. Start API Server
    if config.api.enable {
        let api_state = Arc::new(ApiState::new(
            store.clone() as Arc<dyn StateStore>,
            zone_client,
            pinger,
            check_sender,
        ));
        let port = config.api.port;
        tokio::spawn(async move {
            start_api_server(api_state, port).await;
        });
    }

    // 11. Graceful Shutdown
    signal::ctrl_c().await?;
    info!("Shutdown signal received.");

    Ok(())
}
