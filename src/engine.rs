use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::feed::{BlockEntry, BlocklistFeed};
use crate::notify::Notifier;
use crate::proxy::ProxyClient;
use crate::resolver::Resolver;
use crate::state::{CheckResult, StateStore, ToggleLock};

/// A block event counts as "happening now" while its state change is at most
/// this old. The boundary is inclusive.
const MATCH_WINDOW_SECS: i64 = 2 * 3600;

const TOGGLE_LOCK: &str = "proxy_toggle";
const TOGGLE_LOCK_TTL: Duration = Duration::from_secs(30);

/// The record the engine is allowed to toggle. Absent while the zone
/// credentials or the record choice are not configured yet.
#[derive(Clone)]
pub struct ProxyTarget {
    pub client: Arc<dyn ProxyClient>,
    pub record_id: String,
}

/// Where a cycle ended. Used for structured logging and asserted on in tests;
/// nothing is persisted from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Hostname resolved to nothing; cycle skipped without touching state.
    ResolveFailed,
    /// Feed fetch failed; cycle skipped without touching state.
    FeedFailed,
    /// Check persisted, but the pinger handshake is unconfirmed so the
    /// instance stays read-only.
    NotRegistered,
    /// Another toggle is in flight; benign, silent skip.
    LockBusy,
    /// Blocked/paused already agree; nothing to do.
    NoChange,
    /// Toggle wanted but the zone credentials/record are not configured.
    NotConfigured,
    ProxyDisabled,
    ProxyEnabled,
    /// Toggle attempted and rejected; paused unchanged, error recorded.
    ToggleFailed,
}

/// One full check cycle: resolve the monitored hostname, compare against the
/// blocklist feed, persist the observation, and reconcile the proxy flag with
/// at-least-once semantics (a failed toggle is retried by the next cycle).
pub struct BlockCheck {
    hostname: String,
    resolver: Arc<dyn Resolver>,
    feed: Arc<dyn BlocklistFeed>,
    proxy: Option<ProxyTarget>,
    state: Arc<dyn StateStore>,
    lock: Arc<dyn ToggleLock>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl BlockCheck {
    pub fn new(
        hostname: String,
        resolver: Arc<dyn Resolver>,
        feed: Arc<dyn BlocklistFeed>,
        proxy: Option<ProxyTarget>,
        state: Arc<dyn StateStore>,
        lock: Arc<dyn ToggleLock>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            hostname,
            resolver,
            feed,
            proxy,
            state,
            lock,
            notifier,
        }
    }

    pub async fn run(&self) -> CycleOutcome {
        let ips = self.resolver.resolve(&self.hostname).await;
        if ips.is_empty() {
            debug!("no addresses resolved for {}, skipping cycle", self.hostname);
            return CycleOutcome::ResolveFailed;
        }

        // A failed fetch aborts everything, CheckResult included: no state
        // churn during a feed outage.
        let entries = match self.feed.fetch().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("blocklist fetch failed, skipping cycle: {}", e);
                return CycleOutcome::FeedFailed;
            }
        };

        let now = Utc::now();
        let blocked = is_blocked(&ips, &entries);
        let active_match_window = has_active_window(&entries, now);

        let check = CheckResult {
            checked_at: now,
            resolved_ips: ips,
            blocked,
            active_match_window,
        };
        if let Err(e) = self.state.record_check(&check) {
            warn!("failed to persist check result: {}", e);
        }

        // Unregistered instances monitor but never mutate. Checked after the
        // CheckResult write so the dashboard stays current while unregistered.
        if !self.state.registered().unwrap_or(false) {
            debug!("pinger registration unconfirmed, monitor-only cycle");
            return CycleOutcome::NotRegistered;
        }

        match self.lock.try_acquire(TOGGLE_LOCK, TOGGLE_LOCK_TTL) {
            Ok(true) => {}
            Ok(false) => {
                debug!("toggle lock busy, skipping");
                return CycleOutcome::LockBusy;
            }
            Err(e) => {
                warn!("toggle lock unavailable: {}", e);
                return CycleOutcome::LockBusy;
            }
        }

        let outcome = self.reconcile(blocked, &check).await;

        if let Err(e) = self.lock.release(TOGGLE_LOCK) {
            warn!("failed to release toggle lock: {}", e);
        }

        outcome
    }

    /// The transition table. `paused` tracks "the proxy is off because of us";
    /// on toggle failure it is left untouched so the next cycle retries the
    /// same transition.
    async fn reconcile(&self, blocked: bool, check: &CheckResult) -> CycleOutcome {
        let paused = match self.state.paused() {
            Ok(paused) => paused,
            Err(e) => {
                warn!("could not read paused flag: {}", e);
                false
            }
        };

        let enable = match (blocked, paused) {
            (true, false) => false,
            (false, true) => true,
            _ => return CycleOutcome::NoChange,
        };

        let Some(target) = self.proxy.as_ref() else {
            debug!("zone credentials not configured, skipping toggle");
            return CycleOutcome::NotConfigured;
        };

        match target.client.set_proxied(&target.record_id, enable).await {
            Ok(()) => {
                if let Err(e) = self.state.set_paused(!enable) {
                    warn!("failed to persist paused flag: {}", e);
                }
                if let Err(e) = self.state.set_last_error(None) {
                    warn!("failed to clear toggle error: {}", e);
                }

                let ips = check.resolved_ips.join(", ");
                if enable {
                    info!("proxy re-enabled for {}: no longer blocklisted", self.hostname);
                } else {
                    info!("proxy disabled for {}: {} blocklisted", self.hostname, ips);
                }

                if let Some(notifier) = &self.notifier {
                    notifier.toggled(enable, &ips).await;
                }

                if enable {
                    CycleOutcome::ProxyEnabled
                } else {
                    CycleOutcome::ProxyDisabled
                }
            }
            Err(e) => {
                warn!("proxy toggle failed: {}", e);
                if let Err(store_err) = self.state.set_last_error(Some(&e.to_string())) {
                    warn!("failed to record toggle error: {}", store_err);
                }
                CycleOutcome::ToggleFailed
            }
        }
    }
}

/// Exact string match between resolved addresses and feed entries. The feed
/// and the resolver both emit canonical dotted quads, so no normalization.
fn is_blocked(ips: &[String], entries: &[BlockEntry]) -> bool {
    ips.iter().any(|ip| entries.iter().any(|e| e.ip == *ip))
}

/// True when any block event started within the match window, independent of
/// whether it concerns this site's addresses.
fn has_active_window(entries: &[BlockEntry], now: DateTime<Utc>) -> bool {
    let cutoff = now.timestamp() - MATCH_WINDOW_SECS;
    entries.iter().any(|e| e.since >= cutoff)
}
