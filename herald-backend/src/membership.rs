//! Heartbeats and the derived set of live proxies.
//!
//! Every tick a proxy stamps its own heartbeat and local player count, then
//! rebuilds its view of the fleet from everyone's heartbeats. Read paths use
//! that cached view, so it is at most one tick stale.

use std::sync::Arc;
use std::time::Duration;

use herald_store::{Store, keys};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{PresenceError, Result};
use crate::helpers::Clock;
use crate::roster::Roster;

/// Snapshot of the fleet as of the last tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetView {
    /// Live proxy ids, sorted, always including this proxy
    pub live_proxies: Vec<String>,
    pub global_count: usize,
}

pub struct Membership {
    proxy_id: String,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    roster: Arc<Roster>,
    liveness_window: Duration,
    view: RwLock<FleetView>,
}

impl Membership {
    pub fn new(
        proxy_id: String,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        roster: Arc<Roster>,
        liveness_window: Duration,
    ) -> Self {
        let view = FleetView {
            live_proxies: vec![proxy_id.clone()],
            global_count: 0,
        };
        Self {
            proxy_id,
            store,
            clock,
            roster,
            liveness_window,
            view: RwLock::new(view),
        }
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    fn is_fresh(&self, heartbeat: i64, now: i64) -> bool {
        now - heartbeat <= self.liveness_window.as_secs() as i64
    }

    /// Refuse to start if another process is heartbeating under our id.
    pub async fn claim(&self, crash_recovery: bool) -> Result<()> {
        let Some(raw) = self.store.hget(keys::HEARTBEATS, &self.proxy_id).await? else {
            return Ok(());
        };
        let Ok(heartbeat) = raw.parse::<i64>() else {
            warn!(proxy = %self.proxy_id, value = %raw, "ignoring unparseable heartbeat for this proxy id");
            return Ok(());
        };
        if !self.is_fresh(heartbeat, self.clock.now_secs()) {
            return Ok(());
        }
        if crash_recovery {
            warn!(
                proxy = %self.proxy_id,
                "live heartbeat found for this proxy id, continuing because crash recovery is set"
            );
            return Ok(());
        }
        Err(PresenceError::ImposterInstance {
            proxy_id: self.proxy_id.clone(),
        })
    }

    /// Write this proxy's heartbeat and local player count.
    pub async fn beat(&self) -> Result<()> {
        let now = self.clock.now_secs();
        self.store
            .hset(keys::HEARTBEATS, &self.proxy_id, &now.to_string())
            .await?;
        self.store
            .hset(
                keys::PLAYER_COUNTS,
                &self.proxy_id,
                &self.roster.len().to_string(),
            )
            .await?;
        Ok(())
    }

    /// One heartbeat cycle. Never fails; problems are logged and the view
    /// falls back to what this proxy knows on its own.
    pub async fn tick(&self) {
        if let Err(err) = self.beat().await {
            error!(%err, proxy = %self.proxy_id, "failed to write heartbeat");
        }

        let live_proxies = match self.fetch_live_proxies().await {
            Ok(live) => live,
            Err(err) => {
                error!(%err, "failed to read heartbeats, assuming only this proxy is live");
                vec![self.proxy_id.clone()]
            }
        };

        let global_count = match self.count_players(&live_proxies).await {
            Ok(count) => count,
            Err(err) => {
                error!(%err, "failed to read player counts, using the local count");
                self.roster.len()
            }
        };

        debug!(live = live_proxies.len(), global_count, "refreshed fleet view");
        *self.view.write().await = FleetView {
            live_proxies,
            global_count,
        };
    }

    /// Read every heartbeat and keep the proxies inside the liveness window.
    pub async fn fetch_live_proxies(&self) -> Result<Vec<String>> {
        let now = self.clock.now_secs();
        let heartbeats = self.store.hgetall(keys::HEARTBEATS).await?;

        let mut live: Vec<String> = heartbeats
            .into_iter()
            .filter_map(|(proxy, raw)| match raw.parse::<i64>() {
                Ok(heartbeat) if self.is_fresh(heartbeat, now) => Some(proxy),
                Ok(_) => None,
                Err(_) => {
                    warn!(%proxy, value = %raw, "skipping unparseable heartbeat");
                    None
                }
            })
            .collect();

        if !live.contains(&self.proxy_id) {
            live.push(self.proxy_id.clone());
        }
        live.sort();
        Ok(live)
    }

    /// Local count plus the stored counts of the other live proxies.
    /// Unparseable counts are skipped and reset to zero.
    pub async fn count_players(&self, live_proxies: &[String]) -> Result<usize> {
        let counts = self.store.hgetall(keys::PLAYER_COUNTS).await?;
        let mut total = self.roster.len();

        for proxy in live_proxies.iter().filter(|p| **p != self.proxy_id) {
            let Some(raw) = counts.get(proxy) else {
                continue;
            };
            match raw.parse::<usize>() {
                Ok(count) => total += count,
                Err(_) => {
                    let err = PresenceError::DataCorruption {
                        key: keys::PLAYER_COUNTS.to_string(),
                        field: proxy.clone(),
                        value: raw.clone(),
                    };
                    warn!(%err, "resetting corrupt player count to 0");
                    if let Err(err) = self.store.hset(keys::PLAYER_COUNTS, proxy, "0").await {
                        error!(%err, %proxy, "failed to repair player count");
                    }
                }
            }
        }
        Ok(total)
    }

    pub async fn view(&self) -> FleetView {
        self.view.read().await.clone()
    }

    pub async fn live_proxies(&self) -> Vec<String> {
        self.view.read().await.live_proxies.clone()
    }

    /// Live proxies other than this one.
    pub async fn other_live_proxies(&self) -> Vec<String> {
        self.view
            .read()
            .await
            .live_proxies
            .iter()
            .filter(|p| **p != self.proxy_id)
            .cloned()
            .collect()
    }

    pub async fn is_live(&self, proxy: &str) -> bool {
        proxy == self.proxy_id
            || self
                .view
                .read()
                .await
                .live_proxies
                .iter()
                .any(|p| p == proxy)
    }

    pub async fn cached_global_count(&self) -> usize {
        self.view.read().await.global_count
    }

    /// Remove this proxy's heartbeat and count so others stop counting it.
    pub async fn release(&self) -> Result<()> {
        self.store
            .hdel(keys::PLAYER_COUNTS, &[self.proxy_id.as_str()])
            .await?;
        self.store
            .hdel(keys::HEARTBEATS, &[self.proxy_id.as_str()])
            .await?;
        info!(proxy = %self.proxy_id, "released heartbeat");
        Ok(())
    }
}
