//! The fleet-wide presence directory.
//!
//! Writes go to the store on behalf of players connected to this proxy.
//! Reads prefer local in-memory state and fall back to the store; a read that
//! cannot reach the store answers from local state only and logs the
//! failure. The player count is the exception: its errors are returned.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use herald_store::{LastOnline, PlayerRecord, Store, keys};
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{PresenceError, Result};
use crate::events::FirehoseEvent;
use crate::helpers::Clock;
use crate::membership::Membership;
use crate::roster::Roster;

/// Where a player currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerLocation {
    pub proxy: Option<String>,
    pub server: Option<String>,
}

pub struct Directory {
    proxy_id: String,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    roster: Arc<Roster>,
    membership: Arc<Membership>,
    firehose_channel: String,
}

impl Directory {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        roster: Arc<Roster>,
        membership: Arc<Membership>,
        firehose_channel: String,
    ) -> Self {
        Self {
            proxy_id: membership.proxy_id().to_string(),
            store,
            clock,
            roster,
            membership,
            firehose_channel,
        }
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    fn own_set(&self) -> String {
        keys::proxy_players(&self.proxy_id)
    }

    // ========================================================================
    // Presence events
    // ========================================================================

    /// Record a player connecting to this proxy. Safe to repeat.
    pub async fn record_connect(&self, player: Uuid, ip: IpAddr) -> Result<()> {
        self.roster
            .connect(player, ip, self.clock.now_millis())
            .await;

        let key = keys::player(&player);
        self.store
            .sadd(&self.own_set(), &player.to_string())
            .await?;
        self.store.hset(&key, keys::FIELD_ONLINE, "0").await?;
        self.store
            .hset(&key, keys::FIELD_IP, &ip.to_string())
            .await?;
        self.store
            .hset(&key, keys::FIELD_PROXY, &self.proxy_id)
            .await?;

        debug!(%player, %ip, "player connected");
        self.announce(FirehoseEvent::Login { uuid: player }).await;
        Ok(())
    }

    /// Record a player leaving this proxy, for any reason.
    pub async fn record_disconnect(&self, player: Uuid) -> Result<()> {
        self.roster.disconnect(&player).await;
        self.release_player(player).await?;

        debug!(%player, "player disconnected");
        self.announce(FirehoseEvent::Logoff { uuid: player }).await;
        Ok(())
    }

    /// Record a player moving to another backend server. Returns false (and
    /// writes nothing) if the player is not connected here.
    pub async fn record_server_change(&self, player: Uuid, server: &str) -> Result<bool> {
        if !self.roster.set_server(&player, server).await {
            debug!(%player, server, "ignoring server change for untracked player");
            return Ok(false);
        }

        self.store
            .hset(&keys::player(&player), keys::FIELD_SERVER, server)
            .await?;

        debug!(%player, server, "player changed server");
        self.announce(FirehoseEvent::Server {
            uuid: player,
            server: server.to_string(),
        })
        .await;
        Ok(true)
    }

    /// Drop a player from this proxy's stored set and, unless another live
    /// proxy owns the record now, stamp the last-online time and clear the
    /// session fields. Idempotent; shared by disconnect, the reconciliation
    /// sweep and shutdown.
    pub async fn release_player(&self, player: Uuid) -> Result<()> {
        let key = keys::player(&player);
        self.store
            .srem(&self.own_set(), &player.to_string())
            .await?;

        if let Some(owner) = self.store.hget(&key, keys::FIELD_PROXY).await? {
            if owner != self.proxy_id && self.membership.is_live(&owner).await {
                debug!(%player, %owner, "record owned by another live proxy, leaving it intact");
                return Ok(());
            }
        }

        self.store
            .hset(
                &key,
                keys::FIELD_ONLINE,
                &self.clock.now_millis().to_string(),
            )
            .await?;
        self.store
            .hdel(
                &key,
                &[keys::FIELD_SERVER, keys::FIELD_IP, keys::FIELD_PROXY],
            )
            .await?;
        Ok(())
    }

    async fn announce(&self, event: FirehoseEvent) {
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, ?event, "failed to encode firehose event");
                return;
            }
        };
        if let Err(err) = self.store.publish(&self.firehose_channel, &payload).await {
            error!(%err, player = %event.player(), "failed to publish firehose event");
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn local_count(&self) -> usize {
        self.roster.len()
    }

    /// Players connected here plus the stored sets of every other live proxy.
    pub async fn query_online_players(&self) -> HashSet<Uuid> {
        let mut players = self.roster.ids().await;

        for proxy in self.membership.other_live_proxies().await {
            match self.store.smembers(&keys::proxy_players(&proxy)).await {
                Ok(members) => players.extend(members.iter().filter_map(|raw| {
                    Uuid::parse_str(raw)
                        .inspect_err(|_| debug!(%proxy, member = %raw, "skipping malformed member"))
                        .ok()
                })),
                Err(err) => {
                    error!(%err, %proxy, "failed to read online players, answering with local players only");
                    return self.roster.ids().await;
                }
            }
        }
        players
    }

    pub async fn query_player_location(&self, player: Uuid) -> Option<PlayerLocation> {
        if let Some(local) = self.roster.get(&player).await {
            return Some(PlayerLocation {
                proxy: Some(self.proxy_id.clone()),
                server: local.server,
            });
        }

        let record = match self.store.hgetall(&keys::player(&player)).await {
            Ok(fields) => PlayerRecord::from_fields(fields),
            Err(err) => {
                error!(%err, %player, "failed to read player record");
                return None;
            }
        };
        if record.server.is_none() && record.proxy.is_none() {
            return None;
        }
        Some(PlayerLocation {
            proxy: record.proxy,
            server: record.server,
        })
    }

    /// Last-online state for a player. A store outage is returned as an
    /// error so it is never mistaken for a player nobody has seen.
    pub async fn query_last_online(&self, player: Uuid) -> Result<LastOnline> {
        if self.roster.contains(&player).await {
            return Ok(LastOnline::Online);
        }

        let key = keys::player(&player);
        let Some(raw) = self.store.hget(&key, keys::FIELD_ONLINE).await? else {
            return Ok(LastOnline::Never);
        };

        if let Some(last_online) = LastOnline::from_stored(&raw) {
            return Ok(last_online);
        }

        let err = PresenceError::DataCorruption {
            key: key.clone(),
            field: keys::FIELD_ONLINE.to_string(),
            value: raw,
        };
        let repaired = self.repair_last_online(player, &key).await?;
        warn!(%err, %player, repaired = repaired.as_millis(), "repaired corrupt last online time");
        Ok(repaired)
    }

    /// Rewrite a corrupt `online` field from what the fleet currently shows.
    async fn repair_last_online(&self, player: Uuid, key: &str) -> Result<LastOnline> {
        let repaired = match self.find_owning_proxy(player).await? {
            Some(_) => LastOnline::Online,
            None => LastOnline::Seen(self.clock.now_millis()),
        };
        self.store
            .hset(key, keys::FIELD_ONLINE, &repaired.as_millis().to_string())
            .await?;
        Ok(repaired)
    }

    pub async fn is_player_online(&self, player: Uuid) -> bool {
        match self.query_last_online(player).await {
            Ok(last_online) => last_online.is_online(),
            Err(err) => {
                error!(%err, %player, "failed to read last online time");
                false
            }
        }
    }

    pub async fn query_ip(&self, player: Uuid) -> Option<IpAddr> {
        if let Some(local) = self.roster.get(&player).await {
            return Some(local.ip);
        }

        match self.store.hget(&keys::player(&player), keys::FIELD_IP).await {
            Ok(raw) => raw.and_then(|raw| raw.parse().ok()),
            Err(err) => {
                error!(%err, %player, "failed to read player address");
                None
            }
        }
    }

    /// Network-wide player count against the cached live set. Store errors
    /// are returned rather than degraded.
    pub async fn query_global_count(&self) -> Result<usize> {
        let live = self.membership.live_proxies().await;
        self.membership.count_players(&live).await
    }

    /// Group every online player by backend server. Players whose server is
    /// not known yet are left out.
    pub async fn query_server_to_players(&self) -> BTreeMap<String, BTreeSet<Uuid>> {
        let mut servers: BTreeMap<String, BTreeSet<Uuid>> = BTreeMap::new();
        let local = self.roster.snapshot().await;
        let local_ids: HashSet<Uuid> = local.iter().map(|(id, _)| *id).collect();

        for (id, player) in local {
            if let Some(server) = player.server {
                servers.entry(server).or_default().insert(id);
            }
        }

        for player in self.query_online_players().await {
            if local_ids.contains(&player) {
                continue;
            }
            match self
                .store
                .hget(&keys::player(&player), keys::FIELD_SERVER)
                .await
            {
                Ok(Some(server)) => {
                    servers.entry(server).or_default().insert(player);
                }
                Ok(None) => {}
                Err(err) => {
                    error!(%err, "failed to read player servers, answer is partial");
                    break;
                }
            }
        }
        servers
    }

    /// Which other live proxy lists this player as connected, if any.
    pub async fn find_owning_proxy(&self, player: Uuid) -> Result<Option<String>> {
        let member = player.to_string();
        for proxy in self.membership.other_live_proxies().await {
            if self
                .store
                .sismember(&keys::proxy_players(&proxy), &member)
                .await?
            {
                return Ok(Some(proxy));
            }
        }
        Ok(None)
    }

    /// Raw members of this proxy's stored online set.
    pub async fn stored_members(&self) -> Result<HashSet<String>> {
        Ok(self.store.smembers(&self.own_set()).await?)
    }

    /// Remove a raw member from this proxy's stored set without touching the
    /// player record.
    pub async fn forget_member(&self, member: &str) -> Result<()> {
        self.store.srem(&self.own_set(), member).await?;
        Ok(())
    }

    /// Re-announce a locally connected player in the store.
    pub async fn restore_member(&self, player: Uuid) -> Result<()> {
        let key = keys::player(&player);
        self.store
            .sadd(&self.own_set(), &player.to_string())
            .await?;
        self.store.hset(&key, keys::FIELD_ONLINE, "0").await?;
        self.store
            .hset(&key, keys::FIELD_PROXY, &self.proxy_id)
            .await?;
        if let Some(local) = self.roster.get(&player).await {
            self.store
                .hset(&key, keys::FIELD_IP, &local.ip.to_string())
                .await?;
            if let Some(server) = local.server {
                self.store.hset(&key, keys::FIELD_SERVER, &server).await?;
            }
        }
        Ok(())
    }
}
