//! The running presence service: owns the directory, membership, translator
//! and bus, and the background tasks that keep them current.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use herald_store::{LastOnline, Store};
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::authority::NameAuthority;
use crate::bus::{Bus, Channels};
use crate::config::PresenceConfig;
use crate::directory::{Directory, PlayerLocation};
use crate::error::{PresenceError, Result};
use crate::events::NetworkEvent;
use crate::helpers::Clock;
use crate::host::ProxyHost;
use crate::membership::Membership;
use crate::reconcile::{Reconciler, SweepReport};
use crate::roster::Roster;
use crate::translator::Translator;
use crate::validation::validate_proxy_id;

pub struct Herald {
    config: PresenceConfig,
    host: Arc<dyn ProxyHost>,
    directory: Arc<Directory>,
    membership: Arc<Membership>,
    reconciler: Arc<Reconciler>,
    translator: Arc<Translator>,
    bus: Arc<Bus>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl Herald {
    /// Join the fleet: claim the proxy id, clear anything a previous run of
    /// this id left behind, then start the heartbeat, reconciliation and bus
    /// tasks.
    pub async fn start(
        config: PresenceConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        host: Arc<dyn ProxyHost>,
        authority: Option<Arc<dyn NameAuthority>>,
    ) -> Result<Arc<Self>> {
        validate_proxy_id(&config.proxy_id).map_err(|e| {
            PresenceError::Configuration(format!("invalid proxy id {:?}: {e}", config.proxy_id))
        })?;
        store.ping().await?;

        let roster = Arc::new(Roster::new());
        let membership = Arc::new(Membership::new(
            config.proxy_id.clone(),
            store.clone(),
            clock.clone(),
            roster.clone(),
            config.liveness_window,
        ));
        membership.claim(config.crash_recovery).await?;

        let channels = Channels::new(config.channel_prefix.as_str(), config.proxy_id.as_str());
        let directory = Arc::new(Directory::new(
            store.clone(),
            clock.clone(),
            roster,
            membership.clone(),
            channels.firehose(),
        ));

        let leftovers = clean_leftovers(&directory).await?;
        if leftovers > 0 {
            warn!(count = leftovers, "cleaned up players left over from a previous run");
        }

        // Subscribe before the first heartbeat so a failure here leaves
        // nothing behind that would block a restart
        let (bus, listener) = Bus::open(
            channels,
            store.clone(),
            membership.clone(),
            host.clone(),
            config.bus_workers,
        )
        .await?;
        if let Err(err) = membership.beat().await {
            if let Err(release_err) = membership.release().await {
                error!(%release_err, "failed to remove partial heartbeat");
            }
            return Err(err);
        }
        membership.tick().await;

        let translator = Arc::new(Translator::new(store, clock, authority));

        let herald = Arc::new(Self {
            reconciler: Arc::new(Reconciler::new(directory.clone())),
            config,
            host,
            directory,
            membership,
            translator,
            bus,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        });

        herald.tracker.spawn(heartbeat_loop(
            herald.membership.clone(),
            herald.config.heartbeat_interval,
            herald.cancel.clone(),
        ));
        herald.tracker.spawn(reconcile_loop(
            herald.reconciler.clone(),
            herald.config.reconcile_interval,
            herald.cancel.clone(),
        ));
        herald.tracker.spawn(herald.bus.clone().run(
            listener,
            herald.cancel.clone(),
            herald.tracker.clone(),
        ));

        info!(proxy = %herald.config.proxy_id, "joined the fleet");
        Ok(herald)
    }

    /// Leave the fleet. Stops the background tasks, waits for in-flight
    /// work, then removes this proxy's heartbeat, count and players. Only
    /// the first call does anything.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(proxy = %self.config.proxy_id, "leaving the fleet");

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        if let Err(err) = self.membership.release().await {
            error!(%err, "failed to remove heartbeat");
        }
        match clean_leftovers(&self.directory).await {
            Ok(count) => debug!(count, "released players on shutdown"),
            Err(err) => error!(%err, "failed to release players on shutdown"),
        }
        info!("shutdown complete");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Running and receiving from the bus.
    pub fn is_healthy(&self) -> bool {
        !self.is_stopped() && self.bus.is_listening()
    }

    pub fn proxy_id(&self) -> &str {
        &self.config.proxy_id
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    // ========================================================================
    // Presence events from the host
    // ========================================================================

    /// A player finished logging in to this proxy.
    pub async fn player_connected(&self, player: Uuid, name: &str, ip: IpAddr) -> Result<()> {
        self.translator.observe(name, player).await;
        self.directory.record_connect(player, ip).await
    }

    pub async fn player_disconnected(&self, player: Uuid) -> Result<()> {
        self.directory.record_disconnect(player).await
    }

    pub async fn player_changed_server(&self, player: Uuid, server: &str) -> Result<bool> {
        self.directory.record_server_change(player, server).await
    }

    /// Which other live proxy already has this player, if any. Hosts use it
    /// to refuse a second login.
    pub async fn find_owning_proxy(&self, player: Uuid) -> Result<Option<String>> {
        self.directory.find_owning_proxy(player).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn player_count(&self) -> Result<usize> {
        self.directory.query_global_count().await
    }

    /// Count as of the last heartbeat tick.
    pub async fn cached_player_count(&self) -> usize {
        self.membership.cached_global_count().await
    }

    pub fn local_player_count(&self) -> usize {
        self.directory.local_count()
    }

    pub async fn online_players(&self) -> HashSet<Uuid> {
        self.directory.query_online_players().await
    }

    /// Names of every online player the translator knows without an external
    /// lookup, sorted.
    pub async fn human_players_online(&self) -> Vec<String> {
        let mut names = Vec::new();
        for player in self.online_players().await {
            if let Some(name) = self.translator.resolve_id_to_name(player, false).await {
                names.push(name);
            }
        }
        names.sort_by_key(|name| name.to_lowercase());
        names
    }

    pub async fn server_to_players(&self) -> BTreeMap<String, BTreeSet<Uuid>> {
        self.directory.query_server_to_players().await
    }

    /// Players on one backend server, or `None` if the host has no such
    /// server.
    pub async fn players_on_server(&self, server: &str) -> Option<BTreeSet<Uuid>> {
        if !self.host.has_server(server) {
            return None;
        }
        Some(
            self.server_to_players()
                .await
                .remove(server)
                .unwrap_or_default(),
        )
    }

    pub async fn player_location(&self, player: Uuid) -> Option<PlayerLocation> {
        self.directory.query_player_location(player).await
    }

    pub async fn last_online(&self, player: Uuid) -> Result<LastOnline> {
        self.directory.query_last_online(player).await
    }

    pub async fn is_player_online(&self, player: Uuid) -> bool {
        self.directory.is_player_online(player).await
    }

    pub async fn player_ip(&self, player: Uuid) -> Option<IpAddr> {
        self.directory.query_ip(player).await
    }

    pub async fn live_proxies(&self) -> Vec<String> {
        self.membership.live_proxies().await
    }

    /// `allow_expensive` is ignored when external lookups are disabled.
    pub async fn name_to_id(&self, name: &str, allow_expensive: bool) -> Option<Uuid> {
        self.translator
            .resolve_name_to_id(name, allow_expensive && self.config.expensive_lookups)
            .await
    }

    pub async fn id_to_name(&self, player: Uuid, allow_expensive: bool) -> Option<String> {
        self.translator
            .resolve_id_to_name(player, allow_expensive && self.config.expensive_lookups)
            .await
    }

    // ========================================================================
    // Bus
    // ========================================================================

    pub async fn send_proxy_command(&self, target: &str, command: &str) -> Result<usize> {
        self.bus.send_proxy_command(target, command).await
    }

    pub async fn add_channel(&self, channel: &str) -> Result<()> {
        self.bus.add_channel(channel).await
    }

    pub async fn remove_channel(&self, channel: &str) -> Result<()> {
        self.bus.remove_channel(channel).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.bus.subscribe_events()
    }

    // ========================================================================
    // Maintenance, normally driven by the background tasks
    // ========================================================================

    pub async fn tick(&self) {
        self.membership.tick().await;
    }

    pub async fn reconcile(&self) -> Result<SweepReport> {
        self.reconciler.sweep().await
    }
}

/// Release every member of this proxy's stored set. Malformed members are
/// dropped.
async fn clean_leftovers(directory: &Directory) -> Result<usize> {
    let members = directory.stored_members().await?;
    for member in &members {
        match Uuid::parse_str(member) {
            Ok(player) => directory.release_player(player).await?,
            Err(_) => directory.forget_member(member).await?,
        }
    }
    Ok(members.len())
}

async fn heartbeat_loop(membership: Arc<Membership>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Startup already ran the first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => membership.tick().await,
        }
    }
    debug!("heartbeat task stopped");
}

async fn reconcile_loop(reconciler: Arc<Reconciler>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = reconciler.sweep().await {
                    error!(%err, "reconciliation sweep failed, retrying next interval");
                }
            }
        }
    }
    debug!("reconciliation task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::ManualClock;
    use crate::host::StandaloneHost;
    use async_trait::async_trait;
    use herald_store::{MemoryStore, StoreError, Subscription, keys};
    use std::collections::HashMap;

    const START: i64 = 1_700_000_000_000;

    fn config(id: &str) -> PresenceConfig {
        PresenceConfig {
            proxy_id: id.to_string(),
            ..PresenceConfig::default()
        }
    }

    async fn start(id: &str, store: &MemoryStore, clock: &Arc<ManualClock>) -> Result<Arc<Herald>> {
        Herald::start(
            config(id),
            Arc::new(store.clone()),
            clock.clone(),
            Arc::new(StandaloneHost::new(["lobby", "survival"])),
            None,
        )
        .await
    }

    #[tokio::test]
    async fn test_start_registers_heartbeat() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(START));
        let herald = start("a", &store, &clock).await.unwrap();

        assert_eq!(
            store.hget(keys::HEARTBEATS, "a").await.unwrap(),
            Some((START / 1000).to_string())
        );
        assert_eq!(
            store.hget(keys::PLAYER_COUNTS, "a").await.unwrap().as_deref(),
            Some("0")
        );
        assert_eq!(herald.live_proxies().await, vec!["a".to_string()]);
        herald.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_bad_id_and_dead_store() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(START));

        assert!(matches!(
            start("", &store, &clock).await,
            Err(PresenceError::Configuration(_))
        ));

        store.set_offline(true);
        assert!(matches!(
            start("a", &store, &clock).await,
            Err(PresenceError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_imposter_detection_and_expiry() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(START));
        let first = start("a", &store, &clock).await.unwrap();

        clock.advance(Duration::from_secs(5));
        assert!(matches!(
            start("a", &store, &clock).await,
            Err(PresenceError::ImposterInstance { proxy_id }) if proxy_id == "a"
        ));

        // crash recovery overrides the check
        let recovered = Herald::start(
            PresenceConfig {
                crash_recovery: true,
                ..config("a")
            },
            Arc::new(store.clone()),
            clock.clone(),
            Arc::new(StandaloneHost::default()),
            None,
        )
        .await
        .unwrap();
        recovered.shutdown().await;
        first.shutdown().await;

        // a stale heartbeat does not block startup
        store
            .hset(keys::HEARTBEATS, "a", &(START / 1000).to_string())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(31));
        let restarted = start("a", &store, &clock).await.unwrap();
        restarted.shutdown().await;
    }

    /// Works like the shared store except that subscriptions are refused.
    struct NoPubSub(MemoryStore);

    #[async_trait]
    impl Store for NoPubSub {
        async fn ping(&self) -> herald_store::Result<()> {
            self.0.ping().await
        }
        async fn get(&self, key: &str) -> herald_store::Result<Option<String>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> herald_store::Result<()> {
            self.0.set(key, value).await
        }
        async fn del(&self, key: &str) -> herald_store::Result<bool> {
            self.0.del(key).await
        }
        async fn hget(&self, key: &str, field: &str) -> herald_store::Result<Option<String>> {
            self.0.hget(key, field).await
        }
        async fn hset(&self, key: &str, field: &str, value: &str) -> herald_store::Result<()> {
            self.0.hset(key, field, value).await
        }
        async fn hdel(&self, key: &str, fields: &[&str]) -> herald_store::Result<usize> {
            self.0.hdel(key, fields).await
        }
        async fn hgetall(&self, key: &str) -> herald_store::Result<HashMap<String, String>> {
            self.0.hgetall(key).await
        }
        async fn sadd(&self, key: &str, member: &str) -> herald_store::Result<bool> {
            self.0.sadd(key, member).await
        }
        async fn srem(&self, key: &str, member: &str) -> herald_store::Result<bool> {
            self.0.srem(key, member).await
        }
        async fn smembers(&self, key: &str) -> herald_store::Result<HashSet<String>> {
            self.0.smembers(key).await
        }
        async fn sismember(&self, key: &str, member: &str) -> herald_store::Result<bool> {
            self.0.sismember(key, member).await
        }
        async fn publish(&self, channel: &str, payload: &str) -> herald_store::Result<usize> {
            self.0.publish(channel, payload).await
        }
        async fn subscribe(
            &self,
            _channels: &[String],
        ) -> herald_store::Result<Box<dyn Subscription>> {
            Err(StoreError::Connection("pub/sub refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_no_heartbeat() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(START));

        let err = Herald::start(
            config("a"),
            Arc::new(NoPubSub(store.clone())),
            clock.clone(),
            Arc::new(StandaloneHost::default()),
            None,
        )
        .await
        .err()
        .expect("start should fail without pub/sub");
        assert!(matches!(err, PresenceError::Store(_)));
        assert!(store.hget(keys::HEARTBEATS, "a").await.unwrap().is_none());

        // an immediate restart is not mistaken for a second instance
        clock.advance(Duration::from_secs(1));
        let herald = start("a", &store, &clock).await.unwrap();
        herald.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_follows_bus_subscription() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(START));
        let herald = start("a", &store, &clock).await.unwrap();
        assert!(herald.is_healthy());

        store.set_offline(true);
        tokio::time::timeout(Duration::from_secs(5), async {
            while herald.is_healthy() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        store.set_offline(false);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !herald.is_healthy() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        herald.shutdown().await;
        assert!(!herald.is_healthy());
    }

    #[tokio::test]
    async fn test_startup_cleans_previous_run() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(START));
        let player = Uuid::new_v4();
        store
            .sadd(&keys::proxy_players("a"), &player.to_string())
            .await
            .unwrap();
        store
            .hset(&keys::player(&player), keys::FIELD_ONLINE, "0")
            .await
            .unwrap();
        store
            .hset(&keys::player(&player), keys::FIELD_SERVER, "lobby")
            .await
            .unwrap();
        store.hset(keys::PLAYER_COUNTS, "a", "12").await.unwrap();

        let herald = start("a", &store, &clock).await.unwrap();

        assert!(
            store
                .smembers(&keys::proxy_players("a"))
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(herald.last_online(player).await.unwrap(), LastOnline::Seen(START));
        assert_eq!(herald.player_count().await.unwrap(), 0);
        herald.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_runs_once_and_cleans_up() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(START));
        let herald = start("a", &store, &clock).await.unwrap();
        let player = Uuid::new_v4();
        herald
            .player_connected(player, "Steve", "10.0.0.5".parse().unwrap())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(2));
        herald.shutdown().await;
        herald.shutdown().await;

        assert!(herald.is_stopped());
        assert!(store.hget(keys::HEARTBEATS, "a").await.unwrap().is_none());
        assert!(store.hget(keys::PLAYER_COUNTS, "a").await.unwrap().is_none());
        assert!(
            store
                .smembers(&keys::proxy_players("a"))
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            store
                .hget(&keys::player(&player), keys::FIELD_ONLINE)
                .await
                .unwrap(),
            Some((START + 2_000).to_string())
        );
        // nothing listens on our channels any more
        assert_eq!(store.publish("herald-a", "say hi").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_players_on_server_requires_known_server() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(START));
        let herald = start("a", &store, &clock).await.unwrap();
        let player = Uuid::new_v4();
        herald
            .player_connected(player, "Alex", "10.0.0.6".parse().unwrap())
            .await
            .unwrap();
        herald.player_changed_server(player, "lobby").await.unwrap();

        assert_eq!(
            herald.players_on_server("lobby").await,
            Some(BTreeSet::from([player]))
        );
        assert_eq!(herald.players_on_server("survival").await, Some(BTreeSet::new()));
        assert_eq!(herald.players_on_server("nowhere").await, None);
        assert_eq!(herald.human_players_online().await, vec!["Alex".to_string()]);
        herald.shutdown().await;
    }
}
