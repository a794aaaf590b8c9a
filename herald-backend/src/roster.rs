use std::collections::HashSet;
use std::net::IpAddr;

use scc::HashMap;
use uuid::Uuid;

/// A player connected to this proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPlayer {
    pub ip: IpAddr,
    pub server: Option<String>,
    pub connected_at: i64,
}

/// In-memory list of the players connected to this proxy. This is the local
/// source of truth; the store-side set is reconciled against it.
pub struct Roster {
    players: HashMap<Uuid, LocalPlayer>,
}

impl Roster {
    pub fn new() -> Self {
        Self {
            players: HashMap::new(),
        }
    }

    /// Record a connection. Returns false if the player was already here, in
    /// which case only the address is refreshed.
    pub async fn connect(&self, player: Uuid, ip: IpAddr, now: i64) -> bool {
        if self
            .players
            .update_async(&player, |_, existing| existing.ip = ip)
            .await
            .is_some()
        {
            return false;
        }
        self.players
            .insert_async(
                player,
                LocalPlayer {
                    ip,
                    server: None,
                    connected_at: now,
                },
            )
            .await
            .is_ok()
    }

    pub async fn disconnect(&self, player: &Uuid) -> Option<LocalPlayer> {
        self.players.remove_async(player).await.map(|(_, p)| p)
    }

    /// Returns false if the player is not connected here.
    pub async fn set_server(&self, player: &Uuid, server: &str) -> bool {
        self.players
            .update_async(player, |_, p| p.server = Some(server.to_string()))
            .await
            .is_some()
    }

    pub async fn get(&self, player: &Uuid) -> Option<LocalPlayer> {
        self.players.read_async(player, |_, p| p.clone()).await
    }

    pub async fn contains(&self, player: &Uuid) -> bool {
        self.players.read_async(player, |_, _| ()).await.is_some()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Copy of every connected player.
    pub async fn snapshot(&self) -> Vec<(Uuid, LocalPlayer)> {
        let mut out = Vec::with_capacity(self.players.len());
        self.players
            .retain_async(|id, player| {
                out.push((*id, player.clone()));
                true
            })
            .await;
        out
    }

    pub async fn ids(&self) -> HashSet<Uuid> {
        self.snapshot().await.into_iter().map(|(id, _)| id).collect()
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}
