//! Key schema shared by every proxy in the fleet.
//!
//! All proxies must agree on these names, so they live next to the store
//! client rather than in the service crate.

use uuid::Uuid;

/// Hash of `proxy id -> last heartbeat (unix seconds)`.
pub const HEARTBEATS: &str = "heartbeats";

/// Hash of `proxy id -> local online player count`.
pub const PLAYER_COUNTS: &str = "playerCounts";

pub const FIELD_SERVER: &str = "server";
pub const FIELD_IP: &str = "ip";
pub const FIELD_ONLINE: &str = "online";
pub const FIELD_PROXY: &str = "proxy";

/// Per-player hash holding `server`, `ip`, `online` and `proxy`.
pub fn player(id: &Uuid) -> String {
  format!("player:{id}")
}

/// Per-proxy set of player ids currently connected to that proxy.
pub fn proxy_players(proxy_id: &str) -> String {
  format!("proxy:{proxy_id}:usersOnline")
}

/// Translation entry looked up by name. Names are folded to lowercase so the
/// persisted mapping is shared regardless of how a caller spells the name.
pub fn translation_by_name(name: &str) -> String {
  format!("uuid-cache:name:{}", name.to_lowercase())
}

/// Translation entry looked up by id.
pub fn translation_by_id(id: &Uuid) -> String {
  format!("uuid-cache:uuid:{id}")
}
