use std::collections::HashMap;

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::keys;

/// Minecraft player name - max 16 characters, stored inline (no heap allocation).
pub type PlayerName = ArrayString<16>;

/// When a player was last seen, as stored in the `online` field of their record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastOnline {
  /// Connected to some proxy right now (stored as `0`).
  Online,
  /// Last disconnected at this unix timestamp in milliseconds.
  Seen(i64),
  /// No record of this player ever connecting.
  Never,
}

impl LastOnline {
  /// Value reported to callers for a player that was never seen.
  pub const NEVER: i64 = -1;

  /// Parse a stored `online` field. Returns `None` for values that are not a
  /// non-negative integer, which callers treat as corruption.
  pub fn from_stored(raw: &str) -> Option<Self> {
    match raw.trim().parse::<i64>().ok()? {
      0 => Some(Self::Online),
      t if t > 0 => Some(Self::Seen(t)),
      _ => None,
    }
  }

  /// Wire representation: `0` online, millis for last seen, `-1` never.
  pub fn as_millis(self) -> i64 {
    match self {
      Self::Online => 0,
      Self::Seen(t) => t,
      Self::Never => Self::NEVER,
    }
  }

  pub fn is_online(self) -> bool {
    matches!(self, Self::Online)
  }
}

/// A player's shared record, as read back from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerRecord {
  /// Backend server the player is attached to
  pub server: Option<String>,
  /// Last known client address, unparsed
  pub ip: Option<String>,
  /// Proxy that owns the player's session
  pub proxy: Option<String>,
  /// Raw `online` field; see [`LastOnline::from_stored`]
  pub online: Option<String>,
}

impl PlayerRecord {
  pub fn from_fields(mut fields: HashMap<String, String>) -> Self {
    Self {
      server: fields.remove(keys::FIELD_SERVER),
      ip: fields.remove(keys::FIELD_IP),
      proxy: fields.remove(keys::FIELD_PROXY),
      online: fields.remove(keys::FIELD_ONLINE),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.server.is_none() && self.ip.is_none() && self.proxy.is_none() && self.online.is_none()
  }
}

/// A persisted name <-> id mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationEntry {
  /// Name exactly as it was first resolved
  pub name: PlayerName,
  pub id: Uuid,
  /// Unix timestamp (millis) of the last time this mapping was confirmed
  pub updated_at: i64,
}

impl TranslationEntry {
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string(self).map_err(|e| StoreError::Malformed {
      key: keys::translation_by_id(&self.id),
      reason: e.to_string(),
    })
  }

  pub fn from_json(key: &str, raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| StoreError::Malformed {
      key: key.to_string(),
      reason: e.to_string(),
    })
  }
}
