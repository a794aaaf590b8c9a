//! Name <-> id translation with three tiers: process memory, the shared
//! store, and the external authority.
//!
//! Every hit is written back to the tiers below it, so the next lookup on
//! any proxy is cheap. The newest mapping wins: when a name turns up with a
//! different id the old pairing is dropped.

use std::sync::Arc;

use herald_store::{PlayerName, Store, TranslationEntry, keys};
use scc::HashMap;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::authority::{NameAuthority, Profile};
use crate::helpers::Clock;

pub struct Translator {
    /// Keyed by lowercase name
    by_name: HashMap<String, TranslationEntry>,
    by_id: HashMap<Uuid, TranslationEntry>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    authority: Option<Arc<dyn NameAuthority>>,
}

impl Translator {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        authority: Option<Arc<dyn NameAuthority>>,
    ) -> Self {
        Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            store,
            clock,
            authority,
        }
    }

    /// Resolve a player name to an id. Without `allow_expensive` the name
    /// must match the cached spelling exactly and the authority is never
    /// consulted.
    pub async fn resolve_name_to_id(&self, name: &str, allow_expensive: bool) -> Option<Uuid> {
        let folded = name.to_lowercase();
        let accept = |entry: &TranslationEntry| allow_expensive || entry.name.as_str() == name;

        if let Some(entry) = self.by_name.read_async(&folded, |_, e| e.clone()).await {
            if accept(&entry) {
                return Some(entry.id);
            }
        }

        let key = keys::translation_by_name(name);
        match self.load(&key).await {
            Some(entry) if accept(&entry) => {
                self.remember(entry.clone()).await;
                return Some(entry.id);
            }
            _ => {}
        }

        if !allow_expensive {
            return None;
        }
        let authority = self.authority.as_ref()?;
        match authority.fetch_by_name(name).await {
            Ok(Some(profile)) => self.adopt(profile).await.map(|entry| entry.id),
            Ok(None) => {
                debug!(name, "authority does not know this name");
                None
            }
            Err(err) => {
                error!(%err, name, "name lookup failed");
                None
            }
        }
    }

    /// Resolve an id to the player's name.
    pub async fn resolve_id_to_name(&self, id: Uuid, allow_expensive: bool) -> Option<String> {
        if let Some(name) = self.by_id.read_async(&id, |_, e| e.name.to_string()).await {
            return Some(name);
        }

        if let Some(entry) = self.load(&keys::translation_by_id(&id)).await {
            if entry.id == id {
                let name = entry.name.to_string();
                self.remember(entry).await;
                return Some(name);
            }
        }

        if !allow_expensive {
            return None;
        }
        let authority = self.authority.as_ref()?;
        match authority.fetch_by_id(id).await {
            Ok(Some(profile)) => self.adopt(profile).await.map(|entry| entry.name.to_string()),
            Ok(None) => {
                debug!(%id, "authority does not know this id");
                None
            }
            Err(err) => {
                error!(%err, %id, "id lookup failed");
                None
            }
        }
    }

    /// Record a mapping observed first-hand, e.g. a player logging in.
    pub async fn observe(&self, name: &str, id: Uuid) {
        let Ok(name) = PlayerName::from(name) else {
            warn!(name, %id, "ignoring overlong player name");
            return;
        };
        self.remember(TranslationEntry {
            name,
            id,
            updated_at: self.clock.now_millis(),
        })
        .await;
    }

    async fn adopt(&self, profile: Profile) -> Option<TranslationEntry> {
        let Ok(name) = PlayerName::from(profile.name.as_str()) else {
            warn!(name = %profile.name, id = %profile.id, "authority returned an overlong name");
            return None;
        };
        let entry = TranslationEntry {
            name,
            id: profile.id,
            updated_at: self.clock.now_millis(),
        };
        self.remember(entry.clone()).await;
        Some(entry)
    }

    async fn load(&self, key: &str) -> Option<TranslationEntry> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                error!(%err, key, "failed to read translation from store");
                return None;
            }
        };
        match TranslationEntry::from_json(key, &raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(%err, "dropping corrupt translation entry");
                if let Err(err) = self.store.del(key).await {
                    error!(%err, key, "failed to drop corrupt translation entry");
                }
                None
            }
        }
    }

    /// Write a mapping into memory and the store, dropping stale pairings on
    /// either side of it.
    async fn remember(&self, mut entry: TranslationEntry) {
        let folded = entry.name.to_lowercase();

        // Keep the spelling from the first time we saw this pairing
        if let Some(known) = self.by_id.read_async(&entry.id, |_, e| e.clone()).await {
            if known.name.to_lowercase() == folded {
                entry.name = known.name;
            } else {
                debug!(id = %entry.id, old = %known.name, new = %entry.name, "player was renamed");
                self.forget_name(&known.name.to_lowercase(), entry.id).await;
            }
        }
        if let Some(previous) = self.by_name.read_async(&folded, |_, e| e.id).await {
            if previous != entry.id {
                debug!(name = %entry.name, old = %previous, new = %entry.id, "name moved to a new id");
                let _ = self.by_id.remove_async(&previous).await;
                self.delete_key(&keys::translation_by_id(&previous)).await;
            }
        }

        upsert(&self.by_name, folded, entry.clone()).await;
        upsert(&self.by_id, entry.id, entry.clone()).await;
        self.persist(&entry).await;
    }

    async fn forget_name(&self, folded: &str, id: Uuid) {
        let removed = self
            .by_name
            .remove_if_async(folded, |e| e.id == id)
            .await
            .is_some();
        if removed {
            self.delete_key(&keys::translation_by_name(folded)).await;
        }
    }

    async fn persist(&self, entry: &TranslationEntry) {
        let raw = match entry.to_json() {
            Ok(raw) => raw,
            Err(err) => {
                error!(%err, "failed to encode translation entry");
                return;
            }
        };
        for key in [
            keys::translation_by_name(&entry.name),
            keys::translation_by_id(&entry.id),
        ] {
            if let Err(err) = self.store.set(&key, &raw).await {
                error!(%err, %key, "failed to persist translation entry");
            }
        }
    }

    async fn delete_key(&self, key: &str) {
        if let Err(err) = self.store.del(key).await {
            error!(%err, key, "failed to delete translation entry");
        }
    }
}

async fn upsert<K, V>(map: &HashMap<K, V>, key: K, value: V)
where
    K: Eq + std::hash::Hash,
    V: Clone,
{
    let replacement = value.clone();
    if map
        .update_async(&key, move |_, v| *v = replacement)
        .await
        .is_none()
    {
        let _ = map.insert_async(key, value).await;
    }
}
