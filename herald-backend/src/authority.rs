//! External name authority consulted when neither memory nor the store know
//! a mapping.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::PresenceConfig;
use crate::error::{PresenceError, Result};

/// A profile as the authority reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
}

/// Authoritative source for name <-> id mappings. Calls are slow and rate
/// limited upstream; callers only reach for it when explicitly allowed.
#[async_trait]
pub trait NameAuthority: Send + Sync {
    async fn fetch_by_name(&self, name: &str) -> Result<Option<Profile>>;
    async fn fetch_by_id(&self, id: Uuid) -> Result<Option<Profile>>;
}

#[derive(Deserialize)]
struct ProfileResponse {
    id: String,
    name: String,
}

/// Mojang-style profile service over HTTP.
pub struct MojangAuthority {
    http: reqwest::Client,
    profile_api_url: String,
    session_api_url: String,
}

impl MojangAuthority {
    pub fn new(config: &PresenceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.lookup_timeout)
            .build()
            .map_err(|e| PresenceError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            profile_api_url: config.profile_api_url.trim_end_matches('/').to_string(),
            session_api_url: config.session_api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, url: String) -> Result<Option<Profile>> {
        debug!(%url, "querying profile service");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PresenceError::Lookup(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(PresenceError::Lookup(format!("{url} returned {status}")));
            }
            _ => {}
        }

        let body: ProfileResponse = response
            .json()
            .await
            .map_err(|e| PresenceError::Lookup(format!("bad profile response: {e}")))?;
        parse_profile(body).map(Some)
    }
}

fn parse_profile(body: ProfileResponse) -> Result<Profile> {
    let id = Uuid::parse_str(&body.id)
        .map_err(|_| PresenceError::Lookup(format!("bad profile id {:?}", body.id)))?;
    Ok(Profile {
        id,
        name: body.name,
    })
}

#[async_trait]
impl NameAuthority for MojangAuthority {
    async fn fetch_by_name(&self, name: &str) -> Result<Option<Profile>> {
        self.fetch(format!("{}/{}", self.profile_api_url, name))
            .await
    }

    async fn fetch_by_id(&self, id: Uuid) -> Result<Option<Profile>> {
        self.fetch(format!("{}/{}", self.session_api_url, id.simple()))
            .await
    }
}
