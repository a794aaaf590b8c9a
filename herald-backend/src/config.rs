use std::env::var;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::PresenceError;
use crate::helpers::hash_api_token;
use crate::validation::validate_proxy_id;

/// Settings consumed by the presence core.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// This proxy's fleet-unique id
    pub proxy_id: String,
    /// Skip the duplicate-instance check after a crash
    pub crash_recovery: bool,
    /// Prefix for the unicast, broadcast and firehose channels
    pub channel_prefix: String,
    pub heartbeat_interval: Duration,
    /// A proxy whose heartbeat is older than this is considered dead
    pub liveness_window: Duration,
    pub reconcile_interval: Duration,
    /// Concurrent pub/sub message handlers
    pub bus_workers: usize,
    /// Whether the translator may fall back to the external profile service
    pub expensive_lookups: bool,
    pub profile_api_url: String,
    pub session_api_url: String,
    pub lookup_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            proxy_id: "proxy-1".to_string(),
            crash_recovery: false,
            channel_prefix: "herald".to_string(),
            heartbeat_interval: Duration::from_secs(3),
            liveness_window: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(180),
            bus_workers: 16,
            expensive_lookups: true,
            profile_api_url: "https://api.mojang.com/users/profiles/minecraft".to_string(),
            session_api_url: "https://sessionserver.mojang.com/session/minecraft/profile"
                .to_string(),
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

/// Application configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Env: HERALD_PROXY_ID (required, non-empty)
    /// Env: HERALD_CRASH_RECOVERY (default: false)
    /// Env: HERALD_CHANNEL_PREFIX (default: "herald")
    /// Env: HERALD_HEARTBEAT_SECS (default: 3)
    /// Env: HERALD_LIVENESS_SECS (default: 30)
    /// Env: HERALD_RECONCILE_SECS (default: 180)
    /// Env: HERALD_BUS_WORKERS (default: 16)
    /// Env: HERALD_EXPENSIVE_LOOKUPS (default: true)
    /// Env: HERALD_PROFILE_API_URL, HERALD_SESSION_API_URL (default: Mojang)
    /// Env: HERALD_LOOKUP_TIMEOUT_SECS (default: 5)
    pub presence: PresenceConfig,

    /// Backend servers the host proxy knows about, used to validate
    /// server-change events
    /// Env: HERALD_SERVERS (comma separated, default: empty)
    pub servers: Vec<String>,

    /// SHA-256 of the bearer token required on mutating routes
    /// Env: HERALD_API_TOKEN (optional; routes are open when unset)
    pub api_token_hash: Option<String>,

    /// Request body size limit in bytes
    /// Env: REQUEST_BODY_LIMIT (default: 65536 = 64KB)
    pub request_body_limit: usize,

    /// Request timeout in seconds
    /// Env: REQUEST_TIMEOUT_SECS (default: 30)
    pub request_timeout: Duration,

    /// Server port
    /// Env: PORT (default: 3000)
    pub port: u16,

    /// Rate limit for presence event routes (requests per second)
    /// Env: RATE_LIMIT_EVENTS_PER_SEC (default: 200)
    /// Lenient since a whole lobby can join at once
    pub rate_limit_events_per_sec: u64,

    /// Burst size for presence event routes
    /// Env: RATE_LIMIT_EVENTS_BURST (default: 500)
    pub rate_limit_events_burst: u32,

    /// Rate limit for query and command routes (requests per second)
    /// Env: RATE_LIMIT_GENERAL_PER_SEC (default: 20)
    pub rate_limit_general_per_sec: u64,

    /// Burst size for query and command routes
    /// Env: RATE_LIMIT_GENERAL_BURST (default: 50)
    pub rate_limit_general_burst: u32,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Result<Self, PresenceError> {
        let _ = dotenv(); //for debugging mostly
        let defaults = PresenceConfig::default();

        let proxy_id = var("HERALD_PROXY_ID").unwrap_or_default();
        validate_proxy_id(&proxy_id).map_err(|e| {
            PresenceError::Configuration(format!("HERALD_PROXY_ID is missing or invalid: {e}"))
        })?;

        let presence = PresenceConfig {
            proxy_id,
            crash_recovery: env_or_default("HERALD_CRASH_RECOVERY", false),
            channel_prefix: env_or_default_string("HERALD_CHANNEL_PREFIX", &defaults.channel_prefix),
            heartbeat_interval: Duration::from_secs(env_or_default("HERALD_HEARTBEAT_SECS", 3)),
            liveness_window: Duration::from_secs(env_or_default("HERALD_LIVENESS_SECS", 30)),
            reconcile_interval: Duration::from_secs(env_or_default("HERALD_RECONCILE_SECS", 180)),
            bus_workers: env_or_default("HERALD_BUS_WORKERS", defaults.bus_workers).max(1),
            expensive_lookups: env_or_default("HERALD_EXPENSIVE_LOOKUPS", true),
            profile_api_url: env_or_default_string(
                "HERALD_PROFILE_API_URL",
                &defaults.profile_api_url,
            ),
            session_api_url: env_or_default_string(
                "HERALD_SESSION_API_URL",
                &defaults.session_api_url,
            ),
            lookup_timeout: Duration::from_secs(env_or_default("HERALD_LOOKUP_TIMEOUT_SECS", 5)),
        };

        if presence.heartbeat_interval >= presence.liveness_window {
            return Err(PresenceError::Configuration(
                "HERALD_HEARTBEAT_SECS must be shorter than HERALD_LIVENESS_SECS".to_string(),
            ));
        }

        Ok(Self {
            presence,
            servers: parse_list(&env_or_default_string("HERALD_SERVERS", "")),
            api_token_hash: var("HERALD_API_TOKEN")
                .ok()
                .filter(|token| !token.is_empty())
                .map(|token| hash_api_token(&token)),
            request_body_limit: env_or_default("REQUEST_BODY_LIMIT", 64 * 1024),
            request_timeout: Duration::from_secs(env_or_default("REQUEST_TIMEOUT_SECS", 30)),
            port: env_or_default("PORT", 3000),
            rate_limit_events_per_sec: env_or_default("RATE_LIMIT_EVENTS_PER_SEC", 200),
            rate_limit_events_burst: env_or_default("RATE_LIMIT_EVENTS_BURST", 500),
            rate_limit_general_per_sec: env_or_default("RATE_LIMIT_GENERAL_PER_SEC", 20),
            rate_limit_general_burst: env_or_default("RATE_LIMIT_GENERAL_BURST", 50),
        })
    }

    /// Create configuration with all default values
    pub fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            servers: Vec::new(),
            api_token_hash: None,
            request_body_limit: 64 * 1024, // 64 KB
            request_timeout: Duration::from_secs(30),
            port: 3000,
            rate_limit_events_per_sec: 200,
            rate_limit_events_burst: 500,
            rate_limit_general_per_sec: 20,
            rate_limit_general_burst: 50,
        }
    }
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable string or return default value
fn env_or_default_string(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
