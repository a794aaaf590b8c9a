pub mod authority;
pub mod bus;
pub mod commands;
pub mod config;
pub mod directory;
mod error;
pub mod events;
pub mod helpers;
pub mod herald;
pub mod host;
pub mod membership;
pub mod reconcile;
pub mod roster;
mod routes;
pub mod translator;
mod validation;

pub use error::{AppError, ErrorResponse, PresenceError, Result};
pub use herald::Herald;
pub use validation::ValidationError;

use axum::{
    Router,
    http::StatusCode,
    routing::{delete, get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

pub struct AppState {
    pub herald: Arc<Herald>,
    /// SHA-256 of the bearer token, if mutating routes are protected
    pub api_token_hash: Option<String>,
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per second for presence event endpoints
    pub events_per_sec: u64,
    /// Burst size for presence event endpoints
    pub events_burst: u32,
    /// Requests per second for query and command endpoints
    pub general_per_sec: u64,
    /// Burst size for query and command endpoints
    pub general_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            events_per_sec: 200,
            events_burst: 500,
            general_per_sec: 20,
            general_burst: 50,
        }
    }
}

/// Create the application router around a running presence service
pub fn create_app(
    herald: Arc<Herald>,
    api_token_hash: Option<String>,
    request_body_limit: usize,
    request_timeout: Duration,
    rate_limit: RateLimitConfig,
) -> Router {
    let state = Arc::new(AppState {
        herald,
        api_token_hash,
    });

    // Lenient rate limit for presence events - a whole lobby can join at once
    let events_governor = GovernorConfigBuilder::default()
        .per_second(rate_limit.events_per_sec.max(1))
        .burst_size(rate_limit.events_burst.max(1))
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("rate limit values are non-zero");

    let general_governor = GovernorConfigBuilder::default()
        .per_second(rate_limit.general_per_sec.max(1))
        .burst_size(rate_limit.general_burst.max(1))
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("rate limit values are non-zero");

    let event_routes = Router::new()
        .route("/events/connect", post(routes::connect))
        .route("/events/disconnect", post(routes::disconnect))
        .route("/events/server", post(routes::server_change))
        .layer(GovernorLayer::new(events_governor));

    let general_routes = Router::new()
        .route("/count", get(routes::count))
        .route("/count/local", get(routes::local_count))
        .route("/players", get(routes::players))
        .route("/players/names", get(routes::player_names))
        .route("/players/{id}", get(routes::player_location))
        .route("/players/{id}/last-online", get(routes::last_online))
        .route("/players/{id}/ip", get(routes::player_ip))
        .route("/servers/{server}/players", get(routes::server_players))
        .route("/proxies", get(routes::proxies))
        .route("/proxies/command", post(routes::proxy_command))
        .route("/translate/name/{name}", get(routes::translate_name))
        .route("/translate/id/{id}", get(routes::translate_id))
        .route("/channels", post(routes::add_channel))
        .route("/channels/{channel}", delete(routes::remove_channel))
        .route("/admin", post(routes::admin))
        .layer(GovernorLayer::new(general_governor));

    Router::new()
        .route("/health", get(routes::health))
        .merge(event_routes)
        .merge(general_routes)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(RequestBodyLimitLayer::new(request_body_limit))
        .with_state(state)
}
