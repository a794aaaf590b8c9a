use crate::AppState;
use crate::commands::AdminCommand;
use crate::error::AppError;
use crate::helpers::{format_last_seen, hash_api_token};
use crate::validation;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::TypedHeader;
use axum_macros::debug_handler;
use headers::Authorization;
use headers::authorization::Bearer;
use herald_store::LastOnline;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

type Auth = Option<TypedHeader<Authorization<Bearer>>>;

/// Mutating routes need the bearer token when one is configured.
fn authorize(state: &AppState, auth: &Auth) -> Result<(), AppError> {
    let Some(expected) = &state.api_token_hash else {
        return Ok(());
    };
    match auth {
        Some(TypedHeader(auth)) if hash_api_token(auth.token()) == *expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

/// 503 once the service has stopped or lost its bus subscription.
pub(crate) async fn health(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.herald.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

// ============================================================================
// Presence events
// ============================================================================

#[derive(Deserialize)]
pub(crate) struct ConnectRequest {
    uuid: String,
    name: String,
    ip: IpAddr,
}

#[derive(Deserialize)]
pub(crate) struct PlayerRequest {
    uuid: String,
}

#[derive(Deserialize)]
pub(crate) struct ServerChangeRequest {
    uuid: String,
    server: String,
}

#[debug_handler]
pub(crate) async fn connect(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(payload): Json<ConnectRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    let player = validation::parse_player_id(&payload.uuid)?;
    validation::validate_player_name(&payload.name)?;

    if let Some(proxy) = state.herald.find_owning_proxy(player).await? {
        return Err(AppError::Conflict(format!(
            "{} is already logged on to proxy {proxy}",
            payload.name
        )));
    }

    state
        .herald
        .player_connected(player, &payload.name, payload.ip)
        .await?;

    Ok(StatusCode::OK)
}

pub(crate) async fn disconnect(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(payload): Json<PlayerRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    let player = validation::parse_player_id(&payload.uuid)?;

    state.herald.player_disconnected(player).await?;

    Ok(StatusCode::OK)
}

pub(crate) async fn server_change(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(payload): Json<ServerChangeRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    let player = validation::parse_player_id(&payload.uuid)?;
    validation::validate_server_name(&payload.server)?;

    if !state
        .herald
        .player_changed_server(player, &payload.server)
        .await?
    {
        return Err(AppError::NotFound("Player is not connected to this proxy"));
    }

    Ok(StatusCode::OK)
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Serialize)]
pub(crate) struct CountResponse {
    count: usize,
}

#[derive(Serialize)]
pub(crate) struct PlayersResponse<T> {
    players: Vec<T>,
}

#[derive(Serialize)]
pub(crate) struct LastOnlineResponse {
    online: bool,
    /// Millis since the epoch, 0 while online, -1 if never seen
    last_online: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct IpResponse {
    ip: IpAddr,
}

#[derive(Serialize)]
pub(crate) struct ProxiesResponse {
    proxy_id: String,
    live: Vec<String>,
}

pub(crate) async fn count(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let count = state.herald.player_count().await?;
    Ok(Json(CountResponse { count }))
}

pub(crate) async fn local_count(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(CountResponse {
        count: state.herald.local_player_count(),
    })
}

pub(crate) async fn players(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let players: BTreeSet<Uuid> = state.herald.online_players().await.into_iter().collect();
    Json(PlayersResponse {
        players: players.into_iter().collect(),
    })
}

pub(crate) async fn player_names(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PlayersResponse {
        players: state.herald.human_players_online().await,
    })
}

pub(crate) async fn player_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let player = validation::parse_player_id(&id)?;
    let location = state
        .herald
        .player_location(player)
        .await
        .ok_or(AppError::NotFound("Player is not online"))?;
    Ok(Json(location))
}

pub(crate) async fn last_online(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let player = validation::parse_player_id(&id)?;
    let last_online = state.herald.last_online(player).await?;
    let last_seen = match last_online {
        LastOnline::Seen(at) => Some(format_last_seen(at)),
        LastOnline::Online | LastOnline::Never => None,
    };
    Ok(Json(LastOnlineResponse {
        online: last_online.is_online(),
        last_online: last_online.as_millis(),
        last_seen,
    }))
}

pub(crate) async fn player_ip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let player = validation::parse_player_id(&id)?;
    let ip = state
        .herald
        .player_ip(player)
        .await
        .ok_or(AppError::NotFound("Player is not online"))?;
    Ok(Json(IpResponse { ip }))
}

pub(crate) async fn server_players(
    State(state): State<Arc<AppState>>,
    Path(server): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_server_name(&server)?;
    let players = state
        .herald
        .players_on_server(&server)
        .await
        .ok_or(AppError::NotFound("Unknown server"))?;
    Ok(Json(PlayersResponse {
        players: players.into_iter().collect(),
    }))
}

pub(crate) async fn proxies(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ProxiesResponse {
        proxy_id: state.herald.proxy_id().to_string(),
        live: state.herald.live_proxies().await,
    })
}

// ============================================================================
// Translation
// ============================================================================

#[derive(Deserialize)]
pub(crate) struct LookupParams {
    #[serde(default)]
    expensive: bool,
}

#[derive(Serialize)]
pub(crate) struct TranslationResponse {
    id: Uuid,
    name: String,
}

pub(crate) async fn translate_name(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<LookupParams>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_player_name(&name)?;
    let id = state
        .herald
        .name_to_id(&name, params.expensive)
        .await
        .ok_or(AppError::NotFound("Unknown player name"))?;
    Ok(Json(TranslationResponse { id, name }))
}

pub(crate) async fn translate_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LookupParams>,
) -> Result<impl IntoResponse, AppError> {
    let id = validation::parse_player_id(&id)?;
    let name = state
        .herald
        .id_to_name(id, params.expensive)
        .await
        .ok_or(AppError::NotFound("Unknown player id"))?;
    Ok(Json(TranslationResponse { id, name }))
}

// ============================================================================
// Commands and channels
// ============================================================================

#[derive(Deserialize)]
pub(crate) struct ProxyCommandRequest {
    target: String,
    command: String,
}

#[derive(Serialize)]
pub(crate) struct ProxyCommandResponse {
    delivered: usize,
}

#[derive(Deserialize)]
pub(crate) struct ChannelRequest {
    channel: String,
}

#[derive(Deserialize)]
pub(crate) struct AdminRequest {
    command: String,
}

#[derive(Serialize)]
pub(crate) struct AdminResponse {
    lines: Vec<String>,
}

pub(crate) async fn proxy_command(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(payload): Json<ProxyCommandRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    let delivered = state
        .herald
        .send_proxy_command(&payload.target, &payload.command)
        .await?;
    Ok(Json(ProxyCommandResponse { delivered }))
}

pub(crate) async fn add_channel(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(payload): Json<ChannelRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    state.herald.add_channel(&payload.channel).await?;
    Ok(StatusCode::CREATED)
}

pub(crate) async fn remove_channel(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(channel): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    state.herald.remove_channel(&channel).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn admin(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(payload): Json<AdminRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    let command: AdminCommand = payload
        .command
        .parse()
        .map_err(|e: crate::commands::CommandError| AppError::ValidationError(e.to_string()))?;
    let lines = command.execute(&state.herald).await?;
    Ok(Json(AdminResponse { lines }))
}
