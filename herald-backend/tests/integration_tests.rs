use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use herald_backend::config::{Config, PresenceConfig};
use herald_backend::helpers::{ManualClock, hash_api_token};
use herald_backend::host::StandaloneHost;
use herald_backend::{Herald, RateLimitConfig, create_app};
use herald_store::{MemoryStore, Store};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
// for `oneshot` method

const START: i64 = 1_700_000_000_000;
const STEVE: &str = "8667ba71-b85a-4004-af54-457a9734eed7";
const ALEX: &str = "ec561538-f3fd-461d-aff5-086b22154bce";

struct TestApp {
    router: axum::Router,
    herald: Arc<Herald>,
    store: MemoryStore,
    host: Arc<StandaloneHost>,
}

/// Helper to start a presence service on a fresh in-memory store
async fn setup(proxy_id: &str, api_token: Option<&str>) -> TestApp {
    setup_on(MemoryStore::new(), Arc::new(ManualClock::new(START)), proxy_id, api_token).await
}

async fn setup_on(
    store: MemoryStore,
    clock: Arc<ManualClock>,
    proxy_id: &str,
    api_token: Option<&str>,
) -> TestApp {
    let config = Config::default();
    let host = Arc::new(StandaloneHost::new(["lobby", "survival"]));
    let herald = Herald::start(
        PresenceConfig {
            proxy_id: proxy_id.to_string(),
            expensive_lookups: false,
            ..config.presence.clone()
        },
        Arc::new(store.clone()),
        clock,
        host.clone(),
        None,
    )
    .await
    .expect("Failed to start presence service");

    let router = create_app(
        herald.clone(),
        api_token.map(hash_api_token),
        config.request_body_limit,
        config.request_timeout,
        RateLimitConfig::default(),
    );
    TestApp {
        router,
        herald,
        store,
        host,
    }
}

/// Helper to send a request and get response
async fn send_request(
    app: &TestApp,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth_token: Option<&str>,
) -> (StatusCode, Value) {
    // The rate limiter keys on the client address
    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("x-forwarded-for", "127.0.0.1");

    if let Some(token) = auth_token {
        request_builder = request_builder.header("Authorization", format!("Bearer {}", token));
    }

    let request = if let Some(json_body) = body {
        request_builder
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&json_body).unwrap()))
            .unwrap()
    } else {
        request_builder.body(Body::empty()).unwrap()
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();

    let json = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(json!({}))
    };

    (status, json)
}

async fn connect(app: &TestApp, uuid: &str, name: &str) -> StatusCode {
    let (status, _) = send_request(
        app,
        "POST",
        "/events/connect",
        Some(json!({ "uuid": uuid, "name": name, "ip": "203.0.113.7" })),
        None,
    )
    .await;
    status
}

// =============================================================================
// HEALTH ENDPOINT TESTS
// =============================================================================

#[tokio::test]
async fn test_health_endpoint_returns_ok() {
    // GIVEN: A running service
    let app = setup("a", None).await;

    // WHEN: Making a GET request to /health
    let (status, _body) = send_request(&app, "GET", "/health", None, None).await;

    // THEN: Should return 200 OK
    assert_eq!(status, StatusCode::OK);
    app.herald.shutdown().await;
}

#[tokio::test]
async fn test_health_fails_while_bus_is_down() {
    // GIVEN: A running service whose store drops every subscription
    let app = setup("a", None).await;
    app.store.set_offline(true);

    // THEN: /health reports unavailable until the bus is back
    assert!(wait_for_health(&app, StatusCode::SERVICE_UNAVAILABLE).await);
    app.store.set_offline(false);
    assert!(wait_for_health(&app, StatusCode::OK).await);

    // AND: After shutdown it is unavailable for good
    app.herald.shutdown().await;
    let (status, _) = send_request(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

/// Poll /health until it answers `expected`, for up to five seconds
async fn wait_for_health(app: &TestApp, expected: StatusCode) -> bool {
    for _ in 0..500 {
        let (status, _) = send_request(app, "GET", "/health", None, None).await;
        if status == expected {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}

// =============================================================================
// PRESENCE EVENT TESTS
// =============================================================================

#[tokio::test]
async fn test_connect_then_query_location() {
    // GIVEN: A running service
    let app = setup("a", None).await;

    // WHEN: A player connects and moves to a server
    assert_eq!(connect(&app, STEVE, "Steve").await, StatusCode::OK);
    let (status, _) = send_request(
        &app,
        "POST",
        "/events/server",
        Some(json!({ "uuid": STEVE, "server": "lobby" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // THEN: Location, last-online, ip and counts reflect it
    let (status, body) = send_request(&app, "GET", &format!("/players/{STEVE}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "proxy": "a", "server": "lobby" }));

    let (_, body) = send_request(
        &app,
        "GET",
        &format!("/players/{STEVE}/last-online"),
        None,
        None,
    )
    .await;
    assert_eq!(body, json!({ "online": true, "last_online": 0 }));

    let (_, body) = send_request(&app, "GET", &format!("/players/{STEVE}/ip"), None, None).await;
    assert_eq!(body["ip"], "203.0.113.7");

    let (_, body) = send_request(&app, "GET", "/count", None, None).await;
    assert_eq!(body["count"], 1);

    let (_, body) = send_request(&app, "GET", "/players", None, None).await;
    assert_eq!(body["players"], json!([STEVE]));

    let (_, body) = send_request(&app, "GET", "/players/names", None, None).await;
    assert_eq!(body["players"], json!(["Steve"]));

    let (_, body) = send_request(&app, "GET", "/servers/lobby/players", None, None).await;
    assert_eq!(body["players"], json!([STEVE]));

    app.herald.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_records_last_seen() {
    // GIVEN: A connected player
    let app = setup("a", None).await;
    connect(&app, STEVE, "Steve").await;

    // WHEN: The player disconnects
    let (status, _) = send_request(
        &app,
        "POST",
        "/events/disconnect",
        Some(json!({ "uuid": STEVE })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // THEN: Last online is stamped with the disconnect time and location is gone
    let (_, body) = send_request(
        &app,
        "GET",
        &format!("/players/{STEVE}/last-online"),
        None,
        None,
    )
    .await;
    assert_eq!(body["online"], false);
    assert_eq!(body["last_online"], START);
    assert_eq!(body["last_seen"], "2023-11-14 22:13:20 UTC");

    let (status, _) = send_request(&app, "GET", &format!("/players/{STEVE}"), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = send_request(&app, "GET", "/count/local", None, None).await;
    assert_eq!(body["count"], 0);

    app.herald.shutdown().await;
}

#[tokio::test]
async fn test_never_seen_player() {
    let app = setup("a", None).await;

    let (status, body) =
        send_request(&app, "GET", &format!("/players/{ALEX}/last-online"), None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "online": false, "last_online": -1 }));
    app.herald.shutdown().await;
}

#[tokio::test]
async fn test_server_change_for_unknown_player_is_not_found() {
    let app = setup("a", None).await;

    let (status, body) = send_request(
        &app,
        "POST",
        "/events/server",
        Some(json!({ "uuid": ALEX, "server": "lobby" })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not connected"));
    app.herald.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_login_is_refused() {
    // GIVEN: Two proxies sharing a store, Steve is on B
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(START));
    let b = setup_on(store.clone(), clock.clone(), "b", None).await;
    let a = setup_on(store, clock, "a", None).await;
    assert_eq!(connect(&b, STEVE, "Steve").await, StatusCode::OK);

    // WHEN: Steve tries to log in through A
    let (status, body) = send_request(
        &a,
        "POST",
        "/events/connect",
        Some(json!({ "uuid": STEVE, "name": "Steve", "ip": "198.51.100.4" })),
        None,
    )
    .await;

    // THEN: A refuses the login
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("proxy b"));

    a.herald.shutdown().await;
    b.herald.shutdown().await;
}

// =============================================================================
// VALIDATION TESTS
// =============================================================================

#[tokio::test]
async fn test_invalid_inputs_rejected() {
    let app = setup("a", None).await;

    let (status, body) = send_request(&app, "GET", "/players/not-a-uuid", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = send_request(
        &app,
        "POST",
        "/events/connect",
        Some(json!({ "uuid": STEVE, "name": "bad name!", "ip": "203.0.113.7" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_request(&app, "GET", "/servers/nowhere/players", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.herald.shutdown().await;
}

#[tokio::test]
async fn test_store_outage_surfaces_as_unavailable() {
    // GIVEN: A connected player and then a store outage
    let app = setup("a", None).await;
    connect(&app, STEVE, "Steve").await;
    app.store.set_offline(true);

    // WHEN: Asking for the count, which does not degrade
    let (status, body) = send_request(&app, "GET", "/count", None, None).await;

    // THEN: 503 without internal details
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!body["error"].as_str().unwrap().contains("unreachable"));

    // AND: Reads fall back to local data
    let (status, body) = send_request(&app, "GET", "/players", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["players"], json!([STEVE]));

    // AND: Last-online is answered for local players but never guessed for others
    let (status, body) =
        send_request(&app, "GET", &format!("/players/{STEVE}/last-online"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["online"], true);
    let (status, _) =
        send_request(&app, "GET", &format!("/players/{ALEX}/last-online"), None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    app.store.set_offline(false);
    app.herald.shutdown().await;
}

// =============================================================================
// AUTH TESTS
// =============================================================================

#[tokio::test]
async fn test_mutating_routes_require_token_when_configured() {
    let app = setup("a", Some("s3cret")).await;
    let body = json!({ "uuid": STEVE, "name": "Steve", "ip": "203.0.113.7" });

    let (status, _) =
        send_request(&app, "POST", "/events/connect", Some(body.clone()), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) =
        send_request(&app, "POST", "/events/connect", Some(body.clone()), Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) =
        send_request(&app, "POST", "/events/connect", Some(body), Some("s3cret")).await;
    assert_eq!(status, StatusCode::OK);

    // Queries stay open
    let (status, _) = send_request(&app, "GET", "/count/local", None, None).await;
    assert_eq!(status, StatusCode::OK);

    app.herald.shutdown().await;
}

// =============================================================================
// TRANSLATION TESTS
// =============================================================================

#[tokio::test]
async fn test_translation_round_trip() {
    let app = setup("a", None).await;
    connect(&app, STEVE, "Steve").await;

    let (status, body) = send_request(&app, "GET", "/translate/name/Steve", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "id": STEVE, "name": "Steve" }));

    let (_, body) = send_request(&app, "GET", &format!("/translate/id/{STEVE}"), None, None).await;
    assert_eq!(body["name"], "Steve");

    // Different spelling needs an expensive lookup, which this proxy has disabled
    let (status, _) =
        send_request(&app, "GET", "/translate/name/steve?expensive=true", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.herald.shutdown().await;
}

// =============================================================================
// COMMAND TESTS
// =============================================================================

#[tokio::test]
async fn test_proxy_command_routes() {
    let app = setup("a", None).await;

    let (status, body) = send_request(
        &app,
        "POST",
        "/proxies/command",
        Some(json!({ "target": "allservers", "command": "/alert hello" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivered"], 1);

    let (status, body) = send_request(
        &app,
        "POST",
        "/proxies/command",
        Some(json!({ "target": "ghost", "command": "stop" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["details"], "ghost");

    let (_, body) = send_request(&app, "GET", "/proxies", None, None).await;
    assert_eq!(body, json!({ "proxy_id": "a", "live": ["a"] }));

    for _ in 0..100 {
        if !app.host.dispatched().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(app.host.dispatched(), vec!["alert hello".to_string()]);

    app.herald.shutdown().await;
}

#[tokio::test]
async fn test_channel_routes() {
    let app = setup("a", None).await;

    let (status, _) = send_request(
        &app,
        "POST",
        "/channels",
        Some(json!({ "channel": "minigames" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(app.store.publish("minigames", "ping").await.unwrap(), 1);

    let (status, _) = send_request(&app, "DELETE", "/channels/minigames", None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(app.store.publish("minigames", "ping").await.unwrap(), 0);

    let (status, _) = send_request(
        &app,
        "POST",
        "/channels",
        Some(json!({ "channel": "herald-firehose" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    app.herald.shutdown().await;
}

#[tokio::test]
async fn test_admin_commands() {
    let app = setup("a", None).await;
    connect(&app, STEVE, "Steve").await;
    send_request(
        &app,
        "POST",
        "/events/server",
        Some(json!({ "uuid": STEVE, "server": "survival" })),
        None,
    )
    .await;

    let (status, body) =
        send_request(&app, "POST", "/admin", Some(json!({ "command": "glist showall" })), None)
            .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["lines"],
        json!([
            "1 player(s) are currently online.",
            "[survival] (1): Steve"
        ])
    );

    let (_, body) =
        send_request(&app, "POST", "/admin", Some(json!({ "command": "find Steve" })), None).await;
    assert_eq!(body["lines"], json!(["Steve is on survival (proxy a)."]));

    let (_, body) =
        send_request(&app, "POST", "/admin", Some(json!({ "command": "ip Steve" })), None).await;
    assert_eq!(body["lines"], json!(["Steve is connected from 203.0.113.7."]));

    let (_, body) = send_request(
        &app,
        "POST",
        "/admin",
        Some(json!({ "command": "lastseen Steve" })),
        None,
    )
    .await;
    assert_eq!(body["lines"], json!(["Steve is currently online."]));

    let (_, body) =
        send_request(&app, "POST", "/admin", Some(json!({ "command": "find Herobrine" })), None)
            .await;
    assert_eq!(body["lines"], json!(["No such player found."]));

    let (_, body) =
        send_request(&app, "POST", "/admin", Some(json!({ "command": "serverid" })), None).await;
    assert_eq!(body["lines"], json!(["You are on a."]));

    let (status, _) =
        send_request(&app, "POST", "/admin", Some(json!({ "command": "reboot" })), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    app.herald.shutdown().await;
}
