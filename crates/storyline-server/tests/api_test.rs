// Router tests over in-memory backends
//
// Run with: cargo test -p storyline-server --test api_test

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use storyline_core::memory::{InMemoryBroadcaster, InMemoryEventLog, InMemoryReadModel};
use storyline_core::{GameStatus, SessionConfig};
use storyline_server::{build_app, build_router_with_prefix, Services};

fn seeded_app(prefix: &str) -> (Router, Arc<InMemoryEventLog>) {
    let log = Arc::new(InMemoryEventLog::new());
    let model = Arc::new(InMemoryReadModel::new());
    model.upsert_game(1, 10, "The Lighthouse", GameStatus::Closed, vec![3, 4]);
    model.upsert_game(2, 20, "Night Train", GameStatus::Open, vec![3]);

    let services = Services::with_backends(
        log.clone(),
        Arc::new(InMemoryBroadcaster::new()),
        model,
        SessionConfig::default().with_poll_interval(Duration::from_millis(20)),
    )
    .unwrap();
    (build_app(&services, prefix, &[]), log)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post_action(action: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/v1/actions/{}", action))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Read SSE chunks until a complete message of `kind` has arrived
async fn read_sse_until(body: &mut Body, kind: &str) -> String {
    let marker = format!("event: {}\n", kind);
    let mut text = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = body
                .frame()
                .await
                .expect("stream ended")
                .expect("body error");
            if let Ok(chunk) = frame.into_data() {
                text.push_str(&String::from_utf8_lossy(&chunk));
            }
            if let Some(start) = text.find(&marker) {
                if text[start..].contains("\n\n") {
                    return;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for SSE message");
    text
}

#[tokio::test]
async fn test_health() {
    let (app, _) = seeded_app("");
    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["broadcaster"], "memory");
    assert_eq!(body["broadcaster_available"], true);
    assert!(body["latest_event_id"].is_null());
}

#[tokio::test]
async fn test_publish_action_appends_events() {
    let (app, log) = seeded_app("");

    let (status, body) = send(
        &app,
        post_action(
            "game_closed",
            json!({"gameId": 1, "textId": 10, "title": "The Lighthouse"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["events"].as_array().unwrap().len(), 1);
    assert_eq!(body["events"][0]["related_table"], "game");
    assert_eq!(body["events"][0]["event_kind"], "game.closed");
    assert_eq!(log.len(), 1);
}

#[tokio::test]
async fn test_writer_header_fills_missing_writer_id() {
    let (app, _) = seeded_app("");

    let request = Request::builder()
        .method("POST")
        .uri("/v1/actions/game_joined")
        .header("content-type", "application/json")
        .header("x-writer-id", "4")
        .body(Body::from(json!({"gameId": 2}).to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["events"][0]["writer_id"], 4);
}

#[tokio::test]
async fn test_invalid_actions_are_rejected() {
    let (app, log) = seeded_app("");

    let (status, body) = send(&app, post_action("game_exploded", json!({"gameId": 1}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("unknown action"));

    let (status, body) = send(&app, post_action("game_closed", json!({"gameId": 1}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("textId"));

    assert!(log.is_empty());
}

#[tokio::test]
async fn test_invalid_writer_header() {
    let (app, _) = seeded_app("");
    let request = Request::builder()
        .uri("/v1/events")
        .header("x-writer-id", "someone")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid X-Writer-Id header");
}

#[tokio::test]
async fn test_list_events_is_scoped() {
    let (app, _) = seeded_app("");
    send(&app, post_action("game_joined", json!({"gameId": 2, "writerId": 3}))).await;
    send(
        &app,
        post_action(
            "text_added",
            json!({"textId": 21, "rootStoryId": 20, "writerId": 3, "gameId": 2}),
        ),
    )
    .await;
    send(
        &app,
        post_action(
            "notification_created",
            json!({"notificationId": 5, "recipientId": 4, "message": "Your turn"}),
        ),
    )
    .await;

    // Anonymous, no story: games only
    let (status, body) = send(&app, get("/v1/events")).await;
    assert_eq!(status, StatusCode::OK);
    let tables: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["related_table"].as_str().unwrap())
        .collect();
    assert!(tables.iter().all(|t| *t == "game"));

    // Recipient with the story scope sees everything
    let request = Request::builder()
        .uri("/v1/events?rootStoryId=20")
        .header("x-writer-id", "4")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&app, request).await;
    let tables: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["related_table"].as_str().unwrap())
        .collect();
    assert!(tables.contains(&"text"));
    assert!(tables.contains(&"notification"));

    // Cursor and limit
    let (_, body) = send(&app, get("/v1/events?since=1&limit=1")).await;
    assert!(body["data"].as_array().unwrap().len() <= 1);
}

#[tokio::test]
async fn test_invalid_filters_rejected() {
    let (app, _) = seeded_app("");
    let (status, body) = send(&app, get("/v1/updates?filters=%7Bnope")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Invalid filters"));
}

#[tokio::test]
async fn test_update_stream_replays_after_cursor() {
    let (app, _) = seeded_app("");
    let (_, first) = send(&app, post_action("game_joined", json!({"gameId": 2, "writerId": 3}))).await;
    send(
        &app,
        post_action(
            "game_closed",
            json!({"gameId": 1, "textId": 10, "title": "The Lighthouse"}),
        ),
    )
    .await;

    let cursor = first["events"][0]["id"].as_i64().unwrap();
    let response = app
        .clone()
        .oneshot(get(&format!("/v1/updates?lastEventId={}", cursor)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let mut body = response.into_body();
    let text = read_sse_until(&mut body, "update").await;
    assert!(text.contains("\"modifiedGames\""));
    assert!(text.contains("The Lighthouse"));
    assert!(!text.contains("Night Train"));
    assert!(text.contains(&format!("id: {}\n", cursor + 1)));
}

#[tokio::test]
async fn test_last_event_id_header_resumes() {
    let (app, _) = seeded_app("");
    send(&app, post_action("game_joined", json!({"gameId": 1, "writerId": 4}))).await;
    send(&app, post_action("game_joined", json!({"gameId": 2, "writerId": 4}))).await;

    let request = Request::builder()
        .uri("/v1/updates")
        .header("last-event-id", "1")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let mut body = response.into_body();

    let text = read_sse_until(&mut body, "update").await;
    assert!(text.contains("Night Train"));
    assert!(text.contains("id: 2\n"));
}

#[tokio::test]
async fn test_api_prefix() {
    let services = Services::in_memory(SessionConfig::default()).unwrap();
    let app = build_app(&services, "/api", &["https://app.example".to_string()]);

    let (status, _) = send(&app, get("/api/v1/actions")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, get("/v1/actions")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Health stays at the root
    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_list_actions_and_openapi() {
    let (app, _) = seeded_app("");

    let (_, body) = send(&app, get("/v1/actions")).await;
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(names.contains(&"game_closed"));
    assert!(names.contains(&"text_added"));

    let (status, doc) = send(&app, get("/api-doc/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/v1/updates"].is_object());
}

#[tokio::test]
async fn test_build_router_with_prefix_empty() {
    let routes = Router::new().route("/v1/test", axum::routing::get(|| async { "ok" }));
    let app = build_router_with_prefix(routes, "");

    let response = app.oneshot(get("/v1/test")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}
