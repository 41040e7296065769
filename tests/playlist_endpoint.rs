use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use m3u_hub::checker::{FfmpegCapture, StreamChecker};
use m3u_hub::config::Config;
use m3u_hub::database::Database;
use m3u_hub::epg::EpgCache;
use m3u_hub::ingestor::{HttpPlaylistFetcher, RefreshService};
use m3u_hub::models::ChannelDraft;
use m3u_hub::web::{create_router, AppState};

async fn test_app() -> (Router, Database) {
    let database = Database::new_in_memory().await.unwrap();
    let config = Config::default();
    let epg_dir = std::env::temp_dir().join(format!("m3u-hub-test-epg-{}", Uuid::new_v4()));

    let state = AppState {
        database: database.clone(),
        epg_cache: Arc::new(EpgCache::new(epg_dir)),
        checker: Arc::new(StreamChecker::new(Arc::new(FfmpegCapture::new(
            config.checker.ffmpeg_command.clone(),
            config.checker.probe_timeout_seconds,
        )))),
        refresh: RefreshService::new(Arc::new(HttpPlaylistFetcher::new())),
        config: Arc::new(config),
    };
    (create_router(state), database)
}

async fn send_json(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);

    let request = if let Some(body) = body {
        builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    } else {
        builder.body(Body::empty()).unwrap()
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&bytes).unwrap_or(json!({}))
    };
    (status, json)
}

async fn get_text(app: &Router, uri: &str) -> (StatusCode, String) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

fn draft(name: &str, group: &str, tvg_id: Option<&str>) -> ChannelDraft {
    ChannelDraft {
        name: name.to_string(),
        url: format!("http://stream/{}", name.replace(' ', "-").to_lowercase()),
        group_title: Some(group.to_string()),
        logo: None,
        tvg_id: tvg_id.map(str::to_string),
    }
}

async fn seed_subscription(app: &Router, database: &Database, name: &str) -> Uuid {
    let (status, body) = send_json(
        app,
        Method::POST,
        "/api/subscriptions",
        Some(json!({
            "name": name,
            "url": "http://provider/playlist.m3u",
            "auto_update_minutes": 0
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    database
        .replace_channels(
            id,
            &[
                draft("Sky Sports News", "Sport", Some("sky.sports")),
                draft("BBC News HD", "News", Some("bbc.news")),
                draft("Movie Channel", "Movies", None),
            ],
        )
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn health_endpoint_reports_healthy() {
    let (app, _database) = test_app().await;
    let (status, body) = send_json(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn unknown_slug_is_not_found() {
    let (app, _database) = test_app().await;
    let (status, _) = get_text(&app, "/m3u/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disabled_output_serves_a_notice_playlist_with_status_ok() {
    let (app, database) = test_app().await;
    let subscription_id = seed_subscription(&app, &database, "Provider").await;

    let (status, _) = send_json(
        &app,
        Method::POST,
        "/api/outputs",
        Some(json!({
            "name": "Paused",
            "slug": "paused",
            "subscription_ids": [subscription_id],
            "is_enabled": false
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get_text(&app, "/m3u/paused").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("#EXTM3U"));
    assert!(body.contains("currently disabled"));
}

#[tokio::test]
async fn enabled_output_serves_the_filtered_playlist() {
    let (app, database) = test_app().await;
    let subscription_id = seed_subscription(&app, &database, "Provider").await;

    let (status, _) = send_json(
        &app,
        Method::POST,
        "/api/outputs",
        Some(json!({
            "name": "News only",
            "slug": "news",
            "subscription_ids": [subscription_id],
            "keywords": [{"value": "news", "group": "Headlines"}],
            "include_source_suffix": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get_text(&app, "/m3u/news").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("#EXTM3U"));
    // Keyword-claimed channels survive with the rewritten group.
    assert!(body.contains("Sky Sports News (Provider)"));
    assert!(body.contains("BBC News HD (Provider)"));
    assert!(body.contains("group-title=\"Headlines\""));
    // The unclaimed channel is dropped.
    assert!(!body.contains("Movie Channel"));
    // The original name is preserved in tvg-name for EPG matching.
    assert!(body.contains("tvg-name=\"BBC News HD\""));
}

#[tokio::test]
async fn duplicate_slug_is_rejected_before_mutation() {
    let (app, _database) = test_app().await;

    let payload = json!({ "name": "First", "slug": "shared" });
    let (status, _) = send_json(&app, Method::POST, "/api/outputs", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(
        &app,
        Method::POST,
        "/api/outputs",
        Some(json!({ "name": "Second", "slug": "shared" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["detail"].as_str().unwrap().contains("shared"));

    let (_, outputs) = send_json(&app, Method::GET, "/api/outputs", None).await;
    assert_eq!(outputs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn subscription_crud_round_trip() {
    let (app, _database) = test_app().await;

    let (status, created) = send_json(
        &app,
        Method::POST,
        "/api/subscriptions",
        Some(json!({ "name": "Provider", "url": "http://provider/a.m3u" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, fetched) =
        send_json(&app, Method::GET, &format!("/api/subscriptions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "Provider");

    let (status, updated) = send_json(
        &app,
        Method::PUT,
        &format!("/api/subscriptions/{id}"),
        Some(json!({
            "name": "Renamed",
            "url": "http://provider/a.m3u",
            "user_agent": "Mozilla/5.0",
            "headers": "{}",
            "auto_update_minutes": 120,
            "is_enabled": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "Renamed");

    let (status, _) = send_json(
        &app,
        Method::DELETE,
        &format!("/api/subscriptions/{id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) =
        send_json(&app, Method::GET, &format!("/api/subscriptions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn playlist_requests_touch_the_request_timestamp() {
    let (app, database) = test_app().await;
    let subscription_id = seed_subscription(&app, &database, "Provider").await;

    send_json(
        &app,
        Method::POST,
        "/api/outputs",
        Some(json!({
            "name": "All",
            "slug": "all",
            "subscription_ids": [subscription_id]
        })),
    )
    .await;

    let before = database.list_outputs().await.unwrap().remove(0);
    assert!(before.last_request_time.is_none());

    let (status, _) = get_text(&app, "/m3u/all").await;
    assert_eq!(status, StatusCode::OK);

    let after = database.list_outputs().await.unwrap().remove(0);
    assert!(after.last_request_time.is_some());
}

#[tokio::test]
async fn disabled_subscriptions_are_excluded_from_the_playlist() {
    let (app, database) = test_app().await;
    let live_id = seed_subscription(&app, &database, "Live").await;
    let dead_id = seed_subscription(&app, &database, "Dead").await;

    let (status, _) = send_json(
        &app,
        Method::PUT,
        &format!("/api/subscriptions/{dead_id}"),
        Some(json!({
            "name": "Dead",
            "url": "http://provider/playlist.m3u",
            "user_agent": "Mozilla/5.0",
            "headers": "{}",
            "auto_update_minutes": 0,
            "is_enabled": false
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    send_json(
        &app,
        Method::POST,
        "/api/outputs",
        Some(json!({
            "name": "Mixed",
            "slug": "mixed",
            "subscription_ids": [live_id, dead_id],
            "include_source_suffix": true
        })),
    )
    .await;

    let (status, body) = get_text(&app, "/m3u/mixed").await;
    assert_eq!(status, StatusCode::OK);
    // Channels of the enabled member are served; the disabled member's
    // channels vanish even though their rows are still stored and enabled.
    assert!(body.contains("(Live)"));
    assert!(!body.contains("(Dead)"));
}

#[tokio::test]
async fn empty_membership_serves_every_enabled_subscription() {
    let (app, database) = test_app().await;
    seed_subscription(&app, &database, "Provider").await;

    send_json(
        &app,
        Method::POST,
        "/api/outputs",
        Some(json!({ "name": "Everything", "slug": "everything" })),
    )
    .await;

    let (status, body) = get_text(&app, "/m3u/everything").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("BBC News HD"));
}

#[tokio::test]
async fn playlist_is_served_with_the_m3u_content_type() {
    let (app, database) = test_app().await;
    let subscription_id = seed_subscription(&app, &database, "Provider").await;

    send_json(
        &app,
        Method::POST,
        "/api/outputs",
        Some(json!({
            "name": "All",
            "slug": "all",
            "subscription_ids": [subscription_id]
        })),
    )
    .await;

    let request = Request::builder().uri("/m3u/all").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-mpegurl; charset=utf-8"
    );
}

#[tokio::test]
async fn preview_buckets_channels_per_keyword_rule() {
    let (app, database) = test_app().await;
    let subscription_id = seed_subscription(&app, &database, "Provider").await;

    let (status, body) = send_json(
        &app,
        Method::POST,
        "/api/outputs/preview",
        Some(json!({
            "subscription_ids": [subscription_id],
            "keywords": ["sports", {"value": "news", "group": "Headlines"}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // One bucket per rule, evaluated independently: the sports channel is
    // also a news match, so it shows up in both buckets.
    let sports = body["sports"].as_array().unwrap();
    assert_eq!(sports.len(), 1);
    assert_eq!(sports[0]["name"], "Sky Sports News");
    assert_eq!(sports[0]["source"], "Provider");

    let news = body["news \u{2192} Headlines"].as_array().unwrap();
    assert_eq!(news.len(), 2);
    assert!(news.iter().all(|c| c["group_title"] == "Headlines"));
    assert!(!body
        .as_object()
        .unwrap()
        .values()
        .flat_map(|list| list.as_array().unwrap())
        .any(|c| c["name"] == "Movie Channel"));
}

#[tokio::test]
async fn preview_without_rules_returns_one_bucket_of_enabled_subscriptions() {
    let (app, database) = test_app().await;
    let live_id = seed_subscription(&app, &database, "Live").await;
    let dead_id = seed_subscription(&app, &database, "Dead").await;

    send_json(
        &app,
        Method::PUT,
        &format!("/api/subscriptions/{dead_id}"),
        Some(json!({
            "name": "Dead",
            "url": "http://provider/playlist.m3u",
            "user_agent": "Mozilla/5.0",
            "headers": "{}",
            "auto_update_minutes": 0,
            "is_enabled": false
        })),
    )
    .await;

    let (status, body) = send_json(
        &app,
        Method::POST,
        "/api/outputs/preview",
        Some(json!({ "subscription_ids": [live_id, dead_id] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let all = body["All"].as_array().unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|c| c["source"] == "Live"));
}

#[tokio::test]
async fn epg_lookup_accepts_the_documented_query_parameters() {
    let (app, _database) = test_app().await;

    let (status, body) = send_json(
        &app,
        Method::GET,
        "/api/epg/current?epg_url=http://epg.invalid/guide.xml&tvg_id=bbc1&tvg_name=BBC%20One&refresh=true",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // No guide is reachable at that URL; the sentinel proves the query
    // parameters deserialized and the lookup ran.
    assert_eq!(body["status"], "fetch_failed");
}
