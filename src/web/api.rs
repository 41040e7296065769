//! HTTP handlers: the playlist endpoint plus the management API

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checker::CheckItem;
use crate::errors::AppError;
use crate::models::{
    normalize_keywords, Channel, KeywordInput, OutputSource, OutputSourceCreateRequest,
    OutputSourceUpdateRequest, Subscription, SubscriptionCreateRequest, SubscriptionUpdateRequest,
};
use crate::output;
use crate::web::AppState;

const PLAYLIST_CONTENT_TYPE: &str = "application/x-mpegurl; charset=utf-8";

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// GET /m3u/{slug} — the consumer-facing playlist.
///
/// Serves whatever the store currently holds; freshness is the scheduler's
/// job. A disabled output answers 200 with a notice playlist so players keep
/// a valid file instead of erroring.
pub async fn serve_playlist(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let output = state
        .database
        .get_output_by_slug(&slug)
        .await?
        .ok_or_else(|| AppError::not_found("output source", &slug))?;

    if let Err(e) = state.database.touch_output_request_time(output.id).await {
        warn!("Failed to record request time for '{}': {}", slug, e);
    }

    if !output.is_enabled {
        return Ok((
            [(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)],
            output::disabled_playlist(&output.name),
        ));
    }

    let body = render_playlist(&state, &output).await?;
    info!("Served playlist '{}'", slug);
    Ok(([(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)], body))
}

async fn render_playlist(state: &AppState, output: &OutputSource) -> Result<String, AppError> {
    let (active_ids, source_names) =
        active_subscriptions(state, &output.subscription_ids).await?;
    let channels = state
        .database
        .channels_for_subscriptions(&active_ids, true)
        .await?;

    Ok(output::render_output(&channels, output, &source_names))
}

/// Resolves a membership list against the enabled subscriptions: disabled
/// members are dropped, and an empty list means every enabled subscription.
/// Also returns the id-to-name map used for source suffixes.
async fn active_subscriptions(
    state: &AppState,
    requested: &[Uuid],
) -> Result<(Vec<Uuid>, HashMap<Uuid, String>), AppError> {
    let subscriptions = state.database.list_subscriptions().await?;

    let enabled: Vec<Uuid> = subscriptions
        .iter()
        .filter(|s| s.is_enabled)
        .map(|s| s.id)
        .collect();
    let active = if requested.is_empty() {
        enabled
    } else {
        requested
            .iter()
            .filter(|id| enabled.contains(id))
            .copied()
            .collect()
    };

    let source_names = subscriptions.into_iter().map(|s| (s.id, s.name)).collect();
    Ok((active, source_names))
}

// --- Subscriptions ---

pub async fn list_subscriptions(
    State(state): State<AppState>,
) -> Result<Json<Vec<Subscription>>, AppError> {
    Ok(Json(state.database.list_subscriptions().await?))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    let subscription = state
        .database
        .get_subscription(id)
        .await?
        .ok_or_else(|| AppError::not_found("subscription", id.to_string()))?;
    Ok(Json(subscription))
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<SubscriptionCreateRequest>,
) -> Result<Json<Subscription>, AppError> {
    let subscription = state.database.create_subscription(&request).await?;
    info!("Created subscription '{}'", subscription.name);
    Ok(Json(subscription))
}

pub async fn update_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SubscriptionUpdateRequest>,
) -> Result<Json<Subscription>, AppError> {
    let subscription = state
        .database
        .update_subscription(id, &request)
        .await?
        .ok_or_else(|| AppError::not_found("subscription", id.to_string()))?;
    Ok(Json(subscription))
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    if !state.database.delete_subscription(id).await? {
        return Err(AppError::not_found("subscription", id.to_string()));
    }
    Ok(Json(json!({ "deleted": true })))
}

pub async fn subscription_channels(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Channel>>, AppError> {
    state
        .database
        .get_subscription(id)
        .await?
        .ok_or_else(|| AppError::not_found("subscription", id.to_string()))?;
    Ok(Json(state.database.channels_for_subscription(id).await?))
}

/// POST /api/subscriptions/{id}/refresh — fetch now, regardless of staleness.
/// The outcome lands in the response and on the subscription row; a failed
/// fetch is a recorded state, not an HTTP error.
pub async fn refresh_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let subscription = state
        .database
        .get_subscription(id)
        .await?
        .ok_or_else(|| AppError::not_found("subscription", id.to_string()))?;

    match state
        .refresh
        .refresh_subscription(&state.database, &subscription)
        .await
    {
        Ok(count) => Ok(Json(json!({ "status": "Success", "channels": count }))),
        Err(e) => Ok(Json(json!({ "status": format!("Error: {e}") }))),
    }
}

// --- Output sources ---

pub async fn list_outputs(
    State(state): State<AppState>,
) -> Result<Json<Vec<OutputSource>>, AppError> {
    Ok(Json(state.database.list_outputs().await?))
}

pub async fn get_output(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OutputSource>, AppError> {
    let output = state
        .database
        .get_output(id)
        .await?
        .ok_or_else(|| AppError::not_found("output source", id.to_string()))?;
    Ok(Json(output))
}

pub async fn create_output(
    State(state): State<AppState>,
    Json(request): Json<OutputSourceCreateRequest>,
) -> Result<Json<OutputSource>, AppError> {
    if state.database.slug_exists(&request.slug, None).await? {
        return Err(AppError::conflict(format!(
            "Slug '{}' is already in use",
            request.slug
        )));
    }
    let output = state.database.create_output(request).await?;
    info!("Created output source '{}' (/m3u/{})", output.name, output.slug);
    Ok(Json(output))
}

pub async fn update_output(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<OutputSourceUpdateRequest>,
) -> Result<Json<OutputSource>, AppError> {
    if state.database.slug_exists(&request.slug, Some(id)).await? {
        return Err(AppError::conflict(format!(
            "Slug '{}' is already in use",
            request.slug
        )));
    }
    let output = state
        .database
        .update_output(id, request)
        .await?
        .ok_or_else(|| AppError::not_found("output source", id.to_string()))?;
    Ok(Json(output))
}

pub async fn delete_output(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    if !state.database.delete_output(id).await? {
        return Err(AppError::not_found("output source", id.to_string()));
    }
    Ok(Json(json!({ "deleted": true })))
}

/// POST /api/outputs/{id}/refresh — refresh every member subscription and
/// the EPG guide, reporting a per-item result instead of failing wholesale.
pub async fn refresh_output(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let output = state
        .database
        .get_output(id)
        .await?
        .ok_or_else(|| AppError::not_found("output source", id.to_string()))?;

    let mut results = Vec::new();
    let mut all_ok = true;

    for subscription_id in &output.subscription_ids {
        let status = match state.database.get_subscription(*subscription_id).await? {
            None => "Missing".to_string(),
            Some(subscription) if !subscription.is_enabled => "Disabled".to_string(),
            Some(subscription) => {
                match state
                    .refresh
                    .refresh_subscription(&state.database, &subscription)
                    .await
                {
                    Ok(count) => format!("Success: {count} channels"),
                    Err(e) => {
                        all_ok = false;
                        format!("Error: {e}")
                    }
                }
            }
        };
        results.push(json!({ "subscription_id": subscription_id, "status": status }));
    }

    let epg_status = match output.epg_url.as_deref().filter(|u| !u.trim().is_empty()) {
        None => None,
        Some(epg_url) => Some(match state.epg_cache.refresh(epg_url).await {
            Ok(()) => "Success".to_string(),
            Err(e) => {
                all_ok = false;
                format!("Error: {e}")
            }
        }),
    };

    let (timestamp, status) = if all_ok {
        (Some(chrono::Utc::now()), "Success".to_string())
    } else {
        (None, "Error: one or more refresh steps failed".to_string())
    };
    state
        .database
        .update_output_refresh_state(output.id, timestamp, &status)
        .await?;

    Ok(Json(json!({
        "status": status,
        "subscriptions": results,
        "epg": epg_status,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub subscription_ids: Vec<Uuid>,
    #[serde(default)]
    pub keywords: Vec<KeywordInput>,
    #[serde(default)]
    pub filter_regex: Option<String>,
}

/// POST /api/outputs/preview — dry-run the filter rules before saving an
/// output. Channels of enabled subscriptions pass through the regex filter
/// and logo propagation, then land in one bucket per keyword rule (each
/// rule evaluated on its own, so overlaps show up in every bucket it
/// matches) or a single "All" bucket when no rules are given.
pub async fn preview_output(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<Value>, AppError> {
    let rules = normalize_keywords(request.keywords);
    let (active_ids, source_names) =
        active_subscriptions(&state, &request.subscription_ids).await?;

    let channels = state
        .database
        .channels_for_subscriptions(&active_ids, false)
        .await?;
    let channels = output::apply_regex_filter(channels, request.filter_regex.as_deref().unwrap_or(""));
    let channels = output::propagate_logos(channels);

    let dump = |bucket: &[Channel]| -> Vec<Value> {
        bucket
            .iter()
            .map(|c| {
                let mut value = serde_json::to_value(c).unwrap_or_default();
                if let Some(object) = value.as_object_mut() {
                    object.insert(
                        "source".to_string(),
                        json!(source_names
                            .get(&c.subscription_id)
                            .cloned()
                            .unwrap_or_else(|| "Unknown".to_string())),
                    );
                }
                value
            })
            .collect()
    };

    let mut buckets = serde_json::Map::new();
    if rules.is_empty() {
        buckets.insert("All".to_string(), json!(dump(&channels)));
    } else {
        for rule in &rules {
            let matches = output::apply_keyword_rules(&channels, std::slice::from_ref(rule));
            let key = if rule.group.is_empty() {
                rule.value.clone()
            } else {
                format!("{} \u{2192} {}", rule.value, rule.group)
            };
            buckets.insert(key, json!(dump(&matches)));
        }
    }

    Ok(Json(Value::Object(buckets)))
}

// --- EPG ---

#[derive(Debug, Deserialize)]
pub struct CurrentProgramQuery {
    pub epg_url: String,
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    #[serde(default)]
    pub refresh: bool,
}

pub async fn current_program(
    State(state): State<AppState>,
    Query(query): Query<CurrentProgramQuery>,
) -> Json<Value> {
    let lookup = state
        .epg_cache
        .current_program(
            &query.epg_url,
            query.tvg_id.as_deref(),
            query.tvg_name.as_deref(),
            query.refresh,
        )
        .await;

    let status = match &lookup {
        crate::epg::ProgramLookup::Found(_) => "found",
        crate::epg::ProgramLookup::NoProgram => "no_program",
        crate::epg::ProgramLookup::FetchFailed => "fetch_failed",
        crate::epg::ProgramLookup::ParseError => "parse_error",
    };
    Json(json!({ "status": status, "title": lookup.describe() }))
}

// --- Stream checking ---

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub subscription_ids: Vec<Uuid>,
    #[serde(default)]
    pub auto_toggle: bool,
}

/// POST /api/check — probe every channel of the given subscriptions with a
/// bounded number of captures in flight, persisting results as they land.
pub async fn check_streams(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<Value>, AppError> {
    let channels = state
        .database
        .channels_for_subscriptions(&request.subscription_ids, false)
        .await?;

    let items: Vec<CheckItem> = channels
        .iter()
        .map(|c| CheckItem {
            channel_id: c.id,
            url: c.url.clone(),
            is_enabled: c.is_enabled,
        })
        .collect();

    let outcomes = state
        .checker
        .check_batch(items, state.config.checker.api_concurrency, request.auto_toggle)
        .await;

    let mut results = Vec::with_capacity(outcomes.len());
    for outcome in &outcomes {
        let enabled = outcome
            .action
            .map(|a| a == crate::checker::ToggleAction::Enabled);
        state
            .database
            .update_channel_check(
                outcome.channel_id,
                outcome.passed,
                outcome.thumbnail.as_deref(),
                outcome.error.as_deref(),
                enabled,
            )
            .await?;

        results.push(json!({
            "channel_id": outcome.channel_id,
            "passed": outcome.passed,
            "thumbnail": outcome.thumbnail,
            "error": outcome.error,
            "action": outcome.action.map(|a| match a {
                crate::checker::ToggleAction::Enabled => "enabled",
                crate::checker::ToggleAction::Disabled => "disabled",
            }),
        }));
    }

    let passed = outcomes.iter().filter(|o| o.passed).count();
    Ok(Json(json!({
        "checked": outcomes.len(),
        "passed": passed,
        "failed": outcomes.len() - passed,
        "results": results,
    })))
}
