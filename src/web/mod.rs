//! Web server setup and routing

pub mod api;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::checker::StreamChecker;
use crate::config::Config;
use crate::database::Database;
use crate::epg::EpgCache;
use crate::ingestor::RefreshService;

#[derive(Clone)]
pub struct AppState {
    pub database: Database,
    pub config: Arc<Config>,
    pub epg_cache: Arc<EpgCache>,
    pub checker: Arc<StreamChecker>,
    pub refresh: RefreshService,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/m3u/:slug", get(api::serve_playlist))
        .route(
            "/api/subscriptions",
            get(api::list_subscriptions).post(api::create_subscription),
        )
        .route(
            "/api/subscriptions/:id",
            get(api::get_subscription)
                .put(api::update_subscription)
                .delete(api::delete_subscription),
        )
        .route(
            "/api/subscriptions/:id/channels",
            get(api::subscription_channels),
        )
        .route(
            "/api/subscriptions/:id/refresh",
            post(api::refresh_subscription),
        )
        .route("/api/outputs", get(api::list_outputs).post(api::create_output))
        .route("/api/outputs/preview", post(api::preview_output))
        .route(
            "/api/outputs/:id",
            get(api::get_output)
                .put(api::update_output)
                .delete(api::delete_output),
        )
        .route("/api/outputs/:id/refresh", post(api::refresh_output))
        .route("/api/epg/current", get(api::current_program))
        .route("/api/check", post(api::check_streams))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
