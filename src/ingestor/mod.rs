//! Subscription refresh: fetching remote playlists and replacing the stored
//! channel set wholesale.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::database::Database;
use crate::errors::SourceError;
use crate::models::{ChannelDraft, Subscription};

pub mod m3u_parser;
pub mod scheduler;

/// Many providers refuse generic browser agents; default to a player UA.
const PLAYER_USER_AGENT: &str = "TiviMate/4.7.0 (Linux; Android 11)";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches and parses the playlist(s) behind a subscription.
#[async_trait]
pub trait PlaylistFetcher: Send + Sync {
    async fn fetch(&self, subscription: &Subscription) -> Result<Vec<ChannelDraft>, SourceError>;
}

pub struct HttpPlaylistFetcher {
    client: reqwest::Client,
}

impl HttpPlaylistFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn fetch_one(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<Vec<ChannelDraft>, SourceError> {
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| SourceError::FetchFailed {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content = response
            .text()
            .await
            .map_err(|e| SourceError::FetchFailed {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        // A webpage instead of a playlist usually means a wrong UA or URL.
        if content.to_lowercase().contains("<html") && !content.contains("#EXTM3U") {
            return Err(SourceError::NotAPlaylist {
                url: url.to_string(),
            });
        }

        Ok(m3u_parser::parse_playlist(&content))
    }
}

impl Default for HttpPlaylistFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlaylistFetcher for HttpPlaylistFetcher {
    async fn fetch(&self, subscription: &Subscription) -> Result<Vec<ChannelDraft>, SourceError> {
        let user_agent = if subscription.user_agent.is_empty()
            || subscription.user_agent == "Mozilla/5.0"
        {
            PLAYER_USER_AGENT
        } else {
            subscription.user_agent.as_str()
        };

        let mut headers = HeaderMap::new();
        let extra: HashMap<String, String> =
            serde_json::from_str(&subscription.headers).unwrap_or_default();
        for (key, value) in &extra {
            if let (Ok(name), Ok(value)) = (
                key.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            } else {
                warn!("Skipping invalid header '{}' on '{}'", key, subscription.name);
            }
        }
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, value);
        }

        // A subscription may hold several comma-separated locators; their
        // channels are merged in declaration order.
        let mut channels = Vec::new();
        for locator in subscription.url.split(',') {
            let locator = locator.trim();
            if locator.is_empty() {
                continue;
            }
            info!(
                "Fetching playlist for '{}' from {}",
                subscription.name, locator
            );
            channels.extend(self.fetch_one(locator, headers.clone()).await?);
        }

        Ok(channels)
    }
}

/// Orchestrates one subscription refresh: fetch, replace channels, and record
/// the outcome on the subscription row in the same unit of work.
#[derive(Clone)]
pub struct RefreshService {
    fetcher: Arc<dyn PlaylistFetcher>,
}

impl RefreshService {
    pub fn new(fetcher: Arc<dyn PlaylistFetcher>) -> Self {
        Self { fetcher }
    }

    pub async fn refresh_subscription(
        &self,
        database: &Database,
        subscription: &Subscription,
    ) -> Result<usize> {
        match self.fetcher.fetch(subscription).await {
            Ok(drafts) => {
                let count = database
                    .replace_channels(subscription.id, &drafts)
                    .await?;
                database
                    .update_subscription_refresh_state(
                        subscription.id,
                        Some(Utc::now()),
                        "Success",
                    )
                    .await?;
                info!(
                    "Refreshed subscription '{}': {} channels",
                    subscription.name, count
                );
                Ok(count)
            }
            Err(e) => {
                let status = format!("Error: {e}");
                database
                    .update_subscription_refresh_state(subscription.id, None, &status)
                    .await?;
                Err(e.into())
            }
        }
    }
}
