use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{parse_datetime, parse_optional_datetime, Database};
use crate::models::*;

fn subscription_from_row(row: &SqliteRow) -> Result<Subscription> {
    Ok(Subscription {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        name: row.get("name"),
        url: row.get("url"),
        user_agent: row.get("user_agent"),
        headers: row.get("headers"),
        auto_update_minutes: row.get("auto_update_minutes"),
        is_enabled: row.get("is_enabled"),
        last_updated: parse_optional_datetime(row.get("last_updated"))?,
        last_update_status: row.get("last_update_status"),
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
    })
}

fn channel_from_row(row: &SqliteRow) -> Result<Channel> {
    Ok(Channel {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        subscription_id: Uuid::parse_str(&row.get::<String, _>("subscription_id"))?,
        name: row.get("name"),
        url: row.get("url"),
        group_title: row.get("group_title"),
        logo: row.get("logo"),
        tvg_id: row.get("tvg_id"),
        is_enabled: row.get("is_enabled"),
        check_status: row.get("check_status"),
        check_date: parse_optional_datetime(row.get("check_date"))?,
        check_image: row.get("check_image"),
        check_error: row.get("check_error"),
    })
}

const SUBSCRIPTION_COLUMNS: &str = "id, name, url, user_agent, headers, auto_update_minutes, \
     is_enabled, last_updated, last_update_status, created_at";

const CHANNEL_COLUMNS: &str = "id, subscription_id, name, url, group_title, logo, tvg_id, \
     is_enabled, check_status, check_date, check_image, check_error";

impl Database {
    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions ORDER BY created_at"
        ))
        .fetch_all(&self.pool())
        .await?;

        rows.iter().map(subscription_from_row).collect()
    }

    pub async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool())
        .await?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    pub async fn create_subscription(
        &self,
        request: &SubscriptionCreateRequest,
    ) -> Result<Subscription> {
        let subscription = Subscription {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            url: request.url.trim().to_string(),
            user_agent: request.user_agent.clone(),
            headers: request.headers.clone(),
            auto_update_minutes: request.auto_update_minutes,
            is_enabled: request.is_enabled,
            last_updated: None,
            last_update_status: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO subscriptions (id, name, url, user_agent, headers, auto_update_minutes,
             is_enabled, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(subscription.id.to_string())
        .bind(&subscription.name)
        .bind(&subscription.url)
        .bind(&subscription.user_agent)
        .bind(&subscription.headers)
        .bind(subscription.auto_update_minutes)
        .bind(subscription.is_enabled)
        .bind(subscription.created_at.to_rfc3339())
        .execute(&self.pool())
        .await?;

        Ok(subscription)
    }

    pub async fn update_subscription(
        &self,
        id: Uuid,
        request: &SubscriptionUpdateRequest,
    ) -> Result<Option<Subscription>> {
        let result = sqlx::query(
            "UPDATE subscriptions SET name = ?, url = ?, user_agent = ?, headers = ?,
             auto_update_minutes = ?, is_enabled = ? WHERE id = ?",
        )
        .bind(&request.name)
        .bind(request.url.trim())
        .bind(&request.user_agent)
        .bind(&request.headers)
        .bind(request.auto_update_minutes)
        .bind(request.is_enabled)
        .bind(id.to_string())
        .execute(&self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_subscription(id).await
    }

    /// Deletes the subscription together with its channels (cascade).
    pub async fn delete_subscription(&self, id: Uuid) -> Result<bool> {
        let mut transaction = self.pool().begin().await?;

        sqlx::query("DELETE FROM channels WHERE subscription_id = ?")
            .bind(id.to_string())
            .execute(&mut *transaction)
            .await?;

        let result = sqlx::query("DELETE FROM subscriptions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace every channel of a subscription in one transaction
    /// (delete-old/insert-new, never diffed). Returns the inserted count.
    pub async fn replace_channels(
        &self,
        subscription_id: Uuid,
        drafts: &[ChannelDraft],
    ) -> Result<usize> {
        let _guard = self.acquire_channel_replace_lock().await;
        let mut transaction = self.pool().begin().await?;

        sqlx::query("DELETE FROM channels WHERE subscription_id = ?")
            .bind(subscription_id.to_string())
            .execute(&mut *transaction)
            .await?;

        for draft in drafts {
            sqlx::query(
                "INSERT INTO channels (id, subscription_id, name, url, group_title, logo,
                 tvg_id, is_enabled) VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(subscription_id.to_string())
            .bind(&draft.name)
            .bind(&draft.url)
            .bind(&draft.group_title)
            .bind(&draft.logo)
            .bind(&draft.tvg_id)
            .execute(&mut *transaction)
            .await?;
        }

        transaction.commit().await?;
        Ok(drafts.len())
    }

    /// Record the outcome of a refresh attempt on the subscription row.
    pub async fn update_subscription_refresh_state(
        &self,
        id: Uuid,
        last_updated: Option<DateTime<Utc>>,
        status: &str,
    ) -> Result<()> {
        match last_updated {
            Some(ts) => {
                sqlx::query(
                    "UPDATE subscriptions SET last_updated = ?, last_update_status = ?
                     WHERE id = ?",
                )
                .bind(ts.to_rfc3339())
                .bind(status)
                .bind(id.to_string())
                .execute(&self.pool())
                .await?;
            }
            None => {
                sqlx::query("UPDATE subscriptions SET last_update_status = ? WHERE id = ?")
                    .bind(status)
                    .bind(id.to_string())
                    .execute(&self.pool())
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn channels_for_subscription(&self, subscription_id: Uuid) -> Result<Vec<Channel>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE subscription_id = ? ORDER BY rowid"
        ))
        .bind(subscription_id.to_string())
        .fetch_all(&self.pool())
        .await?;

        rows.iter().map(channel_from_row).collect()
    }

    /// Channels of several subscriptions, preserving the given subscription
    /// order. Unknown ids simply contribute nothing.
    pub async fn channels_for_subscriptions(
        &self,
        subscription_ids: &[Uuid],
        enabled_only: bool,
    ) -> Result<Vec<Channel>> {
        let mut channels = Vec::new();
        for id in subscription_ids {
            let query = if enabled_only {
                format!(
                    "SELECT {CHANNEL_COLUMNS} FROM channels
                     WHERE subscription_id = ? AND is_enabled = 1 ORDER BY rowid"
                )
            } else {
                format!(
                    "SELECT {CHANNEL_COLUMNS} FROM channels
                     WHERE subscription_id = ? ORDER BY rowid"
                )
            };
            let rows = sqlx::query(&query)
                .bind(id.to_string())
                .fetch_all(&self.pool())
                .await?;
            for row in &rows {
                channels.push(channel_from_row(row)?);
            }
        }
        Ok(channels)
    }

    /// Persist one visual-check result. `enabled` carries the auto-toggle
    /// decision when that mode is active.
    pub async fn update_channel_check(
        &self,
        channel_id: Uuid,
        passed: bool,
        image: Option<&str>,
        error: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<()> {
        match enabled {
            Some(enabled) => {
                sqlx::query(
                    "UPDATE channels SET check_status = ?, check_date = ?, check_image = ?,
                     check_error = ?, is_enabled = ? WHERE id = ?",
                )
                .bind(passed)
                .bind(Utc::now().to_rfc3339())
                .bind(image)
                .bind(error)
                .bind(enabled)
                .bind(channel_id.to_string())
                .execute(&self.pool())
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE channels SET check_status = ?, check_date = ?, check_image = ?,
                     check_error = ? WHERE id = ?",
                )
                .bind(passed)
                .bind(Utc::now().to_rfc3339())
                .bind(image)
                .bind(error)
                .bind(channel_id.to_string())
                .execute(&self.pool())
                .await?;
            }
        }
        Ok(())
    }
}
