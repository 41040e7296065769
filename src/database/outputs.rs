use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{parse_datetime, parse_optional_datetime, Database};
use crate::models::*;

fn output_from_row(row: &SqliteRow) -> Result<OutputSource> {
    let subscription_ids: Vec<Uuid> =
        serde_json::from_str(&row.get::<String, _>("subscription_ids")).unwrap_or_default();
    let keywords: Vec<KeywordInput> =
        serde_json::from_str(&row.get::<String, _>("keywords")).unwrap_or_default();

    Ok(OutputSource {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        name: row.get("name"),
        slug: row.get("slug"),
        subscription_ids,
        filter_regex: row.get("filter_regex"),
        keywords: normalize_keywords(keywords),
        epg_url: row.get("epg_url"),
        include_source_suffix: row.get("include_source_suffix"),
        auto_update_minutes: row.get("auto_update_minutes"),
        auto_visual_check: row.get("auto_visual_check"),
        is_enabled: row.get("is_enabled"),
        last_updated: parse_optional_datetime(row.get("last_updated"))?,
        last_update_status: row.get("last_update_status"),
        last_request_time: parse_optional_datetime(row.get("last_request_time"))?,
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
    })
}

const OUTPUT_COLUMNS: &str = "id, name, slug, subscription_ids, filter_regex, keywords, epg_url, \
     include_source_suffix, auto_update_minutes, auto_visual_check, is_enabled, last_updated, \
     last_update_status, last_request_time, created_at";

impl Database {
    pub async fn list_outputs(&self) -> Result<Vec<OutputSource>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTPUT_COLUMNS} FROM output_sources ORDER BY created_at"
        ))
        .fetch_all(&self.pool())
        .await?;

        rows.iter().map(output_from_row).collect()
    }

    pub async fn get_output(&self, id: Uuid) -> Result<Option<OutputSource>> {
        let row = sqlx::query(&format!(
            "SELECT {OUTPUT_COLUMNS} FROM output_sources WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool())
        .await?;

        row.as_ref().map(output_from_row).transpose()
    }

    pub async fn get_output_by_slug(&self, slug: &str) -> Result<Option<OutputSource>> {
        let row = sqlx::query(&format!(
            "SELECT {OUTPUT_COLUMNS} FROM output_sources WHERE slug = ?"
        ))
        .bind(slug)
        .fetch_optional(&self.pool())
        .await?;

        row.as_ref().map(output_from_row).transpose()
    }

    /// Slug uniqueness is an invariant; callers check before mutating.
    pub async fn slug_exists(&self, slug: &str, exclude_id: Option<Uuid>) -> Result<bool> {
        let count: i64 = match exclude_id {
            Some(id) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM output_sources WHERE slug = ? AND id != ?",
                )
                .bind(slug)
                .bind(id.to_string())
                .fetch_one(&self.pool())
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM output_sources WHERE slug = ?")
                    .bind(slug)
                    .fetch_one(&self.pool())
                    .await?
            }
        };
        Ok(count > 0)
    }

    pub async fn create_output(&self, request: OutputSourceCreateRequest) -> Result<OutputSource> {
        let output = OutputSource {
            id: Uuid::new_v4(),
            name: request.name,
            slug: request.slug,
            subscription_ids: request.subscription_ids,
            filter_regex: request.filter_regex,
            keywords: normalize_keywords(request.keywords),
            epg_url: request.epg_url,
            include_source_suffix: request.include_source_suffix,
            auto_update_minutes: request.auto_update_minutes,
            auto_visual_check: request.auto_visual_check,
            is_enabled: request.is_enabled,
            last_updated: None,
            last_update_status: None,
            last_request_time: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO output_sources (id, name, slug, subscription_ids, filter_regex,
             keywords, epg_url, include_source_suffix, auto_update_minutes, auto_visual_check,
             is_enabled, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(output.id.to_string())
        .bind(&output.name)
        .bind(&output.slug)
        .bind(serde_json::to_string(&output.subscription_ids)?)
        .bind(&output.filter_regex)
        .bind(serde_json::to_string(&output.keywords)?)
        .bind(&output.epg_url)
        .bind(output.include_source_suffix)
        .bind(output.auto_update_minutes)
        .bind(output.auto_visual_check)
        .bind(output.is_enabled)
        .bind(output.created_at.to_rfc3339())
        .execute(&self.pool())
        .await?;

        Ok(output)
    }

    pub async fn update_output(
        &self,
        id: Uuid,
        request: OutputSourceUpdateRequest,
    ) -> Result<Option<OutputSource>> {
        let keywords = normalize_keywords(request.keywords);
        let result = sqlx::query(
            "UPDATE output_sources SET name = ?, slug = ?, subscription_ids = ?,
             filter_regex = ?, keywords = ?, epg_url = ?, include_source_suffix = ?,
             auto_update_minutes = ?, auto_visual_check = ?, is_enabled = ? WHERE id = ?",
        )
        .bind(&request.name)
        .bind(&request.slug)
        .bind(serde_json::to_string(&request.subscription_ids)?)
        .bind(&request.filter_regex)
        .bind(serde_json::to_string(&keywords)?)
        .bind(&request.epg_url)
        .bind(request.include_source_suffix)
        .bind(request.auto_update_minutes)
        .bind(request.auto_visual_check)
        .bind(request.is_enabled)
        .bind(id.to_string())
        .execute(&self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_output(id).await
    }

    pub async fn delete_output(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM output_sources WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_output_request_time(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE output_sources SET last_request_time = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool())
            .await?;
        Ok(())
    }

    pub async fn update_output_refresh_state(
        &self,
        id: Uuid,
        last_updated: Option<DateTime<Utc>>,
        status: &str,
    ) -> Result<()> {
        match last_updated {
            Some(ts) => {
                sqlx::query(
                    "UPDATE output_sources SET last_updated = ?, last_update_status = ?
                     WHERE id = ?",
                )
                .bind(ts.to_rfc3339())
                .bind(status)
                .bind(id.to_string())
                .execute(&self.pool())
                .await?;
            }
            None => {
                sqlx::query("UPDATE output_sources SET last_update_status = ? WHERE id = ?")
                    .bind(status)
                    .bind(id.to_string())
                    .execute(&self.pool())
                    .await?;
            }
        }
        Ok(())
    }
}
