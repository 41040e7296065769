//! Freshness scheduler
//!
//! A fixed-interval tick evaluates every subscription and output source
//! against its refresh interval and brings the stale ones up to date.
//! A tick never fails as a whole: each entity's refresh is attempted
//! independently and failures are recorded per entity.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checker::{CheckItem, StreamChecker};
use crate::database::Database;
use crate::epg::EpgCache;
use crate::ingestor::RefreshService;
use crate::models::{OutputSource, Subscription};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickEntity {
    Subscription,
    Output,
}

/// Per-entity result of one scheduler tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub entity: TickEntity,
    pub id: Uuid,
    pub name: String,
    pub success: bool,
    pub detail: String,
}

pub struct SchedulerService {
    database: Database,
    refresh: RefreshService,
    epg_cache: Arc<EpgCache>,
    checker: Arc<StreamChecker>,
    tick_interval: Duration,
    check_concurrency: usize,
}

impl SchedulerService {
    pub fn new(
        database: Database,
        refresh: RefreshService,
        epg_cache: Arc<EpgCache>,
        checker: Arc<StreamChecker>,
        tick_interval_seconds: u64,
        check_concurrency: usize,
    ) -> Self {
        Self {
            database,
            refresh,
            epg_cache,
            checker,
            tick_interval: Duration::from_secs(tick_interval_seconds),
            check_concurrency,
        }
    }

    /// Run the tick loop forever. Individual tick failures are logged and
    /// the loop keeps going.
    pub async fn run(self) {
        info!(
            "Scheduler started, evaluating freshness every {}s",
            self.tick_interval.as_secs()
        );
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let outcomes = self.tick().await;
            let failures = outcomes.iter().filter(|o| !o.success).count();
            if !outcomes.is_empty() {
                info!(
                    "Scheduler tick: {} entities refreshed, {} failed",
                    outcomes.len() - failures,
                    failures
                );
            }
        }
    }

    /// One freshness pass: stale subscriptions first, then stale outputs.
    /// Outputs go second so their per-output subscription refresh mostly
    /// finds fresh data already in place.
    pub async fn tick(&self) -> Vec<TickOutcome> {
        let now = Utc::now();
        let mut outcomes = Vec::new();

        let subscriptions = match self.database.list_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                error!("Scheduler could not list subscriptions: {}", e);
                return outcomes;
            }
        };

        for subscription in subscriptions
            .iter()
            .filter(|s| s.is_enabled && is_due(s.last_updated, s.auto_update_minutes, now))
        {
            outcomes.push(self.refresh_subscription_entity(subscription).await);
        }

        let outputs = match self.database.list_outputs().await {
            Ok(outputs) => outputs,
            Err(e) => {
                error!("Scheduler could not list output sources: {}", e);
                return outcomes;
            }
        };

        for output in outputs
            .iter()
            .filter(|o| o.is_enabled && is_due(o.last_updated, o.auto_update_minutes, now))
        {
            outcomes.push(self.refresh_output_entity(output).await);
        }

        outcomes
    }

    async fn refresh_subscription_entity(&self, subscription: &Subscription) -> TickOutcome {
        debug!("Scheduler refreshing subscription '{}'", subscription.name);
        match self
            .refresh
            .refresh_subscription(&self.database, subscription)
            .await
        {
            Ok(count) => TickOutcome {
                entity: TickEntity::Subscription,
                id: subscription.id,
                name: subscription.name.clone(),
                success: true,
                detail: format!("{count} channels"),
            },
            Err(e) => TickOutcome {
                entity: TickEntity::Subscription,
                id: subscription.id,
                name: subscription.name.clone(),
                success: false,
                detail: e.to_string(),
            },
        }
    }

    /// Refresh one output source: its subscriptions, then its EPG guide,
    /// then the visual check when enabled. A failing step records an error
    /// status on the output and skips the remaining steps.
    async fn refresh_output_entity(&self, output: &OutputSource) -> TickOutcome {
        debug!("Scheduler refreshing output '{}'", output.name);

        if let Err(e) = self.refresh_output_pipeline(output).await {
            let status = format!("Error: {e}");
            if let Err(store) = self
                .database
                .update_output_refresh_state(output.id, None, &status)
                .await
            {
                error!(
                    "Failed to record refresh failure for output '{}': {}",
                    output.name, store
                );
            }
            return TickOutcome {
                entity: TickEntity::Output,
                id: output.id,
                name: output.name.clone(),
                success: false,
                detail: e.to_string(),
            };
        }

        if let Err(e) = self
            .database
            .update_output_refresh_state(output.id, Some(Utc::now()), "Success")
            .await
        {
            error!(
                "Failed to record refresh success for output '{}': {}",
                output.name, e
            );
        }
        TickOutcome {
            entity: TickEntity::Output,
            id: output.id,
            name: output.name.clone(),
            success: true,
            detail: "refreshed".to_string(),
        }
    }

    async fn refresh_output_pipeline(&self, output: &OutputSource) -> anyhow::Result<()> {
        // Step 1: bring the member subscriptions up to date. Ids that no
        // longer resolve are skipped silently; the membership list is
        // allowed to outlive a deleted subscription.
        for subscription_id in &output.subscription_ids {
            let Some(subscription) = self.database.get_subscription(*subscription_id).await?
            else {
                debug!(
                    "Output '{}' references missing subscription {}",
                    output.name, subscription_id
                );
                continue;
            };
            if !subscription.is_enabled {
                continue;
            }
            self.refresh
                .refresh_subscription(&self.database, &subscription)
                .await?;
        }

        // Step 2: force-rebuild the EPG index if the output carries a guide.
        if let Some(epg_url) = output.epg_url.as_deref().filter(|u| !u.trim().is_empty()) {
            self.epg_cache.refresh(epg_url).await?;
        }

        // Step 3: visual check over the output's enabled channels.
        if output.auto_visual_check {
            self.run_visual_check(output).await?;
        }

        Ok(())
    }

    async fn run_visual_check(&self, output: &OutputSource) -> anyhow::Result<()> {
        let channels = self
            .database
            .channels_for_subscriptions(&output.subscription_ids, false)
            .await?;

        debug!(
            "Visual check for output '{}': {} channels",
            output.name,
            channels.len()
        );

        let items: Vec<CheckItem> = channels
            .iter()
            .map(|c| CheckItem {
                channel_id: c.id,
                url: c.url.clone(),
                is_enabled: c.is_enabled,
            })
            .collect();

        let outcomes = self
            .checker
            .check_batch(items, self.check_concurrency, true)
            .await;

        for outcome in outcomes {
            let enabled = outcome.action.map(|a| a == crate::checker::ToggleAction::Enabled);
            if let Err(e) = self
                .database
                .update_channel_check(
                    outcome.channel_id,
                    outcome.passed,
                    outcome.thumbnail.as_deref(),
                    outcome.error.as_deref(),
                    enabled,
                )
                .await
            {
                warn!(
                    "Failed to persist check result for channel {}: {}",
                    outcome.channel_id, e
                );
            }
        }

        Ok(())
    }
}

/// An entity is due when its interval is positive and either it has never
/// been refreshed or the interval has elapsed since the last refresh.
fn is_due(last_updated: Option<DateTime<Utc>>, auto_update_minutes: i64, now: DateTime<Utc>) -> bool {
    if auto_update_minutes <= 0 {
        return false;
    }
    match last_updated {
        None => true,
        Some(ts) => now - ts >= ChronoDuration::minutes(auto_update_minutes),
    }
}
