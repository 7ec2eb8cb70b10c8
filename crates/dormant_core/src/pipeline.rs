/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account_cache::AccountCache;
use crate::error::RunError;
use crate::pager::Pager;
use crate::partner::GraphList;
use crate::progress::{EmitExtra, ProgressEmitter};
use crate::reconcile::{Reconciler, ReconcileSettings, Resolved};
use crate::scheduler::RequestScheduler;
use dormant_protocol::{CacheStats, InactiveFollow, InactiveFollowsResponse, Stage};
use serde::Deserialize;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub max_follows: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { max_follows: 10_000 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Most recent post first.
    #[default]
    LastPost,
    Handle,
}

#[derive(Debug, Clone)]
pub struct InactiveQuery {
    /// Handle or DID of the viewer.
    pub actor: String,
    pub days: u32,
    pub sort: SortOrder,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub inactive_follows: Vec<InactiveFollow>,
    pub cache_stats: CacheStats,
    pub total_follows: u64,
    pub unresolved: usize,
    pub elapsed: Duration,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn into_response(self) -> InactiveFollowsResponse {
        InactiveFollowsResponse {
            inactive_follows: self.inactive_follows,
            cache_stats: self.cache_stats,
            total_follows: self.total_follows,
            warnings: self.warnings,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    pager: Pager,
    reconciler: Reconciler,
    cache: AccountCache,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        cache: AccountCache,
        pager: Pager,
        reconcile: ReconcileSettings,
        settings: PipelineSettings,
    ) -> Self {
        let reconciler = Reconciler::new(cache.clone(), pager.clone(), reconcile);
        Self {
            pager,
            reconciler,
            cache,
            settings,
        }
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        self.pager.scheduler()
    }

    pub fn cache(&self) -> &AccountCache {
        &self.cache
    }

    /// Runs one query and closes `progress` with its outcome.
    pub async fn run(&self, query: &InactiveQuery, progress: &ProgressEmitter) -> Result<RunReport, RunError> {
        let res = self.execute(query, progress).await;
        match &res {
            Ok(report) => {
                info!(
                    "run for {} done: {} of {} follows inactive, hit rate {}%, {:.1}s",
                    query.actor,
                    report.inactive_follows.len(),
                    report.total_follows,
                    report.cache_stats.hit_rate,
                    report.elapsed.as_secs_f64()
                );
                progress.complete(
                    report.inactive_follows.clone(),
                    report.cache_stats,
                    report.warnings.clone(),
                );
            }
            Err(e) => {
                warn!("run for {} failed: {e}", query.actor);
                progress.fail(e);
            }
        }
        res
    }

    async fn execute(&self, query: &InactiveQuery, progress: &ProgressEmitter) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let cancel = progress.cancel_signal();
        let days = query.days.max(1);

        progress.emit(
            Stage::Cache,
            0,
            0,
            format!("resolving {}", query.actor),
            EmitExtra::default(),
        );
        let viewer = self
            .pager
            .profile(&query.actor, &cancel)
            .await
            .map_err(RunError::from_api)?;
        self.check_follow_count(viewer.follows_count.unwrap_or(0))?;

        let follows = self
            .pager
            .list_all(GraphList::Follows, &viewer.id, viewer.follows_count, progress)
            .await
            .map_err(RunError::from_api)?;
        self.check_follow_count(follows.len() as u64)?;

        let rec = self.reconciler.reconcile(&viewer.id, &follows, progress).await?;

        let now = OffsetDateTime::now_utc();
        let mut inactive = rec
            .results
            .iter()
            .filter(|r| r.snapshot.is_inactive(now, days))
            .collect::<Vec<_>>();
        sort_results(&mut inactive, query.sort);
        let inactive_follows = inactive
            .into_iter()
            .map(|r| r.snapshot.to_inactive_follow(r.source))
            .collect::<Vec<_>>();

        let elapsed = started.elapsed();
        self.record_run(&rec.stats, rec.unresolved.len(), inactive_follows.len(), elapsed)
            .await;

        let mut warnings = Vec::new();
        if let Some(e) = &rec.persist_error {
            warnings.push(e.to_string());
        }
        if !rec.unresolved.is_empty() {
            warnings.push(format!("unresolved accounts: {}", rec.unresolved.len()));
        }

        Ok(RunReport {
            inactive_follows,
            cache_stats: rec.stats,
            total_follows: follows.len() as u64,
            unresolved: rec.unresolved.len(),
            elapsed,
            warnings,
        })
    }

    fn check_follow_count(&self, count: u64) -> Result<(), RunError> {
        if count > self.settings.max_follows {
            return Err(RunError::TooManyFollows {
                count,
                limit: self.settings.max_follows,
            });
        }
        Ok(())
    }

    async fn record_run(&self, stats: &CacheStats, unresolved: usize, inactive: usize, elapsed: Duration) {
        let processed = stats.total_processed;
        let elapsed_secs = elapsed.as_secs_f64();
        let value = serde_json::json!({
            "processed": processed,
            "cache_hits": stats.cache_hits,
            "cache_misses": stats.cache_misses,
            "hit_rate": stats.hit_rate,
            "unresolved": unresolved,
            "inactive": inactive,
            "elapsed_secs": elapsed_secs,
            "avg_secs_per_item": if processed > 0 { elapsed_secs / processed as f64 } else { 0.0 },
        });
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.record_stat("query_performance", &value)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("record run stats failed: {e:#}"),
            Err(e) => warn!("record run stats task failed: {e}"),
        }
    }
}

fn sort_results(items: &mut [&Resolved], order: SortOrder) {
    match order {
        SortOrder::LastPost => items.sort_by(|a, b| {
            b.snapshot
                .last_post_at
                .cmp(&a.snapshot.last_post_at)
                .then_with(|| a.snapshot.handle.cmp(&b.snapshot.handle))
        }),
        SortOrder::Handle => items.sort_by(|a, b| {
            a.snapshot
                .handle
                .to_lowercase()
                .cmp(&b.snapshot.handle.to_lowercase())
        }),
    }
}
