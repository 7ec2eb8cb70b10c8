/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account_cache::AccountCache;
use crate::activity::{latest_activity, DEFAULT_PINNED_SAMPLE_WINDOW};
use crate::error::RunError;
use crate::model::{from_ms, to_ms, ActivitySnapshot, FollowedAccount};
use crate::pager::Pager;
use crate::progress::{EmitExtra, ProgressEmitter};
use dormant_protocol::{CacheStats, DataSource, Stage};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use anyhow::Context;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    pub freshness_window: Duration,
    pub pinned_sample_window: usize,
    /// Feed lookups kept in flight at once.
    pub max_concurrent: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            freshness_window: Duration::days(7),
            pinned_sample_window: DEFAULT_PINNED_SAMPLE_WINDOW,
            max_concurrent: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub snapshot: ActivitySnapshot,
    pub source: DataSource,
}

#[derive(Debug)]
pub struct Reconciliation {
    /// In the order of the input accounts; unresolved accounts are absent.
    pub results: Vec<Resolved>,
    pub stats: CacheStats,
    pub unresolved: Vec<String>,
    /// Set when the refreshed snapshots could not be written back. The
    /// results are still complete; the next run refetches them.
    pub persist_error: Option<RunError>,
}

#[derive(Clone)]
pub struct Reconciler {
    cache: AccountCache,
    pager: Pager,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(cache: AccountCache, pager: Pager, settings: ReconcileSettings) -> Self {
        Self {
            cache,
            pager,
            settings,
        }
    }

    pub async fn reconcile(
        &self,
        viewer: &str,
        accounts: &[FollowedAccount],
        progress: &ProgressEmitter,
    ) -> Result<Reconciliation, RunError> {
        // Stored timestamps have millisecond precision.
        let now = from_ms(to_ms(OffsetDateTime::now_utc()));
        let cached = self.read_cached(accounts).await;

        let mut fresh = HashMap::new();
        let mut stale = Vec::new();
        for account in accounts {
            match cached.get(&account.id) {
                Some(snap) if snap.is_fresh(now, self.settings.freshness_window) => {
                    fresh.insert(account.id.clone(), snap.clone());
                }
                _ => stale.push(account.clone()),
            }
        }
        let hits = fresh.len() as u64;
        let misses = stale.len() as u64;
        progress.record_hits(hits);
        progress.record_misses(misses);
        info!(
            "reconcile {}: {hits} fresh in cache, {misses} to refresh",
            accounts.len()
        );

        let mut fetched = HashMap::new();
        let mut unresolved = Vec::new();
        let mut persist_error = None;
        if !stale.is_empty() {
            let result = self
                .refresh(viewer, &stale, &cached, now, progress)
                .await;
            let (snaps, failed) = match result {
                Ok(v) => v,
                Err(e) => {
                    progress.cancel();
                    return Err(e);
                }
            };
            unresolved = failed;
            if let Err(e) = self.persist(&snaps).await {
                warn!("cache write failed, returning unsaved results: {e:#}");
                persist_error = Some(RunError::Persistence(e));
            }
            fetched = snaps
                .into_iter()
                .map(|s| (s.account_id.clone(), s))
                .collect::<HashMap<_, _>>();
        }

        let results = accounts
            .iter()
            .filter_map(|a| {
                if let Some(s) = fresh.remove(&a.id) {
                    return Some(Resolved {
                        snapshot: s,
                        source: DataSource::Cache,
                    });
                }
                fetched.remove(&a.id).map(|s| Resolved {
                    snapshot: s,
                    source: DataSource::Api,
                })
            })
            .collect();

        Ok(Reconciliation {
            results,
            stats: CacheStats::from_counts(hits, misses),
            unresolved,
            persist_error,
        })
    }

    async fn read_cached(&self, accounts: &[FollowedAccount]) -> HashMap<String, ActivitySnapshot> {
        let ids = accounts.iter().map(|a| a.id.clone()).collect::<Vec<_>>();
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.get_many(&ids)).await {
            Ok(Ok(map)) => map,
            Ok(Err(e)) => {
                warn!("cache read failed, refreshing everything: {e:#}");
                HashMap::new()
            }
            Err(e) => {
                warn!("cache read task failed: {e}");
                HashMap::new()
            }
        }
    }

    /// One transaction for the whole batch; on error nothing was written.
    async fn persist(&self, snaps: &[ActivitySnapshot]) -> anyhow::Result<()> {
        if snaps.is_empty() {
            return Ok(());
        }
        let cache = self.cache.clone();
        let rows = snaps.to_vec();
        let n = tokio::task::spawn_blocking(move || cache.upsert_many(&rows))
            .await
            .context("cache write task")??;
        info!("cached {n} account snapshots");
        Ok(())
    }

    async fn refresh(
        &self,
        viewer: &str,
        stale: &[FollowedAccount],
        cached: &HashMap<String, ActivitySnapshot>,
        now: OffsetDateTime,
        progress: &ProgressEmitter,
    ) -> Result<(Vec<ActivitySnapshot>, Vec<String>), RunError> {
        let (hits, _) = progress.cache_counts();
        progress.emit(
            Stage::Profiles,
            hits,
            hits + stale.len() as u64,
            format!("{hits} accounts served from cache"),
            EmitExtra::source(DataSource::Cache),
        );

        let ids = stale.iter().map(|a| a.id.clone()).collect::<Vec<_>>();
        let profiles = self
            .pager
            .batch_lookup(&ids, progress)
            .await
            .map_err(RunError::from_api)?;

        let cancel = progress.cancel_signal();
        let follows_back = self
            .pager
            .follows_back(viewer, &ids, &cancel)
            .await
            .map_err(RunError::from_api)?;

        let total = stale.len() as u64;
        let mut feeds = stream::iter(stale.iter().cloned())
            .map(|account| {
                let pager = self.pager.clone();
                let cancel = cancel.clone();
                async move {
                    let res = pager.recent_feed(&account.id, &cancel).await;
                    (account, res)
                }
            })
            .buffer_unordered(self.settings.max_concurrent.max(1));

        let mut out = Vec::with_capacity(stale.len());
        let mut failed = Vec::new();
        let mut processed = 0u64;
        while let Some((account, res)) = feeds.next().await {
            processed += 1;
            match res {
                Ok(posts) => {
                    let profile = profiles.get(&account.id);
                    let last_checked_at = cached
                        .get(&account.id)
                        .map(|c| c.last_checked_at.max(now))
                        .unwrap_or(now);
                    out.push(ActivitySnapshot {
                        account_id: account.id.clone(),
                        handle: profile.map(|p| p.handle.clone()).unwrap_or_else(|| account.handle.clone()),
                        display_name: profile
                            .and_then(|p| p.display_name.clone())
                            .or_else(|| account.display_name.clone()),
                        last_post_at: from_ms(to_ms(latest_activity(
                            &posts,
                            self.settings.pinned_sample_window,
                        ))),
                        last_checked_at,
                        post_count: profile.and_then(|p| p.posts_count),
                        follower_count: profile.and_then(|p| p.followers_count),
                        follows_back: follows_back
                            .get(&account.id)
                            .copied()
                            .or_else(|| cached.get(&account.id).map(|c| c.follows_back))
                            .unwrap_or(false),
                    });
                }
                Err(e) if e.is_per_account() => {
                    warn!("skipping {}: {e}", account.handle);
                    failed.push(account.id.clone());
                }
                Err(e) => return Err(RunError::from_api(e)),
            }
            progress.emit(
                Stage::Feeds,
                processed,
                total,
                account.handle.clone(),
                EmitExtra::source(DataSource::Api),
            );
        }
        Ok((out, failed))
    }
}
