/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Follower snapshots: each check lists the viewer's followers and diffs
//! them against the previous listing to find who left.

use crate::account_cache::{AccountCache, UnfollowerRow};
use crate::error::RunError;
use crate::model::{format_rfc3339, from_ms, to_ms};
use crate::pager::Pager;
use crate::partner::GraphList;
use crate::progress::ProgressEmitter;
use crate::scheduler::CancelSignal;
use anyhow::Context;
use dormant_protocol::{FollowerCheckResponse, Unfollower, UnfollowersResponse};
use std::collections::HashSet;
use time::OffsetDateTime;
use tracing::info;

#[derive(Clone)]
pub struct FollowerTracker {
    cache: AccountCache,
    pager: Pager,
    max_followers: u64,
}

impl FollowerTracker {
    pub fn new(cache: AccountCache, pager: Pager, max_followers: u64) -> Self {
        Self {
            cache,
            pager,
            max_followers: max_followers.max(1),
        }
    }

    /// Lists the current followers of `actor` and records them. Accounts
    /// present in the previous listing but not in this one are returned as
    /// unfollowed. The first check only records a baseline.
    pub async fn check(&self, actor: &str, progress: &ProgressEmitter) -> Result<FollowerCheckResponse, RunError> {
        let cancel = progress.cancel_signal();
        let viewer = self
            .pager
            .profile(actor, &cancel)
            .await
            .map_err(RunError::from_api)?;
        self.check_count(viewer.followers_count.unwrap_or(0))?;

        let followers = self
            .pager
            .list_all(GraphList::Followers, &viewer.id, viewer.followers_count, progress)
            .await
            .map_err(RunError::from_api)?;
        self.check_count(followers.len() as u64)?;

        let ids = followers.into_iter().map(|a| a.id).collect::<Vec<_>>();
        let checked = ids.len() as u64;
        let at_ms = to_ms(OffsetDateTime::now_utc());
        let cache = self.cache.clone();
        let did = viewer.id.clone();
        let (diff, rows) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let diff = cache.record_followers(&did, &ids, at_ms)?;
            let rows = cache.unfollowers(&did)?;
            Ok((diff, rows))
        })
        .await
        .context("follower write task")
        .and_then(|r| r)
        .map_err(RunError::Persistence)?;

        let gone = diff.unfollowed.iter().collect::<HashSet<_>>();
        let unfollowed = rows
            .into_iter()
            .filter(|r| gone.contains(&r.did))
            .map(to_unfollower)
            .collect::<Vec<_>>();
        if diff.baseline {
            info!("follower baseline for {}: {checked} followers", viewer.handle);
        } else {
            info!(
                "follower check for {}: {checked} followers, {} new, {} unfollowed",
                viewer.handle,
                diff.new_followers.len(),
                unfollowed.len()
            );
        }

        Ok(FollowerCheckResponse {
            did: viewer.id,
            followers_checked: checked,
            new_followers: if diff.baseline { 0 } else { diff.new_followers.len() as u64 },
            unfollowed,
            checked_at: format_rfc3339(from_ms(at_ms)),
        })
    }

    /// Everyone recorded as having unfollowed `actor`, most recent first.
    /// A DID is used as is; a handle is resolved through the API.
    pub async fn unfollowers(&self, actor: &str, cancel: &CancelSignal) -> Result<UnfollowersResponse, RunError> {
        let did = if actor.starts_with("did:") {
            actor.to_string()
        } else {
            self.pager
                .profile(actor, cancel)
                .await
                .map_err(RunError::from_api)?
                .id
        };
        let cache = self.cache.clone();
        let key = did.clone();
        let (rows, last) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            Ok((cache.unfollowers(&key)?, cache.last_follower_check(&key)?))
        })
        .await
        .context("follower read task")
        .and_then(|r| r)
        .map_err(RunError::Persistence)?;

        Ok(UnfollowersResponse {
            did,
            unfollowers: rows.into_iter().map(to_unfollower).collect(),
            last_checked: last.map(|c| format_rfc3339(from_ms(c.checked_at_ms))),
        })
    }

    fn check_count(&self, count: u64) -> Result<(), RunError> {
        if count > self.max_followers {
            return Err(RunError::TooManyFollowers {
                count,
                limit: self.max_followers,
            });
        }
        Ok(())
    }
}

fn to_unfollower(row: UnfollowerRow) -> Unfollower {
    Unfollower {
        did: row.did,
        handle: row.handle,
        first_seen: format_rfc3339(from_ms(row.first_seen_ms)),
        unfollowed_at: format_rfc3339(from_ms(row.unfollowed_at_ms)),
    }
}
