/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-memory partner API for tests.

use crate::error::ApiError;
use crate::model::{FeedPost, FollowedAccount, Page, Profile, Relationship};
use crate::partner::{GraphList, Metered, SocialGraphApi};
use crate::scheduler::{RequestScheduler, SchedulerSettings};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;

pub fn test_scheduler() -> (watch::Sender<bool>, RequestScheduler) {
    let settings = SchedulerSettings {
        base_delay: Duration::ZERO,
        ..SchedulerSettings::default()
    };
    let (tx, rx) = watch::channel(false);
    (tx, RequestScheduler::start(settings, rx))
}

pub fn post_days_ago(days: i64, pinned: bool) -> FeedPost {
    let at = OffsetDateTime::now_utc() - time::Duration::days(days);
    FeedPost {
        uri: format!("at://fake/app.bsky.feed.post/{days}"),
        created_at: Some(at),
        indexed_at: None,
        pinned,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub profile: usize,
    pub profiles: usize,
    pub graph_pages: usize,
    pub feeds: usize,
    pub relationships: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.profile + self.profiles + self.graph_pages + self.feeds + self.relationships
    }
}

#[derive(Default)]
struct Calls {
    profile: AtomicUsize,
    profiles: AtomicUsize,
    graph_pages: AtomicUsize,
    feeds: AtomicUsize,
    relationships: AtomicUsize,
}

#[derive(Default)]
pub struct FakeGraph {
    profiles: Mutex<HashMap<String, Profile>>,
    follows: Mutex<HashMap<String, Vec<FollowedAccount>>>,
    followers: Mutex<HashMap<String, Vec<FollowedAccount>>>,
    feeds: Mutex<HashMap<String, Vec<FeedPost>>>,
    feed_errors: Mutex<HashMap<String, ApiError>>,
    page_failure: Mutex<Option<(usize, ApiError)>>,
    relationship_error: Mutex<Option<ApiError>>,
    batch_sizes: Mutex<Vec<usize>>,
    batch_times: Mutex<Vec<Instant>>,
    relationship_sizes: Mutex<Vec<usize>>,
    calls: Calls,
}

impl FakeGraph {
    pub fn add_account(&self, did: &str, handle: &str, posts: Vec<FeedPost>) -> FollowedAccount {
        let profile = Profile {
            id: did.to_string(),
            handle: handle.to_string(),
            display_name: Some(handle.split('.').next().unwrap_or(handle).to_string()),
            followers_count: Some(0),
            follows_count: Some(0),
            posts_count: Some(posts.len() as u64),
        };
        let account = FollowedAccount {
            id: profile.id.clone(),
            handle: profile.handle.clone(),
            display_name: profile.display_name.clone(),
        };
        self.profiles.lock().unwrap().insert(did.to_string(), profile);
        self.feeds.lock().unwrap().insert(did.to_string(), posts);
        account
    }

    pub fn follow(&self, viewer: &str, account: &FollowedAccount) {
        self.follows
            .lock()
            .unwrap()
            .entry(viewer.to_string())
            .or_default()
            .push(account.clone());
    }

    pub fn follower(&self, viewer: &str, account: &FollowedAccount) {
        self.followers
            .lock()
            .unwrap()
            .entry(viewer.to_string())
            .or_default()
            .push(account.clone());
    }

    pub fn fail_feed(&self, did: &str, err: ApiError) {
        self.feed_errors.lock().unwrap().insert(did.to_string(), err);
    }

    pub fn drop_follower(&self, viewer: &str, did: &str) {
        if let Some(list) = self.followers.lock().unwrap().get_mut(viewer) {
            list.retain(|a| a.id != did);
        }
    }

    pub fn fail_relationships(&self, err: ApiError) {
        *self.relationship_error.lock().unwrap() = Some(err);
    }

    /// Every graph page after the first `ok_pages` fails with `err`.
    pub fn fail_pages_after(&self, ok_pages: usize, err: ApiError) {
        *self.page_failure.lock().unwrap() = Some((ok_pages, err));
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            profile: self.calls.profile.load(Ordering::SeqCst),
            profiles: self.calls.profiles.load(Ordering::SeqCst),
            graph_pages: self.calls.graph_pages.load(Ordering::SeqCst),
            feeds: self.calls.feeds.load(Ordering::SeqCst),
            relationships: self.calls.relationships.load(Ordering::SeqCst),
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    /// When each profile batch reached the API.
    pub fn batch_times(&self) -> Vec<Instant> {
        self.batch_times.lock().unwrap().clone()
    }

    pub fn relationship_sizes(&self) -> Vec<usize> {
        self.relationship_sizes.lock().unwrap().clone()
    }

    fn resolve(&self, actor: &str) -> String {
        self.profiles
            .lock()
            .unwrap()
            .values()
            .find(|p| p.handle == actor)
            .map(|p| p.id.clone())
            .unwrap_or_else(|| actor.to_string())
    }
}

fn not_found() -> ApiError {
    ApiError::Client {
        status: 400,
        message: "Profile not found".into(),
    }
}

#[async_trait]
impl SocialGraphApi for FakeGraph {
    async fn get_profile(&self, actor: &str) -> Result<Metered<Profile>, ApiError> {
        self.calls.profile.fetch_add(1, Ordering::SeqCst);
        let did = self.resolve(actor);
        let mut profile = self.profiles.lock().unwrap().get(&did).cloned().ok_or_else(not_found)?;
        if let Some(list) = self.follows.lock().unwrap().get(&did) {
            profile.follows_count = profile.follows_count.max(Some(list.len() as u64));
        }
        Ok(Metered::new(profile))
    }

    async fn get_profiles(&self, actors: &[String]) -> Result<Metered<Vec<Profile>>, ApiError> {
        self.calls.profiles.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(actors.len());
        self.batch_times.lock().unwrap().push(Instant::now());
        let profiles = self.profiles.lock().unwrap();
        let found = actors
            .iter()
            .filter_map(|a| profiles.get(a).cloned())
            .collect();
        Ok(Metered::new(found))
    }

    async fn list_graph(
        &self,
        list: GraphList,
        actor: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Metered<Page<FollowedAccount>>, ApiError> {
        let call = self.calls.graph_pages.fetch_add(1, Ordering::SeqCst);
        if let Some((ok_pages, err)) = self.page_failure.lock().unwrap().as_ref() {
            if call >= *ok_pages {
                return Err(err.clone());
            }
        }
        let did = self.resolve(actor);
        let source = match list {
            GraphList::Follows => &self.follows,
            GraphList::Followers => &self.followers,
        };
        let all = source.lock().unwrap().get(&did).cloned().unwrap_or_default();
        let offset = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = (offset + limit as usize).min(all.len());
        let items = all.get(offset..end).map(|s| s.to_vec()).unwrap_or_default();
        let cursor = (end < all.len()).then(|| end.to_string());
        Ok(Metered::new(Page { items, cursor }))
    }

    async fn get_author_feed(&self, actor: &str, limit: u32) -> Result<Metered<Vec<FeedPost>>, ApiError> {
        self.calls.feeds.fetch_add(1, Ordering::SeqCst);
        let did = self.resolve(actor);
        if let Some(err) = self.feed_errors.lock().unwrap().get(&did) {
            return Err(err.clone());
        }
        let feeds = self.feeds.lock().unwrap();
        let posts = feeds.get(&did).ok_or_else(not_found)?;
        Ok(Metered::new(posts.iter().take(limit as usize).cloned().collect()))
    }

    async fn get_relationships(
        &self,
        actor: &str,
        others: &[String],
    ) -> Result<Metered<Vec<Relationship>>, ApiError> {
        self.calls.relationships.fetch_add(1, Ordering::SeqCst);
        self.relationship_sizes.lock().unwrap().push(others.len());
        if let Some(err) = self.relationship_error.lock().unwrap().as_ref() {
            return Err(err.clone());
        }
        let did = self.resolve(actor);
        let followers = self.followers.lock().unwrap().get(&did).cloned().unwrap_or_default();
        let profiles = self.profiles.lock().unwrap();
        let found = others
            .iter()
            .filter(|o| profiles.contains_key(*o))
            .map(|o| Relationship {
                other: o.clone(),
                follows_viewer: followers.iter().any(|f| &f.id == o),
            })
            .collect();
        Ok(Metered::new(found))
    }
}
