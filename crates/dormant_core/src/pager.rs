/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::ApiError;
use crate::model::{FeedPost, FollowedAccount, Profile};
use crate::partner::{GraphList, SocialGraphApi, MAX_RELATIONSHIP_ACTORS};
use crate::progress::{EmitExtra, ProgressEmitter};
use crate::scheduler::{CancelSignal, RequestScheduler};
use dormant_protocol::Stage;
use futures_util::stream::{self, Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct PagerSettings {
    /// Page size asked of list endpoints (the API caps it at 100).
    pub page_limit: u32,
    pub profile_batch_size: usize,
    pub inter_chunk_delay: Duration,
    pub feed_limit: u32,
}

impl Default for PagerSettings {
    fn default() -> Self {
        Self {
            page_limit: 100,
            profile_batch_size: 25,
            inter_chunk_delay: Duration::from_millis(200),
            feed_limit: 10,
        }
    }
}

#[derive(Clone)]
pub struct Pager {
    api: Arc<dyn SocialGraphApi>,
    scheduler: RequestScheduler,
    settings: PagerSettings,
}

impl Pager {
    pub fn new(api: Arc<dyn SocialGraphApi>, scheduler: RequestScheduler, settings: PagerSettings) -> Self {
        let settings = PagerSettings {
            page_limit: settings.page_limit.clamp(1, 100),
            profile_batch_size: settings.profile_batch_size.clamp(1, 25),
            ..settings
        };
        Self {
            api,
            scheduler,
            settings,
        }
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub async fn profile(&self, actor: &str, cancel: &CancelSignal) -> Result<Profile, ApiError> {
        let api = self.api.clone();
        let actor = actor.to_string();
        self.scheduler
            .submit(cancel, "getProfile", move || {
                let api = api.clone();
                let actor = actor.clone();
                async move { api.get_profile(&actor).await }
            })
            .await
    }

    /// Lazy cursor walk over `list` for `actor`. Each page is requested only
    /// once the previous one was consumed; the stream ends after the first
    /// error, a page without cursor, or an empty page.
    pub fn pages(
        &self,
        list: GraphList,
        actor: &str,
        cancel: CancelSignal,
    ) -> impl Stream<Item = Result<Vec<FollowedAccount>, ApiError>> + Send + 'static {
        let api = self.api.clone();
        let scheduler = self.scheduler.clone();
        let limit = self.settings.page_limit;
        let actor = actor.to_string();
        let label = match list {
            GraphList::Follows => "getFollows",
            GraphList::Followers => "getFollowers",
        };

        // None: finished. Some(None): first page. Some(Some(c)): page at cursor c.
        stream::unfold(Some(None::<String>), move |state| {
            let api = api.clone();
            let scheduler = scheduler.clone();
            let actor = actor.clone();
            let cancel = cancel.clone();
            async move {
                let cursor = state?;
                let res = scheduler
                    .submit(&cancel, label, move || {
                        let api = api.clone();
                        let actor = actor.clone();
                        let cursor = cursor.clone();
                        async move { api.list_graph(list, &actor, cursor.as_deref(), limit).await }
                    })
                    .await;
                match res {
                    Ok(page) => {
                        let next = if page.items.is_empty() {
                            None
                        } else {
                            page.cursor.map(Some)
                        };
                        Some((Ok(page.items), next))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
    }

    /// Full listing, de-duplicated by id, in API order.
    pub async fn list_all(
        &self,
        list: GraphList,
        actor: &str,
        expected_total: Option<u64>,
        progress: &ProgressEmitter,
    ) -> Result<Vec<FollowedAccount>, ApiError> {
        let mut pages = std::pin::pin!(self.pages(list, actor, progress.cancel_signal()));
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut page_no = 0u64;
        while let Some(page) = pages.next().await {
            let page = page?;
            page_no += 1;
            for account in page {
                if seen.insert(account.id.clone()) {
                    out.push(account);
                }
            }
            let total = expected_total.unwrap_or(0).max(out.len() as u64);
            let what = match list {
                GraphList::Follows => "follows",
                GraphList::Followers => "followers",
            };
            progress.emit(
                Stage::Follows,
                out.len() as u64,
                total,
                format!("{what} page {page_no}"),
                EmitExtra::default(),
            );
        }
        debug!("listed {} {:?} of {actor} in {page_no} pages", out.len(), list);
        Ok(out)
    }

    /// Profiles for `ids`, looked up in chunks of `profile_batch_size`.
    /// A chunk rejected for its own content is skipped; anything else aborts.
    pub async fn batch_lookup(
        &self,
        ids: &[String],
        progress: &ProgressEmitter,
    ) -> Result<HashMap<String, Profile>, ApiError> {
        let cancel = progress.cancel_signal();
        let chunks = ids
            .chunks(self.settings.profile_batch_size)
            .map(|c| Arc::new(c.to_vec()))
            .collect::<Vec<_>>();
        let total_chunks = chunks.len() as u64;
        let mut out = HashMap::with_capacity(ids.len());
        let mut processed = 0u64;

        for (i, chunk) in chunks.into_iter().enumerate() {
            if i > 0 {
                self.pause_between_chunks().await;
            }
            let n = chunk.len() as u64;
            let api = self.api.clone();
            let res = self
                .scheduler
                .submit(&cancel, "getProfiles", move || {
                    let api = api.clone();
                    let chunk = chunk.clone();
                    async move { api.get_profiles(&chunk).await }
                })
                .await;
            match res {
                Ok(profiles) => {
                    for p in profiles {
                        out.insert(p.id.clone(), p);
                    }
                }
                Err(e) if e.is_per_account() => {
                    warn!("profile batch {}/{total_chunks} rejected: {e}", i + 1);
                }
                Err(e) => return Err(e),
            }
            processed += n;
            progress.emit(
                Stage::Profiles,
                processed,
                ids.len() as u64,
                format!("profile batch {}/{total_chunks}", i + 1),
                EmitExtra::batch(i as u64 + 1, total_chunks),
            );
        }
        Ok(out)
    }

    /// Whether each of `ids` follows `viewer`, asked in chunks of
    /// [`MAX_RELATIONSHIP_ACTORS`]. Ids from a rejected chunk, or unknown to
    /// the API, are absent from the result.
    pub async fn follows_back(
        &self,
        viewer: &str,
        ids: &[String],
        cancel: &CancelSignal,
    ) -> Result<HashMap<String, bool>, ApiError> {
        let mut out = HashMap::with_capacity(ids.len());
        for (i, chunk) in ids.chunks(MAX_RELATIONSHIP_ACTORS).enumerate() {
            if i > 0 {
                self.pause_between_chunks().await;
            }
            let api = self.api.clone();
            let viewer = viewer.to_string();
            let chunk = Arc::new(chunk.to_vec());
            let res = self
                .scheduler
                .submit(cancel, "getRelationships", move || {
                    let api = api.clone();
                    let viewer = viewer.clone();
                    let chunk = chunk.clone();
                    async move { api.get_relationships(&viewer, &chunk).await }
                })
                .await;
            match res {
                Ok(rels) => {
                    for r in rels {
                        out.insert(r.other, r.follows_viewer);
                    }
                }
                Err(e) if e.is_per_account() => warn!("relationship batch {} rejected: {e}", i + 1),
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn pause_between_chunks(&self) {
        if !self.settings.inter_chunk_delay.is_zero() {
            tokio::time::sleep(self.settings.inter_chunk_delay).await;
        }
    }

    pub async fn recent_feed(&self, actor: &str, cancel: &CancelSignal) -> Result<Vec<FeedPost>, ApiError> {
        let api = self.api.clone();
        let actor = actor.to_string();
        let limit = self.settings.feed_limit;
        self.scheduler
            .submit(cancel, "getAuthorFeed", move || {
                let api = api.clone();
                let actor = actor.clone();
                async move { api.get_author_feed(&actor, limit).await }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_scheduler, FakeGraph};
    use dormant_protocol::StreamFrame;

    fn pager(api: Arc<FakeGraph>, page_limit: u32) -> (tokio::sync::watch::Sender<bool>, Pager) {
        paced_pager(api, page_limit, Duration::ZERO)
    }

    fn paced_pager(
        api: Arc<FakeGraph>,
        page_limit: u32,
        inter_chunk_delay: Duration,
    ) -> (tokio::sync::watch::Sender<bool>, Pager) {
        let (stop, scheduler) = test_scheduler();
        let settings = PagerSettings {
            page_limit,
            inter_chunk_delay,
            ..PagerSettings::default()
        };
        (stop, Pager::new(api, scheduler, settings))
    }

    #[tokio::test(start_paused = true)]
    async fn sixty_ids_take_three_lookups() {
        let fake = Arc::new(FakeGraph::default());
        let ids = (0..60)
            .map(|i| fake.add_account(&format!("did:plc:{i}"), &format!("u{i}.test"), vec![]).id)
            .collect::<Vec<_>>();
        let (_stop, pager) = pager(fake.clone(), 100);
        let (progress, mut rx) = ProgressEmitter::channel();

        let found = pager.batch_lookup(&ids, &progress).await.unwrap();
        assert_eq!(found.len(), 60);
        assert_eq!(fake.calls().profiles, 3);
        assert_eq!(fake.batch_sizes(), vec![25, 25, 10]);

        let mut batches = Vec::new();
        while let Ok(StreamFrame::Progress(e)) = rx.try_recv() {
            batches.push((e.processed, e.batch_progress.map(|b| (b.current, b.total))));
        }
        assert_eq!(
            batches,
            vec![(25, Some((1, 3))), (50, Some((2, 3))), (60, Some((3, 3)))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn listing_is_complete_for_any_page_size() {
        let fake = Arc::new(FakeGraph::default());
        fake.add_account("did:plc:viewer", "viewer.test", vec![]);
        for i in 0..23 {
            let acct = fake.add_account(&format!("did:plc:{i}"), &format!("u{i}.test"), vec![]);
            fake.follow("did:plc:viewer", &acct);
        }
        for page_limit in [1, 2, 5, 7, 22, 23, 100] {
            let (_stop, pager) = pager(fake.clone(), page_limit);
            let progress = ProgressEmitter::detached();
            let listed = pager
                .list_all(GraphList::Follows, "viewer.test", Some(23), &progress)
                .await
                .unwrap();
            let ids = listed.iter().map(|a| a.id.as_str()).collect::<Vec<_>>();
            let expected = (0..23).map(|i| format!("did:plc:{i}")).collect::<Vec<_>>();
            assert_eq!(ids, expected, "page_limit={page_limit}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_across_pages_are_dropped() {
        let fake = Arc::new(FakeGraph::default());
        let a = fake.add_account("did:plc:a", "a.test", vec![]);
        let b = fake.add_account("did:plc:b", "b.test", vec![]);
        fake.follow("did:plc:viewer", &a);
        fake.follow("did:plc:viewer", &b);
        fake.follow("did:plc:viewer", &a);
        let (_stop, pager) = pager(fake, 1);
        let listed = pager
            .list_all(GraphList::Follows, "did:plc:viewer", None, &ProgressEmitter::detached())
            .await
            .unwrap();
        assert_eq!(listed, vec![a, b]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_mid_walk_aborts_the_listing() {
        let fake = Arc::new(FakeGraph::default());
        for i in 0..5 {
            let acct = fake.add_account(&format!("did:plc:{i}"), &format!("u{i}.test"), vec![]);
            fake.follow("did:plc:viewer", &acct);
        }
        fake.fail_pages_after(2, ApiError::Client {
            status: 400,
            message: "InvalidCursor".into(),
        });
        let (_stop, pager) = pager(fake.clone(), 2);
        let res = pager
            .list_all(GraphList::Follows, "did:plc:viewer", None, &ProgressEmitter::detached())
            .await;
        assert!(matches!(res, Err(ApiError::Client { .. })));
        assert_eq!(fake.calls().graph_pages, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pages_are_requested_lazily() {
        let fake = Arc::new(FakeGraph::default());
        for i in 0..10 {
            let acct = fake.add_account(&format!("did:plc:{i}"), &format!("u{i}.test"), vec![]);
            fake.follow("did:plc:viewer", &acct);
        }
        let (_stop, pager) = pager(fake.clone(), 3);
        let mut pages = std::pin::pin!(pager.pages(GraphList::Follows, "did:plc:viewer", CancelSignal::never()));
        let first = pages.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(fake.calls().graph_pages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn followers_walk_uses_the_followers_list() {
        let fake = Arc::new(FakeGraph::default());
        let a = fake.add_account("did:plc:a", "a.test", vec![]);
        fake.follower("did:plc:viewer", &a);
        let (_stop, pager) = pager(fake, 100);
        let progress = ProgressEmitter::detached();
        let followers = pager
            .list_all(GraphList::Followers, "did:plc:viewer", None, &progress)
            .await
            .unwrap();
        assert_eq!(followers, vec![a]);
        let follows = pager
            .list_all(GraphList::Follows, "did:plc:viewer", None, &progress)
            .await
            .unwrap();
        assert!(follows.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn profile_chunks_are_spaced_by_the_inter_chunk_delay() {
        let fake = Arc::new(FakeGraph::default());
        let ids = (0..60)
            .map(|i| fake.add_account(&format!("did:plc:{i}"), &format!("u{i}.test"), vec![]).id)
            .collect::<Vec<_>>();
        let (_stop, pager) = paced_pager(fake.clone(), 100, Duration::from_millis(200));

        let start = tokio::time::Instant::now();
        pager.batch_lookup(&ids, &ProgressEmitter::detached()).await.unwrap();

        let times = fake.batch_times();
        assert_eq!(times.len(), 3);
        assert!(times[0] - start < Duration::from_millis(200));
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200), "{:?}", pair[1] - pair[0]);
        }
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn follows_back_is_asked_in_chunks_of_thirty() {
        let fake = Arc::new(FakeGraph::default());
        let accounts = (0..65)
            .map(|i| fake.add_account(&format!("did:plc:{i}"), &format!("u{i}.test"), vec![]))
            .collect::<Vec<_>>();
        fake.follower("did:plc:viewer", &accounts[3]);
        fake.follower("did:plc:viewer", &accounts[64]);
        let (_stop, pager) = pager(fake.clone(), 100);

        let mut ids = accounts.iter().map(|a| a.id.clone()).collect::<Vec<_>>();
        ids.push("did:plc:gone".into());
        let back = pager
            .follows_back("did:plc:viewer", &ids, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(fake.relationship_sizes(), vec![30, 30, 6]);
        assert_eq!(back.len(), 65);
        assert_eq!(back.values().filter(|v| **v).count(), 2);
        assert_eq!(back.get("did:plc:64"), Some(&true));
        assert!(!back.contains_key("did:plc:gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_relationship_chunks_are_skipped() {
        let fake = Arc::new(FakeGraph::default());
        let a = fake.add_account("did:plc:a", "a.test", vec![]);
        fake.fail_relationships(ApiError::Client {
            status: 400,
            message: "InvalidRequest".into(),
        });
        let (_stop, pager) = pager(fake, 100);
        let back = pager
            .follows_back("did:plc:viewer", &[a.id], &CancelSignal::never())
            .await
            .unwrap();
        assert!(back.is_empty());
    }
}
