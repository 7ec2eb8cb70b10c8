/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::ApiError;
use crate::model::{parse_rfc3339, FeedPost, FollowedAccount, Page, Profile, Relationship};
use anyhow::{Context, Result};
use async_trait::async_trait;
use http::HeaderMap;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use urlencoding::encode;

pub const DEFAULT_API_BASE: &str = "https://public.api.bsky.app";

/// Server-side cap on `others` for `app.bsky.graph.getRelationships`.
pub const MAX_RELATIONSHIP_ACTORS: usize = 30;

/// Rate-limit metadata attached to a partner response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaHeaders {
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    /// Unix seconds at which the current window resets.
    pub reset_epoch_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Metered<T> {
    pub value: T,
    pub quota: Option<QuotaHeaders>,
}

impl<T> Metered<T> {
    pub fn new(value: T) -> Self {
        Self { value, quota: None }
    }

    pub fn with_quota(value: T, quota: QuotaHeaders) -> Self {
        Self {
            value,
            quota: Some(quota),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphList {
    /// Accounts followed by the actor.
    Follows,
    /// Accounts following the actor.
    Followers,
}

impl GraphList {
    fn nsid(self) -> &'static str {
        match self {
            GraphList::Follows => "app.bsky.graph.getFollows",
            GraphList::Followers => "app.bsky.graph.getFollowers",
        }
    }
}

/// The partner social-graph API.
#[async_trait]
pub trait SocialGraphApi: Send + Sync + 'static {
    async fn get_profile(&self, actor: &str) -> Result<Metered<Profile>, ApiError>;

    async fn get_profiles(&self, actors: &[String]) -> Result<Metered<Vec<Profile>>, ApiError>;

    async fn list_graph(
        &self,
        list: GraphList,
        actor: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Metered<Page<FollowedAccount>>, ApiError>;

    async fn get_author_feed(&self, actor: &str, limit: u32) -> Result<Metered<Vec<FeedPost>>, ApiError>;

    /// Relationships between `actor` and each of `others` (at most
    /// [`MAX_RELATIONSHIP_ACTORS`]). Unknown accounts are left out.
    async fn get_relationships(
        &self,
        actor: &str,
        others: &[String],
    ) -> Result<Metered<Vec<Relationship>>, ApiError>;
}

#[derive(Clone)]
pub struct XrpcClient {
    http: reqwest::Client,
    base_url: String,
}

impl XrpcClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("dormant/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, nsid: &str, query: &[(&str, String)]) -> String {
        let qs = query
            .iter()
            .map(|(k, v)| format!("{k}={}", encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        if qs.is_empty() {
            format!("{}/xrpc/{nsid}", self.base_url)
        } else {
            format!("{}/xrpc/{nsid}?{qs}", self.base_url)
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        nsid: &str,
        query: &[(&str, String)],
    ) -> Result<Metered<T>, ApiError> {
        let resp = self
            .http
            .get(self.url(nsid, query))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error(nsid, e))?;

        let status = resp.status();
        let quota = quota_from_headers(resp.headers());
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::QuotaExceeded {
                retry_after: retry_after_from_headers(resp.headers(), SystemTime::now()),
            });
        }
        if status.is_server_error() {
            return Err(ApiError::Transient(format!("{nsid}: upstream status {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Client {
                status: status.as_u16(),
                message: xrpc_error_message(&body).unwrap_or_else(|| format!("{nsid} failed")),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| transport_error(nsid, e))?;
        let value = serde_json::from_slice::<T>(&bytes)
            .map_err(|e| ApiError::Decode(format!("{nsid}: {e}")))?;
        Ok(Metered::with_quota(value, quota))
    }
}

#[async_trait]
impl SocialGraphApi for XrpcClient {
    async fn get_profile(&self, actor: &str) -> Result<Metered<Profile>, ApiError> {
        let res: Metered<WireProfile> = self
            .get_json("app.bsky.actor.getProfile", &[("actor", actor.to_string())])
            .await?;
        Ok(Metered {
            value: res.value.into(),
            quota: res.quota,
        })
    }

    async fn get_profiles(&self, actors: &[String]) -> Result<Metered<Vec<Profile>>, ApiError> {
        let query = actors
            .iter()
            .map(|a| ("actors", a.clone()))
            .collect::<Vec<_>>();
        let res: Metered<WireProfiles> = self.get_json("app.bsky.actor.getProfiles", &query).await?;
        Ok(Metered {
            value: res.value.profiles.into_iter().map(Profile::from).collect(),
            quota: res.quota,
        })
    }

    async fn list_graph(
        &self,
        list: GraphList,
        actor: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Metered<Page<FollowedAccount>>, ApiError> {
        let mut query = vec![("actor", actor.to_string()), ("limit", limit.clamp(1, 100).to_string())];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }
        let res: Metered<WireGraphPage> = self.get_json(list.nsid(), &query).await?;
        let WireGraphPage {
            follows,
            followers,
            cursor,
        } = res.value;
        let items = follows
            .into_iter()
            .chain(followers)
            .map(|p| FollowedAccount {
                id: p.did,
                handle: p.handle,
                display_name: p.display_name.filter(|s| !s.trim().is_empty()),
            })
            .collect();
        Ok(Metered {
            value: Page {
                items,
                cursor: cursor.filter(|c| !c.is_empty()),
            },
            quota: res.quota,
        })
    }

    async fn get_author_feed(&self, actor: &str, limit: u32) -> Result<Metered<Vec<FeedPost>>, ApiError> {
        let query = [
            ("actor", actor.to_string()),
            ("limit", limit.clamp(1, 100).to_string()),
            ("filter", "posts_with_replies".to_string()),
        ];
        let res: Metered<WireFeed> = self.get_json("app.bsky.feed.getAuthorFeed", &query).await?;
        Ok(Metered {
            value: res.value.feed.into_iter().map(FeedPost::from).collect(),
            quota: res.quota,
        })
    }

    async fn get_relationships(
        &self,
        actor: &str,
        others: &[String],
    ) -> Result<Metered<Vec<Relationship>>, ApiError> {
        let mut query = vec![("actor", actor.to_string())];
        query.extend(
            others
                .iter()
                .take(MAX_RELATIONSHIP_ACTORS)
                .map(|o| ("others", o.clone())),
        );
        let res: Metered<WireRelationships> =
            self.get_json("app.bsky.graph.getRelationships", &query).await?;
        Ok(Metered {
            value: res.value.into_relationships(),
            quota: res.quota,
        })
    }
}

fn transport_error(nsid: &str, e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Transient(format!("{nsid}: operation timed out"))
    } else if e.is_decode() {
        ApiError::Decode(format!("{nsid}: {e}"))
    } else {
        ApiError::Transient(format!("{nsid}: {e}"))
    }
}

pub(crate) fn quota_from_headers(headers: &HeaderMap) -> QuotaHeaders {
    fn num<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<T>().ok())
    }
    QuotaHeaders {
        remaining: num(headers, "ratelimit-remaining"),
        limit: num(headers, "ratelimit-limit"),
        reset_epoch_secs: num(headers, "ratelimit-reset"),
    }
}

/// `Retry-After` as seconds or an HTTP date, else the window reset.
pub(crate) fn retry_after_from_headers(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    if let Some(raw) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) {
        let raw = raw.trim();
        if let Ok(secs) = raw.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        if let Ok(at) = httpdate::parse_http_date(raw) {
            return Some(at.duration_since(now).unwrap_or_default());
        }
    }
    let reset = quota_from_headers(headers).reset_epoch_secs?;
    let now_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    Some(Duration::from_secs(reset.saturating_sub(now_secs)))
}

fn xrpc_error_message(body: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v.get("message")
        .and_then(|m| m.as_str())
        .or_else(|| v.get("error").and_then(|m| m.as_str()))
        .map(|s| s.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireProfile {
    did: String,
    handle: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    followers_count: Option<u64>,
    #[serde(default)]
    follows_count: Option<u64>,
    #[serde(default)]
    posts_count: Option<u64>,
}

impl From<WireProfile> for Profile {
    fn from(p: WireProfile) -> Self {
        Profile {
            id: p.did,
            handle: p.handle,
            display_name: p.display_name.filter(|s| !s.trim().is_empty()),
            followers_count: p.followers_count,
            follows_count: p.follows_count,
            posts_count: p.posts_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireProfiles {
    #[serde(default)]
    profiles: Vec<WireProfile>,
}

#[derive(Debug, Deserialize)]
struct WireGraphPage {
    #[serde(default)]
    follows: Vec<WireProfile>,
    #[serde(default)]
    followers: Vec<WireProfile>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireFeed {
    #[serde(default)]
    feed: Vec<WireFeedItem>,
}

#[derive(Debug, Deserialize)]
struct WireFeedItem {
    post: WirePost,
    #[serde(default)]
    reason: Option<WireReason>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePost {
    uri: String,
    #[serde(default)]
    record: serde_json::Value,
    #[serde(default)]
    indexed_at: Option<String>,
    #[serde(default)]
    labels: Vec<WireLabel>,
}

#[derive(Debug, Deserialize)]
struct WireLabel {
    val: String,
}

#[derive(Debug, Deserialize)]
struct WireReason {
    #[serde(rename = "$type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct WireRelationships {
    #[serde(default)]
    relationships: Vec<WireRelationship>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRelationship {
    #[serde(default)]
    did: Option<String>,
    #[serde(default)]
    followed_by: Option<String>,
    #[serde(default)]
    not_found: bool,
}

impl WireRelationships {
    fn into_relationships(self) -> Vec<Relationship> {
        self.relationships
            .into_iter()
            .filter(|r| !r.not_found)
            .filter_map(|r| {
                Some(Relationship {
                    other: r.did?,
                    follows_viewer: r.followed_by.is_some(),
                })
            })
            .collect()
    }
}

impl From<WireFeedItem> for FeedPost {
    fn from(item: WireFeedItem) -> Self {
        let pinned = item.post.labels.iter().any(|l| l.val == "pinned")
            || item
                .reason
                .as_ref()
                .map(|r| r.kind.ends_with("#reasonPin"))
                .unwrap_or(false);
        let created_at = item
            .post
            .record
            .get("createdAt")
            .and_then(|v| v.as_str())
            .and_then(parse_rfc3339);
        FeedPost {
            uri: item.post.uri,
            created_at,
            indexed_at: item.post.indexed_at.as_deref().and_then(parse_rfc3339),
            pinned,
        }
    }
}
