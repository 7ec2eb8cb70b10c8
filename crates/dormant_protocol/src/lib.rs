/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Pipeline stage. Ordering follows the run: a run only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Cache,
    Follows,
    Profiles,
    Feeds,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Cache,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub processed: u64,
    pub total: u64,
    pub current: String,
    pub cache_hits: u64,
    pub cache_misses: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_progress: Option<BatchProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<DataSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_processed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Percentage, two decimals.
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn from_counts(cache_hits: u64, cache_misses: u64) -> Self {
        let total_processed = cache_hits + cache_misses;
        let hit_rate = if total_processed == 0 {
            0.0
        } else {
            let pct = cache_hits as f64 / total_processed as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        };
        Self {
            total_processed,
            cache_hits,
            cache_misses,
            hit_rate,
        }
    }
}

/// One followed account that has not posted within the requested window.
/// Timestamps are RFC 3339; "never posted" is the unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InactiveFollow {
    pub did: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub last_post: String,
    pub last_checked: String,
    #[serde(default)]
    pub post_count: Option<u64>,
    #[serde(default)]
    pub followers_count: Option<u64>,
    pub follows_back: bool,
    pub source: DataSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InactiveFollowsResponse {
    pub inactive_follows: Vec<InactiveFollow>,
    pub cache_stats: CacheStats,
    pub total_follows: u64,
    /// Non-fatal problems, e.g. results that could not be cached.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// SSE payloads, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamFrame {
    Progress(ProgressEvent),
    Complete {
        inactive_follows: Vec<InactiveFollow>,
        cache_stats: CacheStats,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamFrame::Progress(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub remaining_requests: u32,
    pub max_requests: u32,
    pub queue_length: u64,
    pub in_flight: u64,
    pub is_limited: bool,
    pub is_healthy: bool,
    #[serde(default)]
    pub resets_in_ms: Option<u64>,
}

/// A former follower, as recorded by follower checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unfollower {
    pub did: String,
    /// Known when the account is also in the activity cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    pub first_seen: String,
    pub unfollowed_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerCheckResponse {
    pub did: String,
    pub followers_checked: u64,
    pub new_followers: u64,
    pub unfollowed: Vec<Unfollower>,
    pub checked_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfollowersResponse {
    pub did: String,
    pub unfollowers: Vec<Unfollower>,
    #[serde(default)]
    pub last_checked: Option<String>,
}
