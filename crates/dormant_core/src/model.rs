/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use dormant_protocol::{DataSource, InactiveFollow};
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowedAccount {
    pub id: String,
    pub handle: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub id: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub followers_count: Option<u64>,
    pub follows_count: Option<u64>,
    pub posts_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedPost {
    pub uri: String,
    pub created_at: Option<OffsetDateTime>,
    pub indexed_at: Option<OffsetDateTime>,
    pub pinned: bool,
}

impl FeedPost {
    pub fn posted_at(&self) -> Option<OffsetDateTime> {
        self.created_at.or(self.indexed_at)
    }
}

/// How `other` relates to the viewer a relationship lookup was made for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub other: String,
    pub follows_viewer: bool,
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySnapshot {
    pub account_id: String,
    pub handle: String,
    pub display_name: Option<String>,
    /// Unix epoch when the account never posted.
    pub last_post_at: OffsetDateTime,
    pub last_checked_at: OffsetDateTime,
    pub post_count: Option<u64>,
    pub follower_count: Option<u64>,
    pub follows_back: bool,
}

impl ActivitySnapshot {
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.last_checked_at
    }

    /// Fresh iff strictly younger than the window.
    pub fn is_fresh(&self, now: OffsetDateTime, window: Duration) -> bool {
        self.age(now) < window
    }

    pub fn is_inactive(&self, now: OffsetDateTime, days: u32) -> bool {
        now - self.last_post_at >= Duration::days(days.into())
    }

    pub fn to_inactive_follow(&self, source: DataSource) -> InactiveFollow {
        InactiveFollow {
            did: self.account_id.clone(),
            handle: self.handle.clone(),
            display_name: self.display_name.clone(),
            last_post: format_rfc3339(self.last_post_at),
            last_checked: format_rfc3339(self.last_checked_at),
            post_count: self.post_count,
            followers_count: self.follower_count,
            follows_back: self.follows_back,
            source,
        }
    }
}

pub fn epoch() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}

pub fn to_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn format_rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn parse_rfc3339(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s.trim(), &Rfc3339).ok()
}
