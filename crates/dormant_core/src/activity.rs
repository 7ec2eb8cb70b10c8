/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::model::{epoch, FeedPost};
use time::OffsetDateTime;

pub const DEFAULT_PINNED_SAMPLE_WINDOW: usize = 2;

/// Time of the most recent post in a feed (newest first).
///
/// A pinned post sits on top regardless of its age, so it is skipped when a
/// regular post shows up within the first `sample_window` entries. Without
/// such a post the pinned date is all we have. No dated post yields epoch.
pub fn latest_activity(posts: &[FeedPost], sample_window: usize) -> OffsetDateTime {
    let window = &posts[..posts.len().min(sample_window.max(1))];
    let regular = window
        .iter()
        .filter(|p| !p.pinned)
        .filter_map(FeedPost::posted_at)
        .max();
    if let Some(at) = regular {
        return at;
    }
    posts
        .iter()
        .filter_map(FeedPost::posted_at)
        .max()
        .unwrap_or_else(epoch)
}
