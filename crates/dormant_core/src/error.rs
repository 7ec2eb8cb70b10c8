/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

/// Failure of a single partner API call, as seen by the scheduler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("rate limit exceeded{}", fmt_retry_after(.retry_after))]
    QuotaExceeded { retry_after: Option<Duration> },
    #[error("network error: {0}")]
    Transient(String),
    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("request cancelled")]
    Cancelled,
}

impl ApiError {
    /// Retried by the scheduler's backoff loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }

    /// Errors that only concern the actor being looked up.
    pub fn is_per_account(&self) -> bool {
        matches!(self, ApiError::Client { .. } | ApiError::Decode(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ApiError::Client { status, message } => {
                *status == 404 || message.to_ascii_lowercase().contains("not found")
            }
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::QuotaExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}s", d.as_secs().max(1)),
        None => String::new(),
    }
}

/// Failure of a whole inactive-follows run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("cache store: {0:#}")]
    Persistence(anyhow::Error),
    #[error(
        "this account follows {count} accounts, which exceeds the limit of {limit}"
    )]
    TooManyFollows { count: u64, limit: u64 },
    #[error("this account has {count} followers, which exceeds the limit of {limit}")]
    TooManyFollowers { count: u64, limit: u64 },
    #[error("run cancelled")]
    Cancelled,
}

impl RunError {
    pub fn from_api(e: ApiError) -> Self {
        match e {
            ApiError::Cancelled => RunError::Cancelled,
            e => RunError::Api(e),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RunError::Api(e) => e.retry_after(),
            _ => None,
        }
    }
}
