/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::ApiError;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub struct ApiMetrics {
    pub requests: AtomicU64,
    pub successes: AtomicU64,
    pub retries: AtomicU64,
    pub rate_limit_hits: AtomicU64,
    pub http_timeouts: AtomicU64,
    pub http_errors: AtomicU64,
    pub cancelled: AtomicU64,
    pub latency_ema_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ApiMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success(&self, latency_ms: u64) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.latency_update(latency_ms);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure(&self, err: &ApiError) {
        match err {
            ApiError::QuotaExceeded { .. } => self.rate_limit_hit(),
            ApiError::Cancelled => self.cancelled(),
            ApiError::Transient(msg) if msg.contains("timed out") => {
                self.http_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.http_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        if !matches!(err, ApiError::Cancelled) {
            let mut g = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
            *g = Some(err.to_string());
        }
    }

    fn latency_update(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        let prev = self.latency_ema_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            ms
        } else {
            (prev.saturating_mul(7).saturating_add(ms)) / 8
        };
        self.latency_ema_ms.store(next, Ordering::Relaxed);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        serde_json::json!({
            "ts_ms": now_ms(),
            "requests": self.requests.load(Ordering::Relaxed),
            "successes": self.successes.load(Ordering::Relaxed),
            "retries": self.retries.load(Ordering::Relaxed),
            "latency_ms": self.latency_ema_ms.load(Ordering::Relaxed),
            "errors": {
                "rate_limit_hits": self.rate_limit_hits.load(Ordering::Relaxed),
                "http_timeouts": self.http_timeouts.load(Ordering::Relaxed),
                "http_errors": self.http_errors.load(Ordering::Relaxed),
                "cancelled": self.cancelled.load(Ordering::Relaxed),
                "last_error": last_error,
            },
        })
    }
}
