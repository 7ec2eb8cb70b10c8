/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::backoff::Backoff;
use crate::pager::PagerSettings;
use crate::partner::DEFAULT_API_BASE;
use crate::pipeline::PipelineSettings;
use crate::reconcile::ReconcileSettings;
use crate::scheduler::SchedulerSettings;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    pub db_path: Option<PathBuf>,
    pub api_base: String,
    pub http_timeout_secs: u64,

    pub max_concurrent: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_threshold: f64,
    pub max_quota: u32,
    pub default_reset_secs: u64,
    pub max_retries: u32,
    pub max_quota_retries: u32,

    pub page_limit: u32,
    pub profile_batch_size: usize,
    pub inter_chunk_delay_ms: u64,
    pub feed_limit: u32,

    pub freshness_days: u32,
    pub pinned_sample_window: usize,
    pub max_follows: u64,
    pub max_followers: u64,
    pub default_days: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8790".to_string(),
            db_path: None,
            api_base: DEFAULT_API_BASE.to_string(),
            http_timeout_secs: 20,
            max_concurrent: 5,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
            backoff_threshold: 0.2,
            max_quota: 3000,
            default_reset_secs: 60,
            max_retries: 5,
            max_quota_retries: 3,
            page_limit: 100,
            profile_batch_size: 25,
            inter_chunk_delay_ms: 200,
            feed_limit: 10,
            freshness_days: 7,
            pinned_sample_window: 2,
            max_follows: 10_000,
            max_followers: 50_000,
            default_days: 30,
        }
    }
}

impl ServiceConfig {
    /// Config file (if any), then `DORMANT_*` overrides.
    pub fn load(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut cfg = match parse_config_path(args)? {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok());
        cfg.normalize();
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse config json: {}", path.display()))
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn num<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            var(key).and_then(|v| v.trim().parse::<T>().ok())
        }
        if let Some(v) = var("DORMANT_BIND").filter(|v| !v.trim().is_empty()) {
            self.bind = v.trim().to_string();
        }
        if let Some(v) = var("DORMANT_DB").filter(|v| !v.trim().is_empty()) {
            self.db_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = var("DORMANT_API_BASE").filter(|v| !v.trim().is_empty()) {
            self.api_base = v.trim().trim_end_matches('/').to_string();
        }
        if let Some(v) = num(&var, "DORMANT_MAX_CONCURRENT") {
            self.max_concurrent = v;
        }
        if let Some(v) = num(&var, "DORMANT_FRESHNESS_DAYS") {
            self.freshness_days = v;
        }
        if let Some(v) = num(&var, "DORMANT_MAX_FOLLOWS") {
            self.max_follows = v;
        }
        if let Some(v) = num(&var, "DORMANT_MAX_FOLLOWERS") {
            self.max_followers = v;
        }
    }

    pub fn normalize(&mut self) {
        self.http_timeout_secs = self.http_timeout_secs.clamp(2, 120);
        self.max_concurrent = self.max_concurrent.clamp(1, 32);
        self.max_delay_ms = self.max_delay_ms.clamp(self.base_delay_ms.max(1), 600_000);
        self.backoff_threshold = if self.backoff_threshold.is_finite() {
            self.backoff_threshold.clamp(0.01, 0.99)
        } else {
            0.2
        };
        self.max_quota = self.max_quota.max(1);
        self.default_reset_secs = self.default_reset_secs.clamp(1, 3600);
        self.max_retries = self.max_retries.min(10);
        self.max_quota_retries = self.max_quota_retries.min(10);
        self.page_limit = self.page_limit.clamp(1, 100);
        self.profile_batch_size = self.profile_batch_size.clamp(1, 25);
        self.feed_limit = self.feed_limit.clamp(1, 100);
        self.freshness_days = self.freshness_days.clamp(1, 365);
        self.pinned_sample_window = self.pinned_sample_window.clamp(1, 10);
        self.max_follows = self.max_follows.max(1);
        self.max_followers = self.max_followers.max(1);
        self.default_days = self.default_days.clamp(1, 3650);
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid bind address: {}", self.bind))
    }

    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(p) => Ok(p.clone()),
            None => Ok(default_data_dir()?.join("dormant.db")),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent: self.max_concurrent,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_threshold: self.backoff_threshold,
            max_quota: self.max_quota,
            default_reset: Duration::from_secs(self.default_reset_secs),
            max_retries: self.max_retries,
            max_quota_retries: self.max_quota_retries,
            retry: Backoff::default(),
        }
    }

    pub fn pager_settings(&self) -> PagerSettings {
        PagerSettings {
            page_limit: self.page_limit,
            profile_batch_size: self.profile_batch_size,
            inter_chunk_delay: Duration::from_millis(self.inter_chunk_delay_ms),
            feed_limit: self.feed_limit,
        }
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            freshness_window: time::Duration::days(self.freshness_days.into()),
            pinned_sample_window: self.pinned_sample_window,
            max_concurrent: self.max_concurrent,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_follows: self.max_follows,
        }
    }
}

fn parse_config_path(args: impl IntoIterator<Item = String>) -> Result<Option<PathBuf>> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("DORMANT_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(Some(PathBuf::from(path)));
        }
    }
    Ok(None)
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("DORMANT_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("org", "dormant", "Dormant")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}
