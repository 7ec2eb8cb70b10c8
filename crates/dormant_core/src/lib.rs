/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod account_cache;
pub mod activity;
pub mod api_metrics;
pub mod backoff;
pub mod config;
pub mod error;
pub mod followers;
pub mod model;
pub mod pager;
pub mod partner;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod scheduler;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;
