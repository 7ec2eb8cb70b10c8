/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use dormant_core::account_cache::AccountCache;
use dormant_core::config::ServiceConfig;
use dormant_core::followers::FollowerTracker;
use dormant_core::pager::Pager;
use dormant_core::partner::XrpcClient;
use dormant_core::pipeline::Pipeline;
use dormant_core::scheduler::RequestScheduler;
use dormant_core::server::{self, AppState};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().context("log directive")?),
        )
        .init();

    let cfg = ServiceConfig::load(std::env::args().skip(1))?;
    let db_path = cfg.resolve_db_path()?;
    info!("dormant service starting");
    info!("cache db: {}", db_path.display());
    info!("partner api: {}", cfg.api_base);

    let cache = AccountCache::open(&db_path)?;
    let client = XrpcClient::new(&cfg.api_base, cfg.http_timeout())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = RequestScheduler::start(cfg.scheduler_settings(), shutdown_rx.clone());
    let pager = Pager::new(Arc::new(client), scheduler, cfg.pager_settings());
    let followers = FollowerTracker::new(cache.clone(), pager.clone(), cfg.max_followers);
    let pipeline = Pipeline::new(cache, pager, cfg.reconcile_settings(), cfg.pipeline_settings());
    let state = AppState {
        pipeline,
        followers,
        default_days: cfg.default_days,
    };

    let addr = cfg.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let server = tokio::spawn(server::serve(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("http server failed: {e:#}"),
        Err(e) => error!("http server task failed: {e}"),
    }
    info!("dormant service stopped");
    Ok(())
}
