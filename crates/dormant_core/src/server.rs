/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::{ApiError, RunError};
use crate::followers::FollowerTracker;
use crate::pipeline::{InactiveQuery, Pipeline, SortOrder};
use crate::progress::ProgressEmitter;
use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dormant_protocol::ErrorBody;
use futures_util::stream::unfold;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const MAX_DAYS: u32 = 3650;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub followers: FollowerTracker,
    pub default_days: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct InactiveParams {
    pub handle: Option<String>,
    pub days: Option<u32>,
    pub stream: Option<String>,
    pub sort: Option<SortOrder>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FollowerParams {
    #[serde(alias = "did")]
    pub handle: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/user/inactive", get(inactive_get))
        .route("/api/followers/check", post(followers_check_post))
        .route("/api/followers/unfollowers", get(unfollowers_get))
        .route("/api/status", get(status_get))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = listener.local_addr().context("local addr")?;
    info!("dormant listening on http://{addr}");
    let shutdown = async move {
        let _ = shutdown.changed().await;
    };
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server")
}

/// Cancels the run when a non-streaming request is dropped mid-flight.
struct CancelOnDrop(Arc<ProgressEmitter>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn actor_param(handle: Option<&str>) -> Option<String> {
    handle
        .map(|h| h.trim().trim_start_matches('@').to_string())
        .filter(|h| !h.is_empty())
}

async fn inactive_get(State(state): State<AppState>, Query(params): Query<InactiveParams>) -> Response {
    let Some(actor) = actor_param(params.handle.as_deref()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing handle".to_string(), None);
    };
    let days = params.days.unwrap_or(state.default_days);
    if days == 0 || days > MAX_DAYS {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("days must be between 1 and {MAX_DAYS}"),
            None,
        );
    }
    let query = InactiveQuery {
        actor,
        days,
        sort: params.sort.unwrap_or_default(),
    };
    let stream = params
        .stream
        .as_deref()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if stream {
        return stream_run(state, query);
    }

    let progress = ProgressEmitter::detached();
    let guard = CancelOnDrop(progress.clone());
    let res = state.pipeline.run(&query, &progress).await;
    drop(guard);
    match res {
        Ok(report) => Json(report.into_response()).into_response(),
        Err(e) => run_error_response(&e),
    }
}

fn stream_run(state: AppState, query: InactiveQuery) -> Response {
    let (progress, rx) = ProgressEmitter::channel();
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let _ = pipeline.run(&query, &progress).await;
    });

    let stream = unfold((rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        let frame = rx.recv().await?;
        let done = frame.is_terminal();
        let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        Some((Ok::<Event, Infallible>(Event::default().data(data)), (rx, done)))
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
        .into_response()
}

async fn followers_check_post(State(state): State<AppState>, Json(body): Json<FollowerParams>) -> Response {
    let Some(actor) = actor_param(body.handle.as_deref()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing handle".to_string(), None);
    };
    let progress = ProgressEmitter::detached();
    let guard = CancelOnDrop(progress.clone());
    let res = state.followers.check(&actor, &progress).await;
    drop(guard);
    match res {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            warn!("follower check for {actor} failed: {e}");
            run_error_response(&e)
        }
    }
}

async fn unfollowers_get(State(state): State<AppState>, Query(params): Query<FollowerParams>) -> Response {
    let Some(actor) = actor_param(params.handle.as_deref()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing handle".to_string(), None);
    };
    let progress = ProgressEmitter::detached();
    let guard = CancelOnDrop(progress.clone());
    let res = state.followers.unfollowers(&actor, &progress.cancel_signal()).await;
    drop(guard);
    match res {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => run_error_response(&e),
    }
}

async fn status_get(State(state): State<AppState>) -> Response {
    let scheduler = state.pipeline.scheduler();
    let cache = state.pipeline.cache().clone();
    let last_run = tokio::task::spawn_blocking(move || cache.latest_stat("query_performance"))
        .await
        .ok()
        .and_then(|r| r.ok())
        .flatten()
        .map(|row| {
            serde_json::json!({
                "at_ms": row.created_at_ms,
                "stats": row.value,
            })
        });
    Json(serde_json::json!({
        "rate_limit": scheduler.status(),
        "api": scheduler.metrics().snapshot_json(),
        "last_run": last_run,
    }))
    .into_response()
}

async fn healthz(State(state): State<AppState>) -> Response {
    let cache = state.pipeline.cache().clone();
    match tokio::task::spawn_blocking(move || cache.health_check()).await {
        Ok(Ok(())) => (StatusCode::OK, "ok").into_response(),
        Ok(Err(e)) => (StatusCode::SERVICE_UNAVAILABLE, format!("cache unavailable: {e:#}")).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("health check failed: {e}")).into_response(),
    }
}

fn run_error_response(err: &RunError) -> Response {
    let status = match err {
        RunError::Api(e @ ApiError::Client { .. }) => {
            if e.is_not_found() {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::BAD_REQUEST
            }
        }
        RunError::Api(ApiError::QuotaExceeded { .. }) => StatusCode::TOO_MANY_REQUESTS,
        RunError::Api(ApiError::Transient(_)) | RunError::Api(ApiError::Decode(_)) => StatusCode::BAD_GATEWAY,
        RunError::Api(ApiError::Cancelled) | RunError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        RunError::TooManyFollows { .. } | RunError::TooManyFollowers { .. } => StatusCode::BAD_REQUEST,
        RunError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let retry_after = err.retry_after().map(|d| d.as_secs().max(1));
    error_response(status, err.to_string(), retry_after)
}

fn error_response(status: StatusCode, error: String, retry_after_secs: Option<u64>) -> Response {
    let mut resp = (
        status,
        Json(ErrorBody {
            error,
            retry_after_secs,
        }),
    )
        .into_response();
    if let Some(secs) = retry_after_secs {
        if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
            resp.headers_mut().insert(header::RETRY_AFTER, v);
        }
    }
    resp
}
