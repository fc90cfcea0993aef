//! HTTP trigger for the cron engine.
//!
//! A single endpoint, `GET /cron/run?t=<unix>`, meant to be embedded as an
//! invisible image in forum pages. The response is always a 200 with a 1x1
//! transparent GIF: a broken image icon on the page, or an error readable by
//! whoever requests the pixel directly, would leak engine state. The
//! timestamp check is anti-abuse only; a stale link silently does nothing.

use crate::runner::TaskRunner;
use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// 1x1 transparent GIF.
const PIXEL: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xFF, 0xFF, 0xFF, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
];

#[derive(Clone)]
pub struct ServerState {
    runner: Arc<TaskRunner>,
    trigger_window: i64,
    budget: Duration,
}

#[derive(Deserialize)]
struct TriggerParams {
    t: Option<i64>,
}

/// True when the supplied timestamp is within the accepted window of `now`.
fn timestamp_in_window(t: Option<i64>, now: i64, window: i64) -> bool {
    match t {
        Some(t) => (now - t).abs() <= window,
        None => false,
    }
}

async fn trigger_run(
    State(state): State<ServerState>,
    Query(params): Query<TriggerParams>,
) -> impl IntoResponse {
    let now = Utc::now().timestamp();

    if timestamp_in_window(params.t, now, state.trigger_window) {
        let runner = state.runner.clone();
        let budget = state.budget;
        let result = tokio::task::spawn_blocking(move || runner.run_with_budget(budget)).await;
        match result {
            Ok(Ok(summary)) => debug!("Pixel-triggered run: {:?}", summary),
            Ok(Err(e)) => error!("Pixel-triggered run failed: {:#}", e),
            Err(e) => error!("Pixel-triggered run panicked: {}", e),
        }
    } else {
        debug!("Rejected trigger with timestamp {:?}", params.t);
    }

    // Same pixel on every path
    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        PIXEL,
    )
}

pub fn make_app(runner: Arc<TaskRunner>, trigger_window: i64, budget: Duration) -> Router {
    let state = ServerState {
        runner,
        trigger_window,
        budget,
    };
    Router::new()
        .route("/cron/run", get(trigger_run))
        .with_state(state)
}

pub async fn run_server(
    runner: Arc<TaskRunner>,
    port: u16,
    trigger_window: i64,
    budget: Duration,
) -> Result<()> {
    let app = make_app(runner, trigger_window, budget);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Cron trigger listening on port {}", port);

    Ok(axum::serve(listener, app).await?)
}
