use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, info};

use crate::counter::SlidingCounter;
use crate::error::CounterError;

#[derive(Clone)]
pub struct AppState {
    counter: Arc<SlidingCounter>,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(counter: Arc<SlidingCounter>, request_timeout: Duration) -> Self {
        Self {
            counter,
            request_timeout,
        }
    }
}

/// `GET /` records one request and replies with the window count.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(count_request))
        .with_state(state)
}

/// Whole seconds print as integers, anything finer as a decimal (`0.5`).
fn window_label(window: Duration) -> String {
    if window.subsec_nanos() == 0 {
        window.as_secs().to_string()
    } else {
        window.as_secs_f64().to_string()
    }
}

async fn count_request(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let window = window_label(state.counter.config().window);

    match state
        .counter
        .record_request_within(state.request_timeout)
        .await
    {
        Ok(count) => {
            info!(
                count,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Request served"
            );
            (
                StatusCode::OK,
                format!("Requests in the last {window} seconds: {count}\n"),
            )
                .into_response()
        }
        Err(e @ (CounterError::Timeout | CounterError::Cancelled)) => {
            debug!(error = %e, elapsed_us = started.elapsed().as_micros() as u64, "Request timed out");
            (StatusCode::REQUEST_TIMEOUT, "Request timed out\n").into_response()
        }
        Err(CounterError::Closed) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Service is shutting down\n").into_response()
        }
    }
}
