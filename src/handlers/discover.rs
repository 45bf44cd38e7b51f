use crate::error::{AppError, Result};
use crate::routing::Match;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct DiscoverRequest {
    /// Natural language description of the task
    pub query: String,
    /// Minimum confidence. Defaults to the configured discovery threshold.
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DiscoverResponse {
    pub matches: Vec<Match>,
}

/// POST /discover - Ranked tools for a free-text query.
///
/// An empty result is a normal answer, not an error.
pub async fn discover_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DiscoverRequest>,
) -> Result<Json<DiscoverResponse>> {
    let start_time = std::time::Instant::now();

    if request.query.trim().is_empty() {
        return Err(AppError::ValidationError(
            "Query cannot be empty".to_string(),
        ));
    }

    let threshold = request.threshold.unwrap_or(state.config.discover_threshold);
    if !threshold.is_finite() {
        return Err(AppError::ValidationError(
            "threshold must be a finite number".to_string(),
        ));
    }
    let top_k = request.top_k.unwrap_or(state.config.default_top_k);

    let matches = state
        .orchestrator
        .discover(&request.query, threshold, top_k)
        .await?;

    let elapsed = start_time.elapsed();
    tracing::info!(
        query = %request.query,
        threshold,
        top_k,
        matches = matches.len(),
        total_ms = elapsed.as_millis() as u64,
        "Discover completed"
    );

    metrics::counter!("discover_requests_total").increment(1);
    metrics::histogram!("discover_latency_ms").record(elapsed.as_millis() as f64);

    Ok(Json(DiscoverResponse { matches }))
}
