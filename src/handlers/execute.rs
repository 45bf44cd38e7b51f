use crate::error::{AppError, Result};
use crate::facade::Execution;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    /// What to do, in plain language. The best matching tool runs it.
    pub request: String,
    /// Arguments passed verbatim to the chosen tool
    #[serde(default = "empty_params")]
    pub params: Value,
    /// Overrides the configured call deadline for this request only
    pub timeout_ms: Option<u64>,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub trace_id: Uuid,
    #[serde(flatten)]
    pub execution: Execution,
}

/// POST /execute - Route a request to its best tool and run it.
pub async fn execute_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>> {
    let start_time = std::time::Instant::now();
    let trace_id = Uuid::new_v4();

    if request.request.trim().is_empty() {
        return Err(AppError::ValidationError(
            "Request cannot be empty".to_string(),
        ));
    }
    if matches!(request.timeout_ms, Some(0)) {
        return Err(AppError::ValidationError(
            "timeout_ms must be at least 1".to_string(),
        ));
    }

    let orchestrator = &state.orchestrator;
    let call_timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .or(orchestrator.settings().call_timeout);

    metrics::counter!("execute_requests_total").increment(1);

    let execution = orchestrator
        .execute_with_timeout(&request.request, &request.params, call_timeout)
        .await
        .map_err(|e| {
            tracing::debug!(%trace_id, error = %e, "Execute failed");
            e
        })?;

    tracing::info!(
        %trace_id,
        process = %execution.process_name,
        tool = %execution.tool_name,
        confidence = execution.confidence,
        total_ms = start_time.elapsed().as_millis() as u64,
        "Execute completed"
    );

    Ok(Json(ExecuteResponse {
        trace_id,
        execution,
    }))
}
