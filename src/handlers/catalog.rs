//! Read-only views of the catalog.

use crate::error::{AppError, Result};
use crate::routing::Capabilities;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CapabilitiesQuery {
    pub category: Option<String>,
}

/// GET /capabilities?category=image - Tool summaries grouped by process.
pub async fn capabilities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CapabilitiesQuery>,
) -> Json<Capabilities> {
    let category = query.category.as_deref().filter(|c| !c.is_empty());
    Json(state.orchestrator.list_capabilities(category))
}

#[derive(Debug, Deserialize)]
pub struct ExplainRequest {
    pub process_name: String,
    pub tool_name: String,
}

#[derive(Debug, Serialize)]
pub struct ExplainResponse {
    pub process_name: String,
    pub tool_name: String,
    /// Markdown
    pub documentation: String,
}

/// POST /explain - Help text for one tool.
pub async fn explain_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExplainRequest>,
) -> Result<Json<ExplainResponse>> {
    if request.process_name.is_empty() || request.tool_name.is_empty() {
        return Err(AppError::ValidationError(
            "process_name and tool_name are required".to_string(),
        ));
    }

    let documentation = state
        .orchestrator
        .explain(&request.process_name, &request.tool_name)?;

    Ok(Json(ExplainResponse {
        process_name: request.process_name,
        tool_name: request.tool_name,
        documentation,
    }))
}
