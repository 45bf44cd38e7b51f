//! The four operations offered to callers, composed from the router and
//! the connection pool.

use crate::catalog::{Catalog, CatalogEntry};
use crate::error::{AppError, Result};
use crate::process::{ConnectionPool, ShutdownReport};
use crate::routing::{Capabilities, Match, Router};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Minimum confidence for auto-executing the top match.
    pub execute_threshold: f32,
    /// Deadline for a single backend call, if any.
    pub call_timeout: Option<Duration>,
    /// Check required parameters before anything is sent to a backend.
    pub validate_arguments: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            execute_threshold: 0.6,
            call_timeout: None,
            validate_arguments: false,
        }
    }
}

/// Result of [`Orchestrator::execute_by_description`]: the backend's value
/// plus which tool was picked to produce it.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub process_name: String,
    pub tool_name: String,
    pub confidence: f32,
    pub result: Value,
}

pub struct Orchestrator {
    catalog: Arc<Catalog>,
    router: Arc<Router>,
    pool: Arc<ConnectionPool>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<Catalog>,
        router: Arc<Router>,
        pool: Arc<ConnectionPool>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            catalog,
            router,
            pool,
            settings,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn discover(&self, query: &str, threshold: f32, top_k: usize) -> Result<Vec<Match>> {
        self.router.query(query, threshold, top_k).await
    }

    /// Route `request` to the single best tool and run it with `params`.
    ///
    /// Uses the stricter execute threshold since nobody confirms the pick.
    pub async fn execute_by_description(&self, request: &str, params: &Value) -> Result<Execution> {
        self.execute_with_timeout(request, params, self.settings.call_timeout)
            .await
    }

    /// [`Orchestrator::execute_by_description`] with an explicit call
    /// deadline in place of the configured one.
    pub async fn execute_with_timeout(
        &self,
        request: &str,
        params: &Value,
        call_timeout: Option<Duration>,
    ) -> Result<Execution> {
        let threshold = self.settings.execute_threshold;
        let best = self
            .router
            .query(request, threshold, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(AppError::NoMatchError { threshold })?;

        if self.settings.validate_arguments {
            let entry = self.lookup(&best.process_name, &best.tool_name)?;
            entry.check_arguments(params)?;
        }

        tracing::info!(
            process = %best.process_name,
            tool = %best.tool_name,
            confidence = best.confidence,
            "Executing routed tool"
        );

        let start = Instant::now();
        let outcome = self
            .pool
            .execute_with_timeout(&best.process_name, &best.tool_name, params, call_timeout)
            .await;

        metrics::histogram!("execute_latency_ms").record(start.elapsed().as_millis() as f64);

        match outcome {
            Ok(result) => Ok(Execution {
                process_name: best.process_name,
                tool_name: best.tool_name,
                confidence: best.confidence,
                result,
            }),
            Err(err) => {
                metrics::counter!("tool_errors_total", "kind" => err.kind()).increment(1);
                if err.is_abnormal() {
                    tracing::error!(
                        process = %best.process_name,
                        tool = %best.tool_name,
                        error = %err,
                        "Backend failure"
                    );
                }
                Err(err)
            }
        }
    }

    pub fn list_capabilities(&self, category: Option<&str>) -> Capabilities {
        self.router.list_capabilities(category)
    }

    /// Human-readable Markdown help for one tool.
    pub fn explain(&self, process_name: &str, tool_name: &str) -> Result<String> {
        let entry = self.lookup(process_name, tool_name)?;
        Ok(render_doc(entry))
    }

    /// Terminate every backend process.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.pool.shutdown_all().await
    }

    fn lookup(&self, process_name: &str, tool_name: &str) -> Result<&CatalogEntry> {
        self.catalog
            .entry(process_name, tool_name)
            .ok_or_else(|| AppError::UnknownToolError {
                process: process_name.to_string(),
                tool: tool_name.to_string(),
            })
    }
}

fn render_doc(entry: &CatalogEntry) -> String {
    let mut doc = String::new();
    let description = if entry.description.is_empty() {
        "No description"
    } else {
        entry.description.as_str()
    };

    // Writing into a String cannot fail
    let _ = writeln!(doc, "**{}** (from {})\n", entry.tool_name, entry.process_name);
    let _ = writeln!(doc, "Description: {}", description);

    let params = parameter_lines(&entry.parameter_schema);
    if !params.is_empty() {
        let _ = writeln!(doc, "\nParameters:");
        for line in params {
            let _ = writeln!(doc, "  • {}", line);
        }
    }

    if !entry.examples.is_empty() {
        let _ = writeln!(doc, "\nExamples:");
        for example in &entry.examples {
            let _ = writeln!(doc, "  • {}", example);
        }
    }

    doc
}

/// One line per declared parameter. Accepts a JSON schema (`properties`
/// plus `required`) or a plain `name -> info` map.
fn parameter_lines(schema: &Value) -> Vec<String> {
    let Some(obj) = schema.as_object() else {
        return Vec::new();
    };

    if let Some(properties) = obj.get("properties").and_then(|p| p.as_object()) {
        let required: Vec<&str> = obj
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|f| f.as_str()).collect())
            .unwrap_or_default();

        return properties
            .iter()
            .map(|(name, info)| {
                let mut line = name.clone();
                if let Some(ty) = info.get("type").and_then(|t| t.as_str()) {
                    let _ = write!(line, " ({ty})");
                }
                if required.contains(&name.as_str()) {
                    line.push_str(" [required]");
                }
                let _ = write!(line, ": {}", info_description(info));
                line
            })
            .collect();
    }

    obj.iter()
        .map(|(name, info)| format!("{}: {}", name, info_description(info)))
        .collect()
}

fn info_description(info: &Value) -> &str {
    match info {
        Value::String(s) => s.as_str(),
        other => other
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or(""),
    }
}
