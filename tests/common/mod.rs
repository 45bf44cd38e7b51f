//! Shared fixtures: small `/bin/sh` backends and catalog builders.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use toolrelay::inference::{Embedder, HashEmbedder};
use toolrelay::{Catalog, ConnectionPool, Orchestrator, OrchestratorSettings, Router};

/// Answers every request with `{"id":<same id>,"result":"ok"}`.
pub const ECHO_OK: &str = r#"while IFS= read -r line; do id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p'); printf '{"id":%s,"result":"ok"}\n' "$id"; done"#;

/// Echoes the tool arguments back as the result.
pub const ECHO_ARGS: &str = r#"while IFS= read -r line; do id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p'); args=$(printf '%s' "$line" | sed -n 's/.*"arguments":\(.*\)},"id".*/\1/p'); printf '{"id":%s,"result":%s}\n' "$id" "$args"; done"#;

/// Always answers with id 7, whatever was asked.
pub const FIXED_ID_7: &str = r#"while IFS= read -r line; do printf '{"id":7,"result":"ok"}\n'; done"#;

/// Reports a tool-level failure for every request.
pub const TOOL_FAILS: &str = r#"while IFS= read -r line; do id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p'); printf '{"id":%s,"error":{"code":-32000,"message":"disk full"}}\n' "$id"; done"#;

/// Reads a request and never answers.
pub const HANGS: &str = "read line; sleep 30";

/// Crashes on the first run (detected by `marker` not existing yet), then
/// behaves like [`ECHO_OK`].
pub fn crash_once(marker: &std::path::Path) -> String {
    format!(
        "if [ -f '{m}' ]; then {ok}; else touch '{m}'; read line; exit 1; fi",
        m = marker.display(),
        ok = ECHO_OK,
    )
}

/// A one-tool process running `script` under `sh -c`.
pub fn sh_process(description: &str, tool: &str, tool_description: &str, script: &str) -> Value {
    json!({
        "command": "sh",
        "args": ["-c", script],
        "description": description,
        "tools": { tool: { "description": tool_description } }
    })
}

pub fn catalog(processes: Vec<(&str, Value)>) -> Value {
    let mut mcps = serde_json::Map::new();
    for (name, process) in processes {
        mcps.insert(name.to_string(), process);
    }
    json!({ "mcps": mcps })
}

pub fn orchestrator(doc: &Value, settings: OrchestratorSettings) -> Orchestrator {
    let catalog = Arc::new(Catalog::from_value(doc).unwrap());
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(384).unwrap());
    let router = Arc::new(Router::build(Arc::clone(&catalog), embedder, 16, None).unwrap());
    let pool = Arc::new(ConnectionPool::new(
        Arc::clone(&catalog),
        Duration::from_secs(1),
    ));
    Orchestrator::new(catalog, router, pool, settings)
}
