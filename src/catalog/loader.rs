//! Catalog loading from the registry document.
//!
//! The document is a JSON object keyed by process name, optionally wrapped in
//! a top-level `"mcps"` object:
//!
//! ```json
//! { "mcps": {
//!     "filesystem": {
//!       "command": "npx",
//!       "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
//!       "description": "Local file access",
//!       "keywords": ["files", "disk"],
//!       "categories": ["files"],
//!       "tools": {
//!         "read_file": {
//!           "description": "Read a file from disk",
//!           "keywords": ["open", "cat"],
//!           "parameters": { "path": { "description": "File to read" } },
//!           "examples": ["read /etc/hosts"]
//!         }
//!       }
//!     }
//! } }
//! ```
//!
//! Unlike tool atomization from live servers, a malformed catalog is fatal:
//! the service must not come up with a partial catalog.

use crate::catalog::types::{Catalog, CatalogEntry, ProcessSpec};
use crate::error::{AppError, Result};
use serde_json::{Map, Value};
use std::path::Path;

impl Catalog {
    /// Read and parse the catalog document at `path`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::CatalogError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_json_str(&raw)?;

        tracing::info!(
            path = %path.display(),
            processes = catalog.processes().len(),
            tools = catalog.len(),
            "Catalog loaded"
        );

        Ok(catalog)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| AppError::CatalogError(format!("Invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let processes = extract_process_table(value)?
            .iter()
            .map(|(name, spec)| parse_process(name, spec))
            .collect::<Result<Vec<_>>>()?;

        Ok(Catalog::new(processes))
    }
}

/// Locate the process table: `root.mcps` when present, otherwise the root.
fn extract_process_table(json: &Value) -> Result<&Map<String, Value>> {
    let table = match json.get("mcps") {
        Some(mcps) => mcps,
        None => json,
    };

    table.as_object().ok_or_else(|| {
        AppError::CatalogError("Expected an object keyed by process name".into())
    })
}

fn parse_process(name: &str, spec: &Value) -> Result<ProcessSpec> {
    let obj = spec.as_object().ok_or_else(|| {
        AppError::CatalogError(format!("Process '{}' must be an object", name))
    })?;

    let command = obj
        .get("command")
        .and_then(|c| c.as_str())
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            AppError::CatalogError(format!("Process '{}' is missing 'command'", name))
        })?
        .to_string();

    let args = match obj.get("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|a| {
                a.as_str().map(str::to_string).ok_or_else(|| {
                    AppError::CatalogError(format!(
                        "Process '{}' has a non-string argument: {}",
                        name, a
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(AppError::CatalogError(format!(
                "Process '{}' has 'args' of unexpected type: {}",
                name, other
            )))
        }
    };

    let tools = match obj.get("tools") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(tools)) => tools
            .iter()
            .map(|(tool_name, tool)| parse_tool(name, tool_name, tool))
            .collect::<Result<Vec<_>>>()?,
        Some(_) => {
            return Err(AppError::CatalogError(format!(
                "Process '{}' has 'tools' that is not an object",
                name
            )))
        }
    };

    if tools.is_empty() {
        tracing::warn!(process = name, "Process declares no tools");
    }

    Ok(ProcessSpec {
        name: name.to_string(),
        command,
        args,
        description: string_field(obj, "description"),
        keywords: string_set(obj.get("keywords")),
        categories: string_set(obj.get("categories")),
        tools,
    })
}

fn parse_tool(process_name: &str, tool_name: &str, tool: &Value) -> Result<CatalogEntry> {
    let empty = Map::new();
    let obj = match tool {
        Value::Object(obj) => obj,
        Value::Null => &empty,
        _ => {
            return Err(AppError::CatalogError(format!(
                "Tool '{}' on process '{}' must be an object",
                tool_name, process_name
            )))
        }
    };

    let examples = match obj.get("examples") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|e| match e {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(CatalogEntry {
        process_name: process_name.to_string(),
        tool_name: tool_name.to_string(),
        description: string_field(obj, "description"),
        keywords: string_set(obj.get("keywords")),
        parameter_schema: obj.get("parameters").cloned().unwrap_or(Value::Null),
        examples,
    })
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// Collect string items, dropping duplicates while keeping first-seen order.
fn string_set(value: Option<&Value>) -> Vec<String> {
    let Some(items) = value.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items.iter().filter_map(|i| i.as_str()) {
        if !out.iter().any(|seen| seen == item) {
            out.push(item.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_wrapped_registry() {
        let doc = json!({
            "mcps": {
                "filesystem": {
                    "command": "npx",
                    "args": ["-y", "server-filesystem"],
                    "description": "Local files",
                    "keywords": ["files", "disk", "files"],
                    "categories": ["files"],
                    "tools": {
                        "read_file": {
                            "description": "Read a file",
                            "keywords": ["open"],
                            "parameters": { "path": { "description": "File" } },
                            "examples": ["read /etc/hosts"]
                        },
                        "list_dir": { "description": "List a directory" }
                    }
                }
            }
        });

        let catalog = Catalog::from_value(&doc).unwrap();
        assert_eq!(catalog.len(), 2);

        let process = catalog.process("filesystem").unwrap();
        assert_eq!(process.args, vec!["-y", "server-filesystem"]);
        assert_eq!(process.keywords, vec!["files", "disk"]);
        assert!(process.has_category("files"));

        let entry = catalog.entry("filesystem", "read_file").unwrap();
        assert_eq!(entry.examples, vec!["read /etc/hosts"]);
        assert!(entry.parameter_schema.get("path").is_some());
    }

    #[test]
    fn test_load_bare_table_preserves_order() {
        let raw = r#"{
            "zeta": { "command": "z", "tools": { "b": {}, "a": {} } },
            "alpha": { "command": "a", "tools": { "c": null } }
        }"#;

        let catalog = Catalog::from_json_str(raw).unwrap();
        let names: Vec<&str> = catalog.processes().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);

        let tools: Vec<&str> = catalog.entries().map(|(_, t)| t.tool_name.as_str()).collect();
        assert_eq!(tools, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_missing_command_is_fatal() {
        let doc = json!({ "broken": { "tools": { "x": {} } } });
        let err = Catalog::from_value(&doc).unwrap_err();
        assert!(matches!(err, AppError::CatalogError(_)));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_non_object_root_is_fatal() {
        assert!(Catalog::from_value(&json!(["not", "a", "table"])).is_err());
    }

    #[test]
    fn test_empty_document_gives_empty_catalog() {
        let catalog = Catalog::from_value(&json!({ "mcps": {} })).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_non_string_examples_are_rendered() {
        let doc = json!({
            "calc": {
                "command": "calc",
                "tools": { "add": { "examples": [{ "a": 1, "b": 2 }] } }
            }
        });
        let catalog = Catalog::from_value(&doc).unwrap();
        let entry = catalog.entry("calc", "add").unwrap();
        assert_eq!(entry.examples, vec![r#"{"a":1,"b":2}"#]);
    }

    #[test]
    fn test_missing_file_is_catalog_error() {
        let err = Catalog::from_path(Path::new("/nonexistent/registry.json")).unwrap_err();
        assert!(matches!(err, AppError::CatalogError(_)));
    }
}
