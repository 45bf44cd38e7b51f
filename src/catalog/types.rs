//! Type definitions for the catalog module.

use crate::error::{AppError, Result};
use serde::Serialize;
use serde_json::Value;

/// One (process, tool) pair from the catalog.
///
/// Immutable after load. `(process_name, tool_name)` is unique across the
/// whole catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    /// Owning backend process (e.g. "filesystem", "github")
    pub process_name: String,

    /// Tool name as understood by the backend's `tools/call`
    pub tool_name: String,

    pub description: String,

    /// Tool-level keywords, de-duplicated, first occurrence wins
    pub keywords: Vec<String>,

    /// Declared parameters. Either a JSON schema object with `properties`
    /// or a plain `name -> info` map. `Null` when absent.
    pub parameter_schema: Value,

    pub examples: Vec<String>,
}

impl CatalogEntry {
    /// Check `arguments` against the required properties declared in
    /// `parameter_schema`.
    ///
    /// Only JSON-schema style declarations (`properties` + `required`) are
    /// enforced; a plain parameter map carries no required-ness and passes.
    pub fn check_arguments(&self, arguments: &Value) -> Result<()> {
        let Some(required) = self
            .parameter_schema
            .get("required")
            .and_then(|r| r.as_array())
        else {
            return Ok(());
        };

        let Some(args) = arguments.as_object() else {
            if required.is_empty() {
                return Ok(());
            }
            return Err(AppError::InvalidArguments {
                tool: self.tool_name.clone(),
                reason: "arguments must be an object".to_string(),
            });
        };

        for field in required.iter().filter_map(|f| f.as_str()) {
            if !args.contains_key(field) {
                return Err(AppError::InvalidArguments {
                    tool: self.tool_name.clone(),
                    reason: format!("missing required field: '{field}'"),
                });
            }
        }

        Ok(())
    }
}

/// A backend process and everything needed to launch and describe it.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub description: String,
    pub keywords: Vec<String>,
    /// Categories used by capability filtering (e.g. "image", "code")
    pub categories: Vec<String>,
    /// Tools in document order
    pub tools: Vec<CatalogEntry>,
}

impl ProcessSpec {
    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    pub fn tool(&self, tool_name: &str) -> Option<&CatalogEntry> {
        self.tools.iter().find(|t| t.tool_name == tool_name)
    }
}

/// The loaded catalog. Processes and tools keep document order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    processes: Vec<ProcessSpec>,
}

impl Catalog {
    pub fn new(processes: Vec<ProcessSpec>) -> Self {
        Self { processes }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn processes(&self) -> &[ProcessSpec] {
        &self.processes
    }

    pub fn process(&self, name: &str) -> Option<&ProcessSpec> {
        self.processes.iter().find(|p| p.name == name)
    }

    pub fn entry(&self, process_name: &str, tool_name: &str) -> Option<&CatalogEntry> {
        self.process(process_name)?.tool(tool_name)
    }

    /// Every (process, tool) entry, process by process, in document order.
    pub fn entries(&self) -> impl Iterator<Item = (&ProcessSpec, &CatalogEntry)> {
        self.processes
            .iter()
            .flat_map(|p| p.tools.iter().map(move |t| (p, t)))
    }

    /// Number of (process, tool) entries.
    pub fn len(&self) -> usize {
        self.processes.iter().map(|p| p.tools.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry_with_schema(schema: Value) -> CatalogEntry {
        CatalogEntry {
            process_name: "files".into(),
            tool_name: "read_file".into(),
            description: "Read a file".into(),
            keywords: vec![],
            parameter_schema: schema,
            examples: vec![],
        }
    }

    #[test]
    fn test_check_arguments_missing_required() {
        let entry = entry_with_schema(json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        }));

        let err = entry.check_arguments(&json!({})).unwrap_err();
        assert!(matches!(err, AppError::InvalidArguments { .. }));
        assert!(err.to_string().contains("path"));
    }

    #[test]
    fn test_check_arguments_present() {
        let entry = entry_with_schema(json!({
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        }));

        assert!(entry.check_arguments(&json!({ "path": "/tmp/x" })).is_ok());
    }

    #[test]
    fn test_check_arguments_plain_map_always_passes() {
        let entry = entry_with_schema(json!({ "path": { "description": "Where" } }));
        assert!(entry.check_arguments(&Value::Null).is_ok());
    }

    #[test]
    fn test_check_arguments_non_object_with_required() {
        let entry = entry_with_schema(json!({ "required": ["path"] }));
        assert!(entry.check_arguments(&json!("just a string")).is_err());
    }

    #[test]
    fn test_entries_follow_document_order() {
        let make = |p: &str, t: &str| CatalogEntry {
            process_name: p.into(),
            tool_name: t.into(),
            description: String::new(),
            keywords: vec![],
            parameter_schema: Value::Null,
            examples: vec![],
        };
        let spec = |name: &str, tools: Vec<CatalogEntry>| ProcessSpec {
            name: name.into(),
            command: "true".into(),
            args: vec![],
            description: String::new(),
            keywords: vec![],
            categories: vec![],
            tools,
        };
        let catalog = Catalog::new(vec![
            spec("b", vec![make("b", "two"), make("b", "one")]),
            spec("a", vec![make("a", "three")]),
        ]);

        let order: Vec<(&str, &str)> = catalog
            .entries()
            .map(|(p, t)| (p.name.as_str(), t.tool_name.as_str()))
            .collect();
        assert_eq!(order, vec![("b", "two"), ("b", "one"), ("a", "three")]);
        assert_eq!(catalog.len(), 3);
        assert!(catalog.entry("a", "three").is_some());
        assert!(catalog.entry("a", "one").is_none());
    }
}
