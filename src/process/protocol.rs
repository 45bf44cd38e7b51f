//! Line-delimited JSON-RPC envelopes exchanged with backend processes.
//!
//! Request: `{"jsonrpc":"2.0","method":"tools/call","params":{"name":..,"arguments":..},"id":N}`
//! Response: `{"id":N,"result":..}` or `{"id":N,"error":{"message":..}}`
//!
//! One JSON object per line. `serde_json` escapes control characters inside
//! strings, so a serialized envelope never contains a raw newline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const TOOLS_CALL: &str = "tools/call";

#[derive(Debug, Serialize)]
pub struct ToolCallRequest<'a> {
    #[serde(rename = "jsonrpc")]
    pub protocol_version: &'static str,
    pub method: &'static str,
    pub params: ToolCallParams<'a>,
    pub id: u64,
}

#[derive(Debug, Serialize)]
pub struct ToolCallParams<'a> {
    pub name: &'a str,
    pub arguments: &'a Value,
}

impl<'a> ToolCallRequest<'a> {
    pub fn new(id: u64, tool_name: &'a str, arguments: &'a Value) -> Self {
        Self {
            protocol_version: JSONRPC_VERSION,
            method: TOOLS_CALL,
            params: ToolCallParams {
                name: tool_name,
                arguments,
            },
            id,
        }
    }

    /// Serialize to a single line, trailing newline included.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Response envelope. `result` and `error` are both optional on the wire.
#[derive(Debug, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// What a well-formed response carried.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Success(Value),
    /// Tool-reported failure, with its message
    Failure(String),
}

impl ResponseEnvelope {
    pub fn parse(line: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(line.trim_end())
            .map_err(|e| format!("unparseable response: {e}"))?;
        if !value.is_object() {
            return Err(format!("response is not a JSON object: {value}"));
        }
        serde_json::from_value(value).map_err(|e| format!("malformed response envelope: {e}"))
    }

    pub fn id_matches(&self, expected: u64) -> bool {
        self.id.as_u64() == Some(expected)
    }

    pub fn into_outcome(self) -> Outcome {
        match self.error {
            Some(Value::Null) | None => Outcome::Success(self.result.unwrap_or(Value::Null)),
            Some(err) => Outcome::Failure(error_message(&err)),
        }
    }
}

fn error_message(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        Value::Object(obj) => match obj.get("message").and_then(|m| m.as_str()) {
            Some(message) => match obj.get("code").and_then(|c| c.as_i64()) {
                Some(code) => format!("[{code}] {message}"),
                None => message.to_string(),
            },
            None => err.to_string(),
        },
        other => other.to_string(),
    }
}
