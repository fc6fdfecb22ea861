//! Transport Factory (C2): `LaunchSpec -> Channel`.
//!
//! A `Channel` is a full-duplex JSON-RPC abstraction over one backend
//! connection; three tagged variants implement it (stdio, HTTP streaming,
//! SSE) behind a uniform trait, matching the "small set of tagged transport
//! variants, `match` on the tag, no inheritance hierarchy" design note (§9).
//! Grounded in the teacher's `backend::Backend` trait and its `stdio`/`http`
//! implementations, generalized from the teacher's fused
//! connect-and-manage-lifecycle struct into a pure `open(spec) -> Channel`
//! factory function, since lifecycle (pooling, health, reuse counts) is
//! owned by the Connection Pool (C11) here, not by the transport itself.

pub mod credentials;
pub mod http;
pub mod sse;
pub mod stdio;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::profile::{LaunchSpec, Transport as TransportTag};
use crate::schema;
use crate::tool::{ServerInfo, ToolDescriptor};

/// Outcome of a `call_tool`, distinguishing a backend-reported tool error
/// (§4.10 step 7: passed through as a result, never counted against health)
/// from the transport-level failures `Channel::call_tool`'s `Err` carries.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Success(Value),
    ToolError(Value),
}

/// A live bidirectional JSON-RPC connection to one backend.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn initialize(&mut self) -> Result<ServerInfo, TransportError>;
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, TransportError>;
    async fn call_tool(&mut self, name: &str, args: Value) -> Result<ToolOutcome, TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// `match` on the launch spec's transport tag and produce a live channel.
/// Per §4.2: stdio spawns a subprocess; http/sse open network connections.
pub async fn open(name: &str, spec: &LaunchSpec) -> Result<Box<dyn Channel>, TransportError> {
    match spec.transport {
        TransportTag::Stdio => Ok(Box::new(stdio::StdioChannel::open(name, spec).await?)),
        TransportTag::HttpStreaming => Ok(Box::new(http::HttpChannel::open(name, spec).await?)),
        TransportTag::Sse => Ok(Box::new(sse::SseChannel::open(name, spec).await?)),
    }
}

/// Map an rmcp `Tool` list into this crate's `ToolDescriptor`s, parsing each
/// tool's JSON input schema into the tagged-variant `SchemaNode` tree (§9).
pub(crate) fn map_tools(tools: Vec<rmcp::model::Tool>) -> Vec<ToolDescriptor> {
    tools
        .into_iter()
        .map(|t| {
            let raw_schema = serde_json::to_value(&t.input_schema).unwrap_or(Value::Null);
            ToolDescriptor {
                name: t.name.to_string(),
                description: t.description.unwrap_or_default().to_string(),
                input_schema: schema::parse(&raw_schema),
            }
        })
        .collect()
}

/// Map an rmcp `CallToolResult` into the plain JSON value this crate passes
/// back to clients, tagged by `is_error` so the caller can tell a structured
/// tool error apart from a normal result (§4.10 step 7).
pub(crate) fn map_call_result(result: rmcp::model::CallToolResult) -> ToolOutcome {
    use rmcp::model::RawContent;

    let is_error = result.is_error.unwrap_or(false);
    let contents: Vec<Value> = result
        .content
        .into_iter()
        .map(|c| match c.raw {
            RawContent::Text(t) => Value::String(t.text),
            _ => Value::String("[non-text content]".to_string()),
        })
        .collect();

    let value = if contents.len() == 1 {
        contents.into_iter().next().unwrap()
    } else {
        Value::Array(contents)
    };

    if is_error {
        ToolOutcome::ToolError(value)
    } else {
        ToolOutcome::Success(value)
    }
}

/// Scan a line of captured stderr for well-known "missing config" patterns
/// and classify it as a `ConfigError`, if recognized (§4.2).
pub(crate) fn classify_stderr_line(line: &str) -> Option<crate::error::ConfigError> {
    let lower = line.to_lowercase();
    if lower.contains("api key") || lower.contains("api_key") || lower.contains("authentication required")
    {
        Some(crate::error::ConfigError::AuthRequired)
    } else if lower.starts_with("usage:") || lower.contains("usage: ") {
        Some(crate::error::ConfigError::UsageLine(line.to_string()))
    } else if lower.contains("no such file or directory") || lower.contains("command not found") {
        Some(crate::error::ConfigError::MissingField(line.to_string()))
    } else {
        None
    }
}
