//! Upstream MCP surface (§6): the `ServerHandler` exposing exactly three
//! tools — `find`, `run`, `health` — over whatever transport `main.rs` wires
//! up (stdio by default, streamable HTTP behind `http-upstream`).

use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    schemars,
    service::RequestContext,
    tool, tool_handler, tool_router,
};
use serde::Deserialize;

use crate::finder::{Depth, FindOptions};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct FindParams {
    /// Natural-language description of the task. Empty string browses all tools alphabetically.
    #[serde(default)]
    pub query: String,
    /// Maximum number of results to return.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// 0 = names only, 1 = names + descriptions, 2 = full input schemas.
    #[serde(default = "default_depth")]
    pub depth: u8,
    /// Results scoring below this are dropped.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

fn default_limit() -> usize {
    5
}

fn default_depth() -> u8 {
    1
}

fn default_min_confidence() -> f32 {
    0.30
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunParams {
    /// Qualified tool id, `backend:tool`.
    pub tool: String,
    /// Arguments forwarded verbatim to the backend tool.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

fn depth_from_u8(d: u8) -> Depth {
    match d {
        0 => Depth::Names,
        2 => Depth::Full,
        _ => Depth::Summary,
    }
}

/// The MCP server exposed to upstream clients. Thin wrapper over the
/// Orchestrator Facade — every tool handler is a one-line delegation.
#[derive(Clone)]
pub struct MuxServer {
    orchestrator: Arc<Orchestrator>,
    tool_router: ToolRouter<Self>,
}

impl MuxServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator, tool_router: Self::tool_router() }
    }
}

#[tool_router]
impl MuxServer {
    #[tool(
        description = "Semantic search over every tool exposed by connected backends. Empty query browses all tools alphabetically."
    )]
    async fn find(
        &self,
        Parameters(params): Parameters<FindParams>,
    ) -> Result<CallToolResult, McpError> {
        let options = FindOptions {
            limit: params.limit,
            min_confidence: params.min_confidence,
            depth: depth_from_u8(params.depth),
        };
        let results = self.orchestrator.find(&params.query, &options).await;
        let json = serde_json::to_string(&results)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Invoke one downstream tool by its qualified id (backend:tool).")]
    async fn run(&self, Parameters(params): Parameters<RunParams>) -> Result<CallToolResult, McpError> {
        match self.orchestrator.run(&params.tool, params.arguments).await {
            Ok(value) => {
                let json = serde_json::to_string(&value)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(json)]))
            }
            Err(e) => {
                let (code, message) = e.to_rpc();
                Err(McpError::new(rmcp::model::ErrorCode(code), message, None))
            }
        }
    }

    #[tool(description = "Report per-backend health: status, consecutive failures, latency percentiles.")]
    async fn health(&self) -> Result<CallToolResult, McpError> {
        let snapshot = self.orchestrator.health().await;
        let json = serde_json::to_string(&snapshot)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }
}

#[tool_handler]
impl ServerHandler for MuxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "This server aggregates tools from multiple backend MCP servers behind three \
                 upstream tools.\n\n\
                 - find(query, limit?, depth?, min_confidence?): semantic search over every \
                 downstream tool. Empty query browses alphabetically.\n\
                 - run(tool, arguments): invoke one downstream tool by its qualified id \
                 (\"backend:tool\"), e.g. run(\"fs:read_file\", {path: \"/tmp/x\"}).\n\
                 - health(): per-backend status (healthy/degraded/quarantined), consecutive \
                 failure count, and latency percentiles.\n\n\
                 Downstream tools are never listed directly; always go through find then run."
                    .into(),
            ),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult { meta: None, next_cursor: None, resources: vec![] })
    }
}
