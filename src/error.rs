//! Error taxonomy shared across the orchestration kernel.
//!
//! Each component family gets one `thiserror` enum; `JsonRpcError::from` maps
//! any of them to the upstream JSON-RPC error code + message. Infrastructure
//! glue that the taxonomy doesn't name (stray IO, serde edge cases) rides in
//! an `anyhow`-backed variant so call sites keep using `?`.

use thiserror::Error;

/// Errors surfaced while discovering or reaching a backend over its transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn backend process: {0}")]
    SpawnFailed(String),
    #[error("failed to connect to backend: {0}")]
    ConnectFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("handshake with backend timed out")]
    HandshakeTimeout,
    #[error("backend speaks an incompatible protocol version: {0}")]
    ProtocolMismatch(String),
    /// A stdio backend's stderr matched a known "missing config" pattern
    /// (see `transport::classify_stderr_line`) before its handshake failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration problems surfaced during discovery that do not quarantine a backend.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("backend reported a missing required field: {0}")]
    MissingField(String),
    #[error("backend printed a usage line, likely missing arguments: {0}")]
    UsageLine(String),
    #[error("backend requires authentication that was not supplied")]
    AuthRequired,
}

/// Authentication failures. Always permanent — the backend is quarantined immediately.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials required but not provided")]
    Required,
    #[error("credential material was rejected by the backend")]
    Failed,
    #[error("credential material has expired")]
    Expired,
}

/// Protocol-level faults. Always permanent.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("malformed message from backend: {0}")]
    MalformedMessage(String),
    #[error("unsupported protocol version: {0}")]
    Version(String),
}

/// Cache-file faults. Never surfaced to a client; trigger a rebuild at load time.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache schema version mismatch: found {found}, expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },
    #[error("cache file is corrupted: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// A failure classified for the purposes of the Health Monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network hiccup, timeout: increments the consecutive-failure counter.
    Transient,
    /// Auth or protocol fault: jumps straight to quarantined.
    Permanent,
}

impl TransportError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::Config(_) => FailureKind::Permanent,
            _ => FailureKind::Transient,
        }
    }
}

impl AuthError {
    pub fn failure_kind(&self) -> FailureKind {
        FailureKind::Permanent
    }
}

impl ProtocolError {
    pub fn failure_kind(&self) -> FailureKind {
        FailureKind::Permanent
    }
}

/// Router-level validation faults, raised before any backend I/O happens.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("'{0}' is not a valid qualified tool id (expected backend:tool)")]
    InvalidToolId(String),
    #[error("no tool named '{0}' is known to the orchestrator")]
    UnknownTool(String),
    #[error("backend '{0}' is quarantined")]
    BackendQuarantined(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A structured error returned by the backend itself in response to a
    /// call_tool. Passed through verbatim; does not count against health.
    #[error("tool returned an error: {0}")]
    ToolError(serde_json::Value),
}

/// Top-level error type threaded through the orchestrator facade.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// JSON-RPC 2.0 error codes used on the upstream side, per the taxonomy in §7.
pub mod rpc_code {
    pub const INVALID_TOOL_ID: i32 = -32001;
    pub const UNKNOWN_TOOL: i32 = -32002;
    pub const BACKEND_QUARANTINED: i32 = -32003;
    pub const INVALID_ARGUMENTS: i32 = -32602;
    pub const TRANSPORT_ERROR: i32 = -32010;
    pub const AUTH_ERROR: i32 = -32011;
    pub const PROTOCOL_ERROR: i32 = -32012;
    pub const TOOL_ERROR: i32 = -32020;
    pub const INTERNAL_ERROR: i32 = -32603;
}

impl OrchestratorError {
    /// Map to `(code, message)` for the upstream JSON-RPC error object.
    pub fn to_rpc(&self) -> (i32, String) {
        match self {
            OrchestratorError::Router(RouterError::InvalidToolId(_)) => {
                (rpc_code::INVALID_TOOL_ID, self.to_string())
            }
            OrchestratorError::Router(RouterError::UnknownTool(_)) => {
                (rpc_code::UNKNOWN_TOOL, self.to_string())
            }
            OrchestratorError::Router(RouterError::BackendQuarantined(_)) => {
                (rpc_code::BACKEND_QUARANTINED, self.to_string())
            }
            OrchestratorError::Router(RouterError::InvalidArguments(_)) => {
                (rpc_code::INVALID_ARGUMENTS, self.to_string())
            }
            OrchestratorError::Router(RouterError::ToolError(_)) => {
                (rpc_code::TOOL_ERROR, self.to_string())
            }
            OrchestratorError::Router(RouterError::Transport(_))
            | OrchestratorError::Transport(_) => (rpc_code::TRANSPORT_ERROR, self.to_string()),
            OrchestratorError::Auth(_) => (rpc_code::AUTH_ERROR, self.to_string()),
            OrchestratorError::Protocol(_) => (rpc_code::PROTOCOL_ERROR, self.to_string()),
            OrchestratorError::Config(_) | OrchestratorError::Cache(_) => {
                (rpc_code::INTERNAL_ERROR, self.to_string())
            }
            OrchestratorError::Other(_) => (rpc_code::INTERNAL_ERROR, self.to_string()),
        }
    }

    /// Map to a CLI exit code, per §6's exit-code table.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Router(RouterError::InvalidArguments(_)) => 2,
            OrchestratorError::Router(RouterError::BackendQuarantined(_)) => 3,
            OrchestratorError::Router(RouterError::UnknownTool(_))
            | OrchestratorError::Router(RouterError::InvalidToolId(_)) => 4,
            OrchestratorError::Cache(_) => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_match_taxonomy() {
        let e = OrchestratorError::Router(RouterError::UnknownTool("x:y".into()));
        assert_eq!(e.to_rpc().0, rpc_code::UNKNOWN_TOOL);
        assert_eq!(e.exit_code(), 4);
    }

    #[test]
    fn quarantine_exit_code() {
        let e = OrchestratorError::Router(RouterError::BackendQuarantined("fs".into()));
        assert_eq!(e.exit_code(), 3);
    }

    #[test]
    fn failure_kinds() {
        assert_eq!(TransportError::Timeout.failure_kind(), FailureKind::Transient);
        assert_eq!(AuthError::Required.failure_kind(), FailureKind::Permanent);
        assert_eq!(
            ProtocolError::Version("2099-01-01".into()).failure_kind(),
            FailureKind::Permanent
        );
    }
}
