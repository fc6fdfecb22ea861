//! HTTP streaming transport variant (§4.2): a long-lived chunked HTTP
//! connection via rmcp's reqwest-based streamable-HTTP client.
//!
//! Grounded in the teacher's `backend::http::HttpBackend`: same header
//! wiring (Authorization stripped of its `Bearer ` prefix and handed to
//! rmcp's `auth_header`, everything else forwarded as default headers on a
//! custom reqwest client).

use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use serde_json::Value;

use super::ToolOutcome;
use super::credentials::{self, Credential};
use crate::error::TransportError;
use crate::profile::LaunchSpec;
use crate::tool::ServerInfo;

pub struct HttpChannel {
    backend: String,
    service: Option<RunningService<rmcp::RoleClient, ()>>,
}

impl HttpChannel {
    pub async fn open(backend: &str, spec: &LaunchSpec) -> Result<Self, TransportError> {
        let url = spec
            .url
            .as_deref()
            .ok_or_else(|| TransportError::ConnectFailed("missing url".to_string()))?;

        let mut headers = spec.headers.clone();
        if let Some(auth_spec) = &spec.auth {
            let cred = Credential { kind: auth_spec.kind, material: auth_spec.material.clone() };
            let (name, value) = credentials::to_header(&cred);
            headers.entry(name).or_insert(value);
        }

        let mut transport_config = StreamableHttpClientTransportConfig::with_uri(url);

        if let Some(auth) = headers.get("Authorization") {
            let token = auth.strip_prefix("Bearer ").unwrap_or(auth);
            transport_config = transport_config.auth_header(token);
        }

        let mut default_headers = reqwest::header::HeaderMap::new();
        for (key, value) in &headers {
            if key.eq_ignore_ascii_case("Authorization") {
                continue;
            }
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                default_headers.insert(name, val);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| TransportError::ConnectFailed(format!("failed to build HTTP client: {e}")))?;

        let transport = StreamableHttpClientTransport::with_client(client, transport_config);

        let service = ().serve(transport).await.map_err(|e| {
            TransportError::ConnectFailed(format!("HTTP handshake with '{backend}' at {url} failed: {e}"))
        })?;

        Ok(Self {
            backend: backend.to_string(),
            service: Some(service),
        })
    }
}

#[async_trait]
impl super::Channel for HttpChannel {
    async fn initialize(&mut self) -> Result<ServerInfo, TransportError> {
        let service = self.service.as_ref().ok_or(TransportError::Closed)?;
        match service.peer_info() {
            Some(peer) => Ok(ServerInfo {
                name: peer.server_info.name.to_string(),
                version: peer.server_info.version.to_string(),
            }),
            None => Ok(ServerInfo {
                name: self.backend.clone(),
                version: "unknown".to_string(),
            }),
        }
    }

    async fn list_tools(&mut self) -> Result<Vec<crate::tool::ToolDescriptor>, TransportError> {
        let service = self.service.as_ref().ok_or(TransportError::Closed)?;
        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("list_tools failed: {e}")))?;
        Ok(super::map_tools(tools))
    }

    async fn call_tool(&mut self, name: &str, args: Value) -> Result<ToolOutcome, TransportError> {
        let service = self.service.as_ref().ok_or(TransportError::Closed)?;
        let params = rmcp::model::CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments: args.as_object().cloned(),
            task: None,
        };
        let result = service
            .call_tool(params)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("call_tool failed: {e}")))?;
        Ok(super::map_call_result(result))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(service) = self.service.take() {
            let _ = service.cancel().await;
        }
        Ok(())
    }
}
