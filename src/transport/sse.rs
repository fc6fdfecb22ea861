//! Server-sent-events transport variant (§4.2): one-way server push for
//! responses/notifications, plain POST for requests.
//!
//! The teacher has no SSE backend (it only ships stdio and streamable-HTTP),
//! so this is built fresh from the `sse-stream` crate plus the same
//! request/response JSON-RPC framing the other two variants use, following
//! the legacy MCP SSE convention: an initial `GET` on the SSE endpoint
//! yields an `endpoint` event naming the URL to `POST` requests to; all
//! responses and notifications arrive back over the open event stream,
//! demultiplexed by JSON-RPC id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use sse_stream::SseStream;
use tokio::sync::{Mutex, oneshot};

use super::ToolOutcome;
use super::credentials::{self, Credential};
use crate::error::TransportError;
use crate::profile::LaunchSpec;
use crate::schema;
use crate::tool::{ServerInfo, ToolDescriptor};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub struct SseChannel {
    client: reqwest::Client,
    post_url: String,
    next_id: Mutex<u64>,
    pending: PendingMap,
    _listener: tokio::task::JoinHandle<()>,
}

impl SseChannel {
    pub async fn open(backend: &str, spec: &LaunchSpec) -> Result<Self, TransportError> {
        let sse_url = spec
            .url
            .as_deref()
            .ok_or_else(|| TransportError::ConnectFailed("missing url".to_string()))?;

        let mut headers = spec.headers.clone();
        if let Some(auth_spec) = &spec.auth {
            let cred = Credential { kind: auth_spec.kind, material: auth_spec.material.clone() };
            let (name, value) = credentials::to_header(&cred);
            headers.entry(name).or_insert(value);
        }

        let mut builder = reqwest::Client::builder();
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (key, value) in &headers {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                default_headers.insert(name, val);
            }
        }
        builder = builder.default_headers(default_headers);
        let client = builder
            .build()
            .map_err(|e| TransportError::ConnectFailed(format!("failed to build SSE client: {e}")))?;

        let response = client
            .get(sse_url)
            .send()
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("SSE connect to '{backend}' failed: {e}")))?;

        let byte_stream = response.bytes_stream();
        let mut events = SseStream::from_byte_stream(byte_stream);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_for_listener = Arc::clone(&pending);

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let mut endpoint_tx = Some(endpoint_tx);
        let base = sse_url.to_string();

        let listener = tokio::spawn(async move {
            while let Some(Ok(event)) = events.next().await {
                match event.event.as_deref() {
                    Some("endpoint") => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(resolve_endpoint(&base, &event.data));
                        }
                    }
                    _ => {
                        if let Ok(value) = serde_json::from_str::<Value>(&event.data)
                            && let Some(id) = value.get("id").and_then(Value::as_u64)
                            && let Some(sender) = pending_for_listener.lock().await.remove(&id)
                        {
                            let _ = sender.send(value);
                        }
                    }
                }
            }
        });

        let post_url = tokio::time::timeout(Duration::from_secs(10), endpoint_rx)
            .await
            .map_err(|_| TransportError::HandshakeTimeout)?
            .map_err(|_| TransportError::ConnectFailed("SSE stream closed before endpoint event".into()))?;

        Ok(Self {
            client,
            post_url,
            next_id: Mutex::new(1),
            pending,
            _listener: listener,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = {
            let mut guard = self.next_id.lock().await;
            let id = *guard;
            *guard += 1;
            id
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        self.client
            .post(&self.post_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("SSE POST failed: {e}")))?;

        let response = tokio::time::timeout(Duration::from_secs(60), rx)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::Closed)?;

        if let Some(error) = response.get("error") {
            return Err(TransportError::ConnectFailed(error.to_string()));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn resolve_endpoint(base: &str, data: &str) -> String {
    match reqwest::Url::parse(base).and_then(|b| b.join(data)) {
        Ok(url) => url.to_string(),
        Err(_) => data.to_string(),
    }
}

#[async_trait]
impl super::Channel for SseChannel {
    async fn initialize(&mut self) -> Result<ServerInfo, TransportError> {
        let result = self
            .call(
                "initialize",
                json!({ "protocolVersion": "2024-11-05", "capabilities": {} }),
            )
            .await?;
        let server_info = result.get("serverInfo").cloned().unwrap_or(Value::Null);
        Ok(ServerInfo {
            name: server_info
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            version: server_info
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        })
    }

    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let result = self.call("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                description: t
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: schema::parse(t.get("inputSchema").unwrap_or(&Value::Null)),
            })
            .collect())
    }

    async fn call_tool(&mut self, name: &str, args: Value) -> Result<ToolOutcome, TransportError> {
        let result = self
            .call("tools/call", json!({ "name": name, "arguments": args }))
            .await?;
        let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
        Ok(if is_error {
            ToolOutcome::ToolError(result)
        } else {
            ToolOutcome::Success(result)
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self._listener.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_endpoint_against_base() {
        let resolved = resolve_endpoint("https://example.invalid/sse", "/messages?sid=1");
        assert_eq!(resolved, "https://example.invalid/messages?sid=1");
    }

    #[test]
    fn falls_back_to_raw_data_on_unparseable_base() {
        let resolved = resolve_endpoint("not a url", "/messages");
        assert_eq!(resolved, "/messages");
    }
}
