//! Stdio transport variant (§4.2): spawn the backend's command, frame
//! messages over its stdin/stdout, capture stderr to a rotating per-backend
//! log and scan it for well-known config-error patterns.
//!
//! Grounded in the teacher's `backend::stdio::StdioBackend`: same process-
//! group spawn + SIGTERM-to-group kill idiom, same rmcp `serve((stdout,
//! stdin))` handshake. Extended with the stderr-capture-and-scan behavior
//! the teacher's `Stdio::null()` choice does not need (the teacher's stderr
//! just vanishes; this spec requires it captured and classified).

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::service::RunningService;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, TransportError};
use crate::profile::LaunchSpec;
use crate::tool::ServerInfo;

pub struct StdioChannel {
    backend: String,
    service: Option<RunningService<rmcp::RoleClient, ()>>,
    child: Option<Child>,
}

impl StdioChannel {
    pub async fn open(backend: &str, spec: &LaunchSpec) -> Result<Self, TransportError> {
        let command = spec
            .command
            .as_deref()
            .ok_or_else(|| TransportError::SpawnFailed("missing command".to_string()))?;

        let mut cmd = Command::new(command);
        if !spec.args.is_empty() {
            cmd.args(&spec.args);
        }
        // `spec.auth` has no bearing here: a stdio backend's credentials are
        // already resolved into its `env`/`args` at config-load time, not
        // attached to a runtime request the way http/sse headers are.
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::SpawnFailed(format!("{backend}: {e}")))?;

        let pid = child.id();
        debug!(backend, pid = ?pid, "spawned stdio child process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("no stdout handle".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("no stdin handle".to_string()))?;
        let stderr_error: Arc<StdMutex<Option<ConfigError>>> = Arc::new(StdMutex::new(None));
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_capture(backend.to_string(), stderr, Arc::clone(&stderr_error));
        }

        let service = match ().serve((stdout, stdin)).await {
            Ok(service) => service,
            Err(e) => {
                // Give the stderr-capture task a moment to classify any
                // config-error pattern the backend printed before exiting.
                tokio::time::sleep(std::time::Duration::from_millis(150)).await;
                if let Some(kind) = stderr_error.lock().unwrap().clone() {
                    return Err(TransportError::Config(kind));
                }
                return Err(TransportError::ConnectFailed(format!("stdio handshake failed: {e}")));
            }
        };

        Ok(Self {
            backend: backend.to_string(),
            service: Some(service),
            child: Some(child),
        })
    }

    async fn kill_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: libc::kill is safe for any PID value; this signals the
            // whole process group (negative PID) so subprocesses of the
            // backend die too.
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            } else {
                warn!(backend = %self.backend, pid, "failed to signal process group, killing child directly");
            }
        }
        let _ = child.kill().await;
    }
}

#[async_trait]
impl super::Channel for StdioChannel {
    async fn initialize(&mut self) -> Result<ServerInfo, TransportError> {
        let service = self
            .service
            .as_ref()
            .ok_or(TransportError::Closed)?;
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

    async fn call_tool(&mut self, name: &str, args: Value) -> Result<super::ToolOutcome, TransportError> {
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
        self.kill_child().await;
        Ok(())
    }
}

/// Tail the child's stderr line by line: append to `<base>/logs/<backend>.log`
/// and scan each line for config-error patterns. The first match is stored in
/// `slot` so `StdioChannel::open` can surface it as a `TransportError::Config`
/// if the handshake goes on to fail.
fn spawn_stderr_capture(
    backend: String,
    stderr: tokio::process::ChildStderr,
    slot: Arc<StdMutex<Option<ConfigError>>>,
) {
    tokio::spawn(async move {
        let log_path = default_log_path(&backend);
        let mut log_file = log_path
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .ok()
            .and_then(|_| std::fs::OpenOptions::new().create(true).append(true).open(&log_path).ok());

        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(file) = log_file.as_mut() {
                let _ = writeln!(file, "{line}");
            }
            if let Some(kind) = super::classify_stderr_line(&line) {
                warn!(backend = %backend, pattern = ?kind, line = %line, "backend stderr matched a known config-error pattern");
                let mut guard = slot.lock().unwrap();
                if guard.is_none() {
                    *guard = Some(kind);
                }
            }
        }
    });
}

fn default_log_path(backend: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcpmux")
        .join("logs")
        .join(format!("{backend}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_path_is_under_logs_dir() {
        let path = default_log_path("fs");
        assert!(path.to_string_lossy().ends_with("logs/fs.log"));
    }
}
