//! Agent process access
//!
//! An agent process is an opaque HTTP backend exposing session, message,
//! and health endpoints. [`AgentApi`] is the seam the rest of the daemon
//! talks through; [`AgentClient`] is the reqwest-backed implementation,
//! and tests substitute their own.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::{Child, Command};

use tether_core::config::DaemonConfig;
use tether_protocol::HttpQuery;

/// Errors from talking to an agent process
#[derive(Debug, Error)]
pub enum AgentError {
    /// Network-level failure: connection refused, reset, DNS, timeout
    #[error("Transport error: {0}")]
    Transport(String),

    /// The agent answered with a non-success status
    #[error("Agent returned status {0}")]
    Status(u16),

    /// The agent answered 2xx but the body did not have the expected shape
    #[error("Malformed agent response: {0}")]
    Malformed(String),
}

/// An HTTP response relayed from an agent process
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// Status code from the agent
    pub status: u16,
    /// Parsed body; `Value::Null` when the agent returned an empty body
    pub body: Value,
}

/// The daemon's view of one agent process
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Base URL of the process, for logs and routing tables
    fn base_url(&self) -> &str;

    /// Liveness probe. `Ok` means the process answered 2xx on `/health`.
    async fn health(&self) -> Result<(), AgentError>;

    /// List the sessions this process owns
    async fn list_sessions(&self) -> Result<Vec<Value>, AgentError>;

    /// Fetch the full message list of one session
    async fn session_messages(&self, session_id: &str) -> Result<Vec<Value>, AgentError>;

    /// Forward an arbitrary HTTP-shaped call. Non-success statuses are
    /// returned in the [`ProxyResponse`], not as errors; only transport
    /// failures error.
    async fn proxy(
        &self,
        method: &str,
        path: &str,
        query: Option<&HttpQuery>,
        body: Option<&Value>,
    ) -> Result<ProxyResponse, AgentError>;
}

/// reqwest-backed [`AgentApi`] implementation
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
}

impl AgentClient {
    /// Create a client for the agent process at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json_array(&self, path: &str) -> Result<Vec<Value>, AgentError> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Malformed(e.to_string()))?;

        match body {
            Value::Array(items) => Ok(items),
            other => Err(AgentError::Malformed(format!(
                "expected array, got {}",
                type_name(&other)
            ))),
        }
    }
}

#[async_trait]
impl AgentApi for AgentClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn health(&self) -> Result<(), AgentError> {
        let response = self
            .http
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgentError::Status(response.status().as_u16()))
        }
    }

    async fn list_sessions(&self) -> Result<Vec<Value>, AgentError> {
        self.get_json_array("/sessions").await
    }

    async fn session_messages(&self, session_id: &str) -> Result<Vec<Value>, AgentError> {
        self.get_json_array(&format!("/sessions/{}/messages", session_id))
            .await
    }

    async fn proxy(
        &self,
        method: &str,
        path: &str,
        query: Option<&HttpQuery>,
        body: Option<&Value>,
    ) -> Result<ProxyResponse, AgentError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| AgentError::Transport(format!("bad method {:?}", method)))?;

        let mut request = self.http.request(method, self.url(path));
        if let Some(query) = query {
            request = request.query(&query.iter().collect::<Vec<_>>());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };

        Ok(ProxyResponse { status, body })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A spawned, managed agent process
pub struct ManagedProcess {
    child: Child,
    port: u16,
}

impl ManagedProcess {
    /// Spawn the agent process for a project, substituting `{port}` and
    /// `{dir}` into the configured argument template.
    pub fn spawn(
        config: &DaemonConfig,
        directory: &std::path::Path,
        port: u16,
    ) -> Result<Self, std::io::Error> {
        let args: Vec<String> = config
            .agent_args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{dir}", &directory.to_string_lossy())
            })
            .collect();

        tracing::info!(
            "Spawning agent process: {} {} (port {})",
            config.agent_command,
            args.join(" "),
            port
        );

        let child = Command::new(&config.agent_command)
            .args(&args)
            .current_dir(directory)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        Ok(Self { child, port })
    }

    /// Port the process was told to listen on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Block until the process answers its health endpoint, polling every
    /// 500ms up to `timeout`.
    pub async fn wait_ready(
        &self,
        client: &dyn AgentApi,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if client.health().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::Transport(format!(
                    "agent on port {} not ready after {:?}",
                    self.port, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Terminate the process
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill agent process on port {}: {}", self.port, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let client = AgentClient::new("http://127.0.0.1:4100/");
        assert_eq!(client.url("/sessions"), "http://127.0.0.1:4100/sessions");
    }

    #[test]
    fn test_arg_template_substitution() {
        let mut config = DaemonConfig::default();
        config.agent_args = vec!["--port".into(), "{port}".into(), "{dir}".into()];

        let args: Vec<String> = config
            .agent_args
            .iter()
            .map(|a| a.replace("{port}", "4101").replace("{dir}", "/work/api"))
            .collect();

        assert_eq!(args, vec!["--port", "4101", "/work/api"]);
    }
}
