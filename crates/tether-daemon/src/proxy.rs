//! Relayed request dispatch
//!
//! Every `http_request` frame lands here. Paths that concern the daemon
//! itself (`/health`, `/projects`, the fan-outs) are answered locally;
//! session paths are routed to the owning agent process and forwarded
//! verbatim. Failures become structured response bodies, never errors —
//! the tunnel must not crash because a proxied call failed.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use tether_core::RelayError;
use tether_protocol::HttpQuery;

use crate::projects::ProjectManager;

/// Outcome of handling one relayed request
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    /// HTTP status to report back
    pub status: u16,
    /// Response body
    pub body: Value,
}

impl Handled {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn from_error(error: &RelayError) -> Self {
        Self {
            status: error.status_code(),
            body: json!({ "error": error.to_string() }),
        }
    }

    /// The proxy-specific 502 for unreachable agent processes
    fn bad_gateway(message: &str) -> Self {
        Self {
            status: 502,
            body: json!({ "error": "Bad Gateway", "message": message }),
        }
    }

    fn not_found(what: &str) -> Self {
        Self {
            status: 404,
            body: json!({ "error": format!("Not found: {}", what) }),
        }
    }
}

/// Handle one relayed request end to end
pub async fn handle(
    projects: &Arc<ProjectManager>,
    method: &str,
    path: &str,
    query: Option<&HttpQuery>,
    body: Option<&Value>,
) -> Handled {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        ("GET", ["health"]) => Handled::ok(json!({
            "ready": projects.all_ready(),
            "projects": projects.statuses(),
        })),

        ("GET", ["sessions"]) => Handled::ok(Value::Array(projects.list_all_sessions().await)),

        ("POST", ["sessions"]) => create_session(projects, query, body).await,

        ("GET", ["mcp-servers"]) => {
            Handled::ok(Value::Array(projects.fan_out_get("/mcp-servers").await))
        }

        ("GET", ["projects"]) => {
            let list: Vec<Value> = projects
                .list_projects()
                .iter()
                .map(|state| {
                    json!({
                        "name": state.project.name.as_str(),
                        "directory": state.project.directory.to_string_lossy(),
                        "managed": state.project.managed,
                        "ready": state.is_ready(),
                    })
                })
                .collect();
            Handled::ok(Value::Array(list))
        }

        ("POST", ["projects"]) => add_project(projects, body).await,

        ("DELETE", ["projects", name]) => match remove_project(projects, name).await {
            Ok(()) => Handled::ok(json!({ "ok": true })),
            Err(e) => Handled::from_error(&e),
        },

        (_, ["sessions", session_id, ..]) => {
            forward_session_call(projects, session_id, method, path, query, body).await
        }

        _ => Handled::not_found(path),
    }
}

/// Normalize an empty 2xx agent body to `200 {"ok":true}`
fn normalize(status: u16, body: Value) -> Handled {
    if (200..300).contains(&status) && body.is_null() {
        Handled::ok(json!({ "ok": true }))
    } else {
        Handled { status, body }
    }
}

async fn forward_session_call(
    projects: &Arc<ProjectManager>,
    session_id: &str,
    method: &str,
    path: &str,
    query: Option<&HttpQuery>,
    body: Option<&Value>,
) -> Handled {
    let state = match projects.resolve_session(session_id) {
        Some(state) => state,
        None => return Handled::not_found(&format!("session {}", session_id)),
    };

    match state.client.proxy(method, path, query, body).await {
        Ok(response) => normalize(response.status, response.body),
        Err(e) => Handled::bad_gateway(&e.to_string()),
    }
}

async fn create_session(
    projects: &Arc<ProjectManager>,
    query: Option<&HttpQuery>,
    body: Option<&Value>,
) -> Handled {
    // Owner comes from a `project` hint in the query or body, else the
    // single-project fallback
    let hint = query
        .and_then(|q| q.get("project").cloned())
        .or_else(|| {
            body.and_then(|b| b.get("project"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    let state = match &hint {
        Some(name) => projects.get_project(name),
        None if projects.len() == 1 => projects.list_projects().into_iter().next(),
        None => None,
    };
    let state = match state {
        Some(state) => state,
        None => {
            return Handled::not_found(
                hint.as_deref().unwrap_or("a target project (none specified)"),
            )
        }
    };

    match state.client.proxy("POST", "/sessions", query, body).await {
        Ok(response) if (200..300).contains(&response.status) => {
            if let Some(id) = response.body.get("id").and_then(Value::as_str) {
                let _ = projects.register_session(id, state.project.name.as_str());
            }
            normalize(response.status, response.body)
        }
        Ok(response) => Handled {
            status: response.status,
            body: response.body,
        },
        Err(e) => Handled::bad_gateway(&e.to_string()),
    }
}

async fn add_project(projects: &Arc<ProjectManager>, body: Option<&Value>) -> Handled {
    let body = match body {
        Some(body) => body,
        None => {
            return Handled {
                status: 400,
                body: json!({ "error": "Missing request body" }),
            }
        }
    };
    let name = match body.get("name").and_then(Value::as_str) {
        Some(name) => name,
        None => {
            return Handled {
                status: 400,
                body: json!({ "error": "Missing project name" }),
            }
        }
    };

    let result = if let Some(url) = body.get("url").and_then(Value::as_str) {
        projects.attach_project(name, url)
    } else {
        match body.get("directory").and_then(Value::as_str) {
            Some(directory) => projects.add_project(name, Path::new(directory)).await,
            None => {
                return Handled {
                    status: 400,
                    body: json!({ "error": "Project needs a directory or a url" }),
                }
            }
        }
    };

    match result {
        Ok(state) => Handled {
            status: 201,
            body: json!({
                "name": state.project.name.as_str(),
                "managed": state.project.managed,
                "ready": state.is_ready(),
            }),
        },
        Err(e) => Handled::from_error(&e),
    }
}

async fn remove_project(projects: &Arc<ProjectManager>, name: &str) -> Result<(), RelayError> {
    let state = projects
        .get_project(name)
        .ok_or_else(|| RelayError::NotFound(format!("project '{}'", name)))?;

    if state.project.managed {
        projects.remove_project(name).await
    } else {
        projects.detach_project(name).await
    }
}
