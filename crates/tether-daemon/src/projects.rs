//! Project registry and session routing
//!
//! A project is a named, directory-scoped binding to one agent process.
//! Managed projects are spawned (and killed) here; attached projects are
//! externally running processes registered by URL, which the daemon never
//! terminates. The manager also owns the session routing table that maps
//! session ids to their owning project.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use tether_core::config::{save_config, DaemonConfig, ProjectEntry};
use tether_core::events::{BusEvent, EventBus};
use tether_core::types::{ProjectName, SessionId};
use tether_core::RelayError;
use tether_protocol::ProjectStatus;

use crate::agent::{AgentApi, AgentClient, ManagedProcess};
use crate::health::{HealthMonitor, HealthState, NoRecovery, Probe, Recovery};

/// Factory producing an [`AgentApi`] for a base URL; tests inject fakes
pub type ClientFactory = Box<dyn Fn(&str) -> Arc<dyn AgentApi> + Send + Sync>;

/// A named, directory-scoped binding to one agent process
#[derive(Debug, Clone)]
pub struct Project {
    /// Unique name, case-insensitive
    pub name: ProjectName,
    /// Working directory (empty for attached projects)
    pub directory: PathBuf,
    /// Whether the daemon owns the process lifecycle
    pub managed: bool,
}

/// Runtime state of one tracked project
pub struct ProjectState {
    /// The project itself
    pub project: Project,
    /// Client for its agent process
    pub client: Arc<dyn AgentApi>,
    /// Allocated port, for managed projects
    pub port: Option<u16>,
    ready: AtomicBool,
    process: Mutex<Option<ManagedProcess>>,
    health: std::sync::Mutex<Option<Arc<HealthMonitor>>>,
    /// Health timer and event-subscriber tasks, aborted on stop/detach
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ProjectState {
    /// Whether the agent process has reported ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Health monitor handle, if wired
    pub fn health(&self) -> Option<Arc<HealthMonitor>> {
        self.health.lock().expect("health lock poisoned").clone()
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
    }
}

/// Probe adapter running the agent's health endpoint
struct ClientProbe {
    client: Arc<dyn AgentApi>,
}

#[async_trait::async_trait]
impl Probe for ClientProbe {
    async fn probe(&self) -> bool {
        self.client.health().await.is_ok()
    }
}

/// Recovery action that restarts a managed agent process
struct RestartRecovery {
    state: Arc<ProjectState>,
    config: DaemonConfig,
    events: Arc<EventBus>,
}

#[async_trait::async_trait]
impl Recovery for RestartRecovery {
    async fn recover(&self) {
        let name = self.state.project.name.clone();
        tracing::info!("Restarting agent process for project '{}'", name);

        let port = match self.state.port {
            Some(port) => port,
            None => return,
        };

        let mut slot = self.state.process.lock().await;
        if let Some(process) = slot.as_mut() {
            process.kill().await;
        }

        match ManagedProcess::spawn(&self.config, &self.state.project.directory, port) {
            Ok(process) => {
                if let Err(e) = process
                    .wait_ready(self.state.client.as_ref(), self.config.spawn_ready_timeout)
                    .await
                {
                    self.events
                        .publish(BusEvent::error("recovery", &e.to_string()));
                    tracing::error!("Restarted process for '{}' never became ready: {}", name, e);
                }
                *slot = Some(process);
            }
            Err(e) => {
                self.events
                    .publish(BusEvent::error("recovery", &e.to_string()));
                tracing::error!("Failed to respawn agent process for '{}': {}", name, e);
            }
        }
    }
}

/// Owns the set of local and attached agent processes
pub struct ProjectManager {
    projects: DashMap<String, Arc<ProjectState>>,
    routes: DashMap<SessionId, String>,
    next_port_offset: AtomicU16,
    config: std::sync::Mutex<DaemonConfig>,
    config_path: Option<PathBuf>,
    client_factory: ClientFactory,
    events: Arc<EventBus>,
}

impl ProjectManager {
    /// Create a manager using the reqwest-backed agent client
    pub fn new(config: DaemonConfig, config_path: Option<PathBuf>, events: Arc<EventBus>) -> Self {
        Self::with_client_factory(
            config,
            config_path,
            events,
            Box::new(|url| Arc::new(AgentClient::new(url)) as Arc<dyn AgentApi>),
        )
    }

    /// Create a manager with an injected client factory (tests)
    pub fn with_client_factory(
        config: DaemonConfig,
        config_path: Option<PathBuf>,
        events: Arc<EventBus>,
        client_factory: ClientFactory,
    ) -> Self {
        Self {
            projects: DashMap::new(),
            routes: DashMap::new(),
            next_port_offset: AtomicU16::new(0),
            config: std::sync::Mutex::new(config),
            config_path,
            client_factory,
            events,
        }
    }

    fn config_snapshot(&self) -> DaemonConfig {
        self.config.lock().expect("config lock poisoned").clone()
    }

    /// Start a managed project. Idempotent: if a project with this name is
    /// already tracked the existing state is returned unchanged.
    pub async fn start_project(
        &self,
        name: &str,
        directory: &Path,
    ) -> Result<Arc<ProjectState>, RelayError> {
        let name = ProjectName::new(name);
        let key = name.key();

        if let Some(existing) = self.projects.get(&key) {
            tracing::warn!("Project '{}' is already running; not restarting", name);
            return Ok(Arc::clone(&existing));
        }

        let directory = normalize_path(directory);
        self.check_directory_unique(&directory)?;

        let config = self.config_snapshot();
        let port = config.base_port + self.next_port_offset.fetch_add(1, Ordering::SeqCst);
        let base_url = format!("http://127.0.0.1:{}", port);
        let client = (self.client_factory)(&base_url);

        let state = Arc::new(ProjectState {
            project: Project {
                name: name.clone(),
                directory: directory.clone(),
                managed: true,
            },
            client: Arc::clone(&client),
            port: Some(port),
            ready: AtomicBool::new(false),
            process: Mutex::new(None),
            health: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        if config.skip_spawn {
            state.set_ready(true);
        } else {
            let process = ManagedProcess::spawn(&config, &directory, port)?;
            process
                .wait_ready(client.as_ref(), config.spawn_ready_timeout)
                .await
                .map_err(|e| RelayError::BadGateway {
                    message: e.to_string(),
                })?;
            *state.process.lock().await = Some(process);
            state.set_ready(true);
        }

        self.wire_monitoring(&state, &config);
        self.projects.insert(key, Arc::clone(&state));
        tracing::info!("Project '{}' started on port {}", name, port);
        Ok(state)
    }

    /// Register an already-running external process by URL
    pub fn attach_project(&self, name: &str, url: &str) -> Result<Arc<ProjectState>, RelayError> {
        let name = ProjectName::new(name);
        let key = name.key();

        if self.projects.contains_key(&key) {
            return Err(RelayError::Conflict(format!(
                "project '{}' already exists",
                name
            )));
        }

        let client = (self.client_factory)(url);
        let state = Arc::new(ProjectState {
            project: Project {
                name: name.clone(),
                directory: PathBuf::new(),
                managed: false,
            },
            client,
            port: None,
            ready: AtomicBool::new(true),
            process: Mutex::new(None),
            health: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let config = self.config_snapshot();
        self.wire_monitoring(&state, &config);
        self.projects.insert(key, Arc::clone(&state));
        tracing::info!("Project '{}' attached at {}", name, url);
        Ok(state)
    }

    /// Stop a managed project: unwire monitoring, purge its session
    /// routes, and terminate the process.
    pub async fn stop_project(&self, name: &str) -> Result<(), RelayError> {
        self.remove_state(name, true).await
    }

    /// Detach a project without touching its process
    pub async fn detach_project(&self, name: &str) -> Result<(), RelayError> {
        self.remove_state(name, false).await
    }

    async fn remove_state(&self, name: &str, kill: bool) -> Result<(), RelayError> {
        let key = ProjectName::new(name).key();
        let (_, state) = self
            .projects
            .remove(&key)
            .ok_or_else(|| RelayError::NotFound(format!("project '{}'", name)))?;

        state.abort_tasks();
        self.routes.retain(|_, owner| *owner != key);

        if kill && state.project.managed {
            if let Some(process) = state.process.lock().await.as_mut() {
                process.kill().await;
            }
        }

        tracing::info!("Project '{}' removed", name);
        Ok(())
    }

    /// Stop every project. Managed processes are terminated; attached
    /// ones are left running.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self
            .projects
            .iter()
            .map(|entry| entry.value().project.name.as_str().to_string())
            .collect();
        for name in names {
            if let Err(e) = self.stop_project(&name).await {
                tracing::warn!("Failed to stop project {}: {}", name, e);
            }
        }
    }

    /// Persist a new project to configuration, then start it
    pub async fn add_project(
        &self,
        name: &str,
        directory: &Path,
    ) -> Result<Arc<ProjectState>, RelayError> {
        {
            let mut config = self.config.lock().expect("config lock poisoned");
            if config
                .projects
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(name))
            {
                return Err(RelayError::Conflict(format!(
                    "project '{}' already configured",
                    name
                )));
            }
            config.projects.push(ProjectEntry {
                name: name.to_string(),
                directory: directory.to_path_buf(),
            });
            if let Some(path) = &self.config_path {
                save_config(path, &*config)?;
            }
        }
        self.start_project(name, directory).await
    }

    /// Remove a project from configuration, then stop it
    pub async fn remove_project(&self, name: &str) -> Result<(), RelayError> {
        {
            let mut config = self.config.lock().expect("config lock poisoned");
            config
                .projects
                .retain(|p| !p.name.eq_ignore_ascii_case(name));
            if let Some(path) = &self.config_path {
                save_config(path, &*config)?;
            }
        }
        self.stop_project(name).await
    }

    /// List sessions across every ready project in parallel. One broken
    /// backend contributes an empty list; the others are unaffected. Every
    /// returned session is tagged with its owner and recorded in the
    /// routing table.
    pub async fn list_all_sessions(&self) -> Vec<Value> {
        let ready: Vec<Arc<ProjectState>> = self
            .projects
            .iter()
            .filter(|entry| entry.value().is_ready())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let results = futures::future::join_all(ready.iter().map(|state| {
            let state = Arc::clone(state);
            async move {
                match state.client.list_sessions().await {
                    Ok(sessions) => (state, sessions),
                    Err(e) => {
                        tracing::warn!(
                            "Session listing failed for project '{}': {}",
                            state.project.name,
                            e
                        );
                        (state, Vec::new())
                    }
                }
            }
        }))
        .await;

        let mut all = Vec::new();
        for (state, sessions) in results {
            let key = state.project.name.key();
            for mut session in sessions {
                if let Some(obj) = session.as_object_mut() {
                    obj.insert(
                        "project".to_string(),
                        Value::String(state.project.name.as_str().to_string()),
                    );
                    if let Some(id) = obj.get("id").and_then(Value::as_str) {
                        self.routes.insert(SessionId::new(id), key.clone());
                    }
                }
                all.push(session);
            }
        }
        all
    }

    /// Fan out an arbitrary GET to every ready project, tagging results
    /// with the owning project name. Used for `/mcp-servers`.
    pub async fn fan_out_get(&self, path: &str) -> Vec<Value> {
        let ready: Vec<Arc<ProjectState>> = self
            .projects
            .iter()
            .filter(|entry| entry.value().is_ready())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let path = path.to_string();
        let results = futures::future::join_all(ready.iter().map(|state| {
            let state = Arc::clone(state);
            let path = path.clone();
            async move {
                match state.client.proxy("GET", &path, None, None).await {
                    Ok(response) if (200..300).contains(&response.status) => {
                        (state, response.body)
                    }
                    Ok(response) => {
                        tracing::warn!(
                            "GET {} on project '{}' returned {}",
                            path,
                            state.project.name,
                            response.status
                        );
                        (state, Value::Array(vec![]))
                    }
                    Err(e) => {
                        tracing::warn!(
                            "GET {} on project '{}' failed: {}",
                            path,
                            state.project.name,
                            e
                        );
                        (state, Value::Array(vec![]))
                    }
                }
            }
        }))
        .await;

        let mut all = Vec::new();
        for (state, body) in results {
            let items = match body {
                Value::Array(items) => items,
                Value::Null => vec![],
                other => vec![other],
            };
            for mut item in items {
                if let Some(obj) = item.as_object_mut() {
                    obj.insert(
                        "project".to_string(),
                        Value::String(state.project.name.as_str().to_string()),
                    );
                }
                all.push(item);
            }
        }
        all
    }

    /// Explicit route assignment, called right after session creation
    pub fn register_session(&self, session_id: &str, project_name: &str) -> Result<(), RelayError> {
        let key = ProjectName::new(project_name).key();
        if !self.projects.contains_key(&key) {
            return Err(RelayError::NotFound(format!("project '{}'", project_name)));
        }
        // Last write wins; a session never maps to two projects at once
        self.routes.insert(SessionId::new(session_id), key);
        Ok(())
    }

    /// Owning project for a session, if routed
    pub fn get_project_for_session(&self, session_id: &str) -> Option<Arc<ProjectState>> {
        let key = self.routes.get(&SessionId::new(session_id))?.clone();
        self.projects.get(&key).map(|entry| Arc::clone(&entry))
    }

    /// Base URL serving a session, if routed
    pub fn get_base_url_for_session(&self, session_id: &str) -> Option<String> {
        self.get_project_for_session(session_id)
            .map(|state| state.client.base_url().to_string())
    }

    /// Base URL of a project's agent process
    pub fn get_base_url_for_project(&self, name: &str) -> Option<String> {
        self.projects
            .get(&ProjectName::new(name).key())
            .map(|entry| entry.client.base_url().to_string())
    }

    /// Resolve a session to its owner, falling back to the only tracked
    /// project when no route is known.
    pub fn resolve_session(&self, session_id: &str) -> Option<Arc<ProjectState>> {
        if let Some(state) = self.get_project_for_session(session_id) {
            return Some(state);
        }
        if self.projects.len() == 1 {
            let state = self
                .projects
                .iter()
                .next()
                .map(|entry| Arc::clone(entry.value()))?;
            tracing::debug!(
                "No route for session {}; falling back to sole project '{}'",
                session_id,
                state.project.name
            );
            return Some(state);
        }
        None
    }

    /// A project by name
    pub fn get_project(&self, name: &str) -> Option<Arc<ProjectState>> {
        self.projects
            .get(&ProjectName::new(name).key())
            .map(|entry| Arc::clone(&entry))
    }

    /// All tracked projects
    pub fn list_projects(&self) -> Vec<Arc<ProjectState>> {
        self.projects
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// False when nothing is tracked; otherwise true only if every
    /// tracked project is ready.
    pub fn all_ready(&self) -> bool {
        !self.projects.is_empty() && self.projects.iter().all(|entry| entry.value().is_ready())
    }

    /// Per-project readiness for `status` frames
    pub fn statuses(&self) -> Vec<ProjectStatus> {
        self.projects
            .iter()
            .map(|entry| ProjectStatus {
                name: entry.value().project.name.as_str().to_string(),
                ready: entry.value().is_ready(),
            })
            .collect()
    }

    /// Number of tracked projects
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    /// Whether no projects are tracked
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    fn check_directory_unique(&self, directory: &Path) -> Result<(), RelayError> {
        for entry in self.projects.iter() {
            let existing = &entry.value().project;
            if existing.managed && normalize_path(&existing.directory) == directory {
                return Err(RelayError::Conflict(format!(
                    "directory {} already used by project '{}'",
                    directory.display(),
                    existing.name
                )));
            }
        }
        Ok(())
    }

    /// Wire the health monitor and the event-subscriber task for a project
    fn wire_monitoring(&self, state: &Arc<ProjectState>, config: &DaemonConfig) {
        let probe = Arc::new(ClientProbe {
            client: Arc::clone(&state.client),
        });

        let recovery: Arc<dyn Recovery> = if state.project.managed && !config.skip_spawn {
            Arc::new(RestartRecovery {
                state: Arc::clone(state),
                config: config.clone(),
                events: Arc::clone(&self.events),
            })
        } else {
            Arc::new(NoRecovery)
        };

        let observer_state = Arc::clone(state);
        let observer_events = Arc::clone(&self.events);
        let monitor = Arc::new(HealthMonitor::new(
            state.project.name.as_str(),
            &config.health,
            probe,
            recovery,
            Some(Box::new(move |health, ready| {
                observer_state.set_ready(ready);
                let kind = match health {
                    HealthState::Healthy => "health.recovered",
                    _ => "health.down",
                };
                observer_events.publish(BusEvent::new(
                    kind,
                    serde_json::json!({
                        "project": observer_state.project.name.as_str(),
                        "ready": ready,
                    }),
                ));
            })),
        ));

        let timer = monitor.spawn_timer(config.health.probe_interval);
        let subscriber = self.spawn_event_subscriber(state);

        *state.health.lock().expect("health lock poisoned") = Some(monitor);
        let mut tasks = state.tasks.lock().expect("task lock poisoned");
        tasks.push(timer);
        tasks.push(subscriber);
    }

    /// Long-poll the agent's event endpoint and publish everything it
    /// yields onto the bus. Failures back off and retry; they are never
    /// surfaced as errors.
    fn spawn_event_subscriber(&self, state: &Arc<ProjectState>) -> JoinHandle<()> {
        let state = Arc::clone(state);
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            loop {
                match state.client.proxy("GET", "/event", None, None).await {
                    Ok(response) if (200..300).contains(&response.status) => {
                        let items = match response.body {
                            Value::Array(items) => items,
                            Value::Null => vec![],
                            other => vec![other],
                        };
                        if items.is_empty() {
                            // Nothing pending; do not hammer the endpoint
                            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                            continue;
                        }
                        for item in items {
                            let kind = item
                                .get("type")
                                .and_then(Value::as_str)
                                .unwrap_or("agent.event")
                                .to_string();
                            events.publish(BusEvent::new(
                                kind,
                                serde_json::json!({
                                    "project": state.project.name.as_str(),
                                    "payload": item,
                                }),
                            ));
                        }
                    }
                    _ => {
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        })
    }
}

/// Lexical path normalization (no filesystem access), used for directory
/// uniqueness comparison
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
