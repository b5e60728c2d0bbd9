//! Daemon tunnel connection tracking
//!
//! The orchestrator holds at most one live tunnel per deployment. A new
//! connection supersedes the old one: the previous socket's sender is
//! dropped and every in-flight command fails rather than dangling.
//! Generations keep teardown honest; a close notification from a stale
//! socket must never clobber the connection that replaced it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use tether_core::RelayError;
use tether_protocol::{Frame, HttpQuery, ProjectStatus};

/// What the daemon last reported about itself
#[derive(Debug, Clone, Default)]
pub struct DaemonStatus {
    /// True only when every tracked project is ready
    pub all_ready: bool,
    /// Per-project readiness
    pub projects: Vec<ProjectStatus>,
}

/// Result of one relayed command
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// HTTP status from the daemon side
    pub status: u16,
    /// Response body
    pub body: Value,
}

struct Inner {
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    pending: HashMap<String, oneshot::Sender<CommandOutcome>>,
    status: DaemonStatus,
}

/// The single daemon tunnel slot
pub struct DaemonConnection {
    command_timeout: Duration,
    generation: AtomicU64,
    next_request: AtomicU64,
    inner: StdMutex<Inner>,
}

impl DaemonConnection {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            generation: AtomicU64::new(0),
            next_request: AtomicU64::new(0),
            inner: StdMutex::new(Inner {
                outbound: None,
                pending: HashMap::new(),
                status: DaemonStatus::default(),
            }),
        }
    }

    /// Attach a new tunnel, superseding any existing one. Returns the
    /// generation the caller must present to [`detach`](Self::detach).
    pub fn attach(&self, outbound: mpsc::UnboundedSender<Frame>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut inner = self.inner.lock().expect("connection lock poisoned");

        if inner.outbound.is_some() {
            tracing::warn!("New tunnel supersedes the existing one");
        }

        // In-flight commands belonged to the old socket; fail them now
        // by dropping their reply slots.
        inner.pending.clear();
        inner.outbound = Some(outbound);
        inner.status = DaemonStatus::default();
        generation
    }

    /// Drop the tunnel identified by `generation`. A stale generation is
    /// ignored so a superseded socket's teardown cannot detach its
    /// replacement.
    pub fn detach(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Ignoring detach from superseded tunnel");
            return;
        }

        let mut inner = self.inner.lock().expect("connection lock poisoned");
        inner.outbound = None;
        inner.pending.clear();
        inner.status = DaemonStatus::default();
        tracing::info!("Daemon disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .lock()
            .expect("connection lock poisoned")
            .outbound
            .is_some()
    }

    /// Latest readiness report from the daemon
    pub fn status(&self) -> DaemonStatus {
        self.inner
            .lock()
            .expect("connection lock poisoned")
            .status
            .clone()
    }

    pub fn update_status(&self, all_ready: bool, projects: Vec<ProjectStatus>) {
        let mut inner = self.inner.lock().expect("connection lock poisoned");
        inner.status = DaemonStatus {
            all_ready,
            projects,
        };
    }

    /// Send a frame down the tunnel
    pub fn send(&self, frame: Frame) -> Result<(), RelayError> {
        let inner = self.inner.lock().expect("connection lock poisoned");
        match inner.outbound.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| RelayError::Disconnected),
            None => Err(RelayError::Disconnected),
        }
    }

    /// Relay one HTTP-shaped command and wait for its correlated answer.
    ///
    /// Settles exactly once per request id: a normal answer resolves it, a
    /// timeout removes the reply slot so a late answer is dropped, and a
    /// disconnect fails it by dropping the slot.
    pub async fn send_command(
        &self,
        method: &str,
        path: &str,
        query: Option<HttpQuery>,
        body: Option<Value>,
    ) -> Result<CommandOutcome, RelayError> {
        let request_id = format!("req-{}", self.next_request.fetch_add(1, Ordering::Relaxed));
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut inner = self.inner.lock().expect("connection lock poisoned");
            if inner.outbound.is_none() {
                return Err(RelayError::Disconnected);
            }
            // Register the reply slot before the frame can leave, so the
            // answer cannot race the registration.
            inner.pending.insert(request_id.clone(), reply_tx);
            let sent = inner
                .outbound
                .as_ref()
                .expect("checked above")
                .send(Frame::HttpRequest {
                    request_id: request_id.clone(),
                    method: method.to_string(),
                    path: path.to_string(),
                    query,
                    body,
                });
            if sent.is_err() {
                inner.pending.remove(&request_id);
                return Err(RelayError::Disconnected);
            }
        }

        match tokio::time::timeout(self.command_timeout, reply_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(RelayError::Disconnected),
            Err(_) => {
                self.inner
                    .lock()
                    .expect("connection lock poisoned")
                    .pending
                    .remove(&request_id);
                tracing::warn!("Command {} timed out after {:?}", request_id, self.command_timeout);
                Err(RelayError::Timeout(self.command_timeout.as_secs()))
            }
        }
    }

    /// Settle the command matching `request_id`. Unmatched ids (already
    /// timed out, or from a superseded connection) are dropped.
    pub fn resolve(&self, request_id: &str, status: u16, body: Value) {
        let reply = self
            .inner
            .lock()
            .expect("connection lock poisoned")
            .pending
            .remove(request_id);

        match reply {
            Some(tx) => {
                let _ = tx.send(CommandOutcome { status, body });
            }
            None => tracing::debug!("Dropping answer for unknown request {}", request_id),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .expect("connection lock poisoned")
            .pending
            .len()
    }
}
