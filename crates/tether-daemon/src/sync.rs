//! Reconnect backfill, daemon side
//!
//! When the orchestrator reattaches it sends a `sync_request` naming every
//! session it knows about. The answer is built fresh from the owning agent
//! processes, never from a local cache, so the orchestrator always merges
//! current truth. A session the agent no longer has yields an empty
//! message list rather than an error.

use std::sync::Arc;

use tether_protocol::{Frame, SessionSync};

use crate::projects::ProjectManager;

/// Build the `sync_response` for a `sync_request`
pub async fn build_sync_response(
    projects: &Arc<ProjectManager>,
    cached_session_ids: &[String],
) -> Frame {
    let lookups = cached_session_ids.iter().map(|session_id| {
        let projects = Arc::clone(projects);
        let session_id = session_id.clone();
        async move {
            let messages = match projects.resolve_session(&session_id) {
                Some(state) => match state.client.session_messages(&session_id).await {
                    Ok(messages) => messages,
                    Err(e) => {
                        tracing::warn!(
                            "Backfill query for session {} failed: {}; returning empty",
                            session_id,
                            e
                        );
                        vec![]
                    }
                },
                None => {
                    tracing::debug!("No owner for cached session {}; returning empty", session_id);
                    vec![]
                }
            };
            SessionSync {
                id: session_id,
                messages,
            }
        }
    });

    let sessions = futures::future::join_all(lookups).await;
    Frame::SyncResponse { sessions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use serde_json::{json, Value};

    use tether_core::config::DaemonConfig;
    use tether_core::events::EventBus;
    use tether_protocol::HttpQuery;

    use crate::agent::{AgentApi, AgentError, ProxyResponse};

    struct BackfillAgent {
        base_url: String,
    }

    #[async_trait::async_trait]
    impl AgentApi for BackfillAgent {
        fn base_url(&self) -> &str {
            &self.base_url
        }

        async fn health(&self) -> Result<(), AgentError> {
            Ok(())
        }

        async fn list_sessions(&self) -> Result<Vec<Value>, AgentError> {
            Ok(vec![])
        }

        async fn session_messages(&self, session_id: &str) -> Result<Vec<Value>, AgentError> {
            match session_id {
                "alive" => Ok(vec![
                    json!({ "id": "m1", "text": "hi" }),
                    json!({ "id": "m2", "text": "there", "completed": true }),
                ]),
                "gone" => Err(AgentError::Status(404)),
                other => Err(AgentError::Transport(format!("no such session {}", other))),
            }
        }

        async fn proxy(
            &self,
            _method: &str,
            _path: &str,
            _query: Option<&HttpQuery>,
            _body: Option<&Value>,
        ) -> Result<ProxyResponse, AgentError> {
            Ok(ProxyResponse {
                status: 200,
                body: Value::Null,
            })
        }
    }

    async fn backfill_manager() -> Arc<ProjectManager> {
        let mut config = DaemonConfig::default();
        config.skip_spawn = true;
        let manager = Arc::new(ProjectManager::with_client_factory(
            config,
            None,
            Arc::new(EventBus::new()),
            Box::new(|url| {
                Arc::new(BackfillAgent {
                    base_url: url.to_string(),
                })
            }),
        ));
        manager
            .start_project("api", Path::new("/work/api"))
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn test_backfill_queries_fresh() {
        let manager = backfill_manager().await;
        manager.register_session("alive", "api").unwrap();

        let frame =
            build_sync_response(&manager, &["alive".to_string()]).await;
        let Frame::SyncResponse { sessions } = frame else {
            panic!("expected sync_response");
        };

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "alive");
        assert_eq!(sessions[0].messages.len(), 2);
        assert_eq!(sessions[0].messages[0]["id"], "m1");
    }

    #[tokio::test]
    async fn test_missing_session_yields_empty_list() {
        let manager = backfill_manager().await;
        manager.register_session("gone", "api").unwrap();

        let frame = build_sync_response(
            &manager,
            &["alive".to_string(), "gone".to_string()],
        )
        .await;
        let Frame::SyncResponse { sessions } = frame else {
            panic!("expected sync_response");
        };

        // One entry per requested id, in request order; the vanished
        // session has an empty list, not an error
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, "alive");
        assert_eq!(sessions[1].id, "gone");
        assert!(sessions[1].messages.is_empty());
        assert_eq!(sessions[0].messages.len(), 2);
    }
}
