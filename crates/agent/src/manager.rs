//! Session directory: routes commands from the outer API to the right
//! agent, spawning the driving task on first use.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use helm_domain::error::{Error, Result};
use helm_domain::message::ContentBlock;
use helm_domain::model::Model;
use helm_domain::options::{AgentConfig, RequestOptions};
use helm_domain::queue::QueueLane;
use helm_providers::adapter::ProviderAdapter;
use helm_tools::ToolRegistry;

use crate::agent::SessionAgent;
use crate::events::AgentEvent;
use crate::state::{SessionId, SessionState};
use crate::store::SessionStore;

struct SessionHandle {
    agent: Arc<SessionAgent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keyed directory of active sessions.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    adapter: Arc<dyn ProviderAdapter>,
    registry: Arc<ToolRegistry>,
    model: Model,
    options: RequestOptions,
    config: AgentConfig,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        adapter: Arc<dyn ProviderAdapter>,
        registry: Arc<ToolRegistry>,
        model: Model,
        options: RequestOptions,
        config: AgentConfig,
    ) -> Self {
        Self {
            store,
            adapter,
            registry,
            model,
            options,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue into a session, loading and starting its agent when it
    /// is not yet running.
    pub async fn enqueue(
        &self,
        session: &str,
        payload: Vec<ContentBlock>,
        lane: QueueLane,
    ) -> Result<String> {
        let agent = self.ensure_running(session);
        agent.enqueue(payload, lane).await
    }

    /// Cancel a queued item in a running session.
    pub async fn cancel_item(&self, session: &str, item_id: &str, lane: QueueLane) -> Result<()> {
        let agent = self
            .get(session)
            .ok_or_else(|| Error::Unsupported(format!("session {session} is not running")))?;
        agent.cancel_item(item_id, lane).await
    }

    /// Snapshot + event stream for a session, starting it when needed.
    pub async fn observe(
        &self,
        session: &str,
    ) -> (SessionState, tokio::sync::broadcast::Receiver<AgentEvent>) {
        let agent = self.ensure_running(session);
        agent.observe().await
    }

    pub fn is_running(&self, session: &str) -> bool {
        self.sessions
            .lock()
            .get(session)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Stop a session: cancel its driving task and wait for the loop to
    /// flush its final `agentEnd`.
    pub async fn stop(&self, session: &str) -> Result<()> {
        let handle = self
            .sessions
            .lock()
            .remove(session)
            .ok_or_else(|| Error::Unsupported(format!("session {session} is not running")))?;
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::warn!(session = %session, error = %e, "driving task ended abnormally");
        }
        Ok(())
    }

    /// Stop every running session.
    pub async fn shutdown(&self) {
        let handles: Vec<(SessionId, SessionHandle)> =
            self.sessions.lock().drain().collect();
        for (session, handle) in handles {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                tracing::warn!(session = %session, error = %e, "driving task ended abnormally");
            }
        }
    }

    fn get(&self, session: &str) -> Option<Arc<SessionAgent>> {
        self.sessions.lock().get(session).map(|h| h.agent.clone())
    }

    fn ensure_running(&self, session: &str) -> Arc<SessionAgent> {
        let mut sessions = self.sessions.lock();
        if let Some(handle) = sessions.get(session) {
            if !handle.task.is_finished() {
                return handle.agent.clone();
            }
            sessions.remove(session);
        }

        let agent = SessionAgent::new(
            session,
            self.model.clone(),
            self.adapter.clone(),
            self.store.clone(),
            self.registry.clone(),
            self.options.clone(),
            self.config.clone(),
        );
        let cancel = agent.cancellation();
        let task = tokio::spawn({
            let agent = agent.clone();
            let session = session.to_string();
            async move {
                if let Err(e) = agent.start().await {
                    tracing::error!(session = %session, error = %e, "agent start failed");
                }
            }
        });
        sessions.insert(
            session.to_string(),
            SessionHandle {
                agent: agent.clone(),
                cancel,
                task,
            },
        );
        agent
    }
}
