//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use parley_agent::events::SessionEvent;
use parley_agent::session::VoiceAssistant;
use parley_core::config::Config;
use parley_core::types::TurnState;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub assistant: VoiceAssistant,
    pub sessions: RwLock<HashMap<String, SessionEntry>>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// A live voice session as reported by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub state: TurnState,
    pub turns: u64,
    pub interruptions: u64,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, assistant: VoiceAssistant) -> Self {
        Self {
            config,
            assistant,
            sessions: RwLock::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn max_sessions(&self) -> usize {
        self.config.gateway.as_ref().map(|g| g.max_sessions).unwrap_or(16)
    }

    pub async fn register(&self, session_id: &str) {
        let entry = SessionEntry {
            session_id: session_id.to_string(),
            connected_at: Utc::now(),
            state: TurnState::Idle,
            turns: 0,
            interruptions: 0,
        };
        self.sessions.write().await.insert(session_id.to_string(), entry);
        #[cfg(feature = "metrics")]
        crate::metrics::record_session_start();
    }

    pub async fn unregister(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            #[cfg(feature = "metrics")]
            crate::metrics::record_session_end();
        }
    }

    /// Fold a session event into the session's entry (and metrics).
    pub async fn observe(&self, session_id: &str, event: &SessionEvent) {
        #[cfg(feature = "metrics")]
        crate::metrics::record_event(event);

        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(session_id) else {
            return;
        };
        match event {
            SessionEvent::StateChanged { to, .. } => {
                entry.state = *to;
                if *to == TurnState::AssistantGenerating {
                    entry.turns += 1;
                }
            }
            SessionEvent::Interrupted { .. } => entry.interruptions += 1,
            _ => {}
        }
    }

    pub async fn snapshot(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<_> = self.sessions.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.connected_at);
        entries
    }
}
