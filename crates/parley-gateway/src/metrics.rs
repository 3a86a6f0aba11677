//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use parley_agent::events::SessionEvent;
use parley_core::types::TurnState;

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

pub fn record_session_start() {
    metrics::gauge!("voice_sessions_active").increment(1.0);
}

pub fn record_session_end() {
    metrics::gauge!("voice_sessions_active").decrement(1.0);
}

/// Record an assistant turn starting.
pub fn record_turn() {
    metrics::counter!("voice_turns_total").increment(1);
}

pub fn record_interruption() {
    metrics::counter!("voice_interruptions_total").increment(1);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("voice_errors_total", &labels).increment(1);
}

pub fn record_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged {
            to: TurnState::AssistantGenerating,
            ..
        } => record_turn(),
        SessionEvent::Interrupted { .. } => record_interruption(),
        SessionEvent::Error { kind, .. } => record_error(kind),
        _ => {}
    }
}
