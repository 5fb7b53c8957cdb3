use crate::market::registry::ConnectionRegistry;
use crate::market::types::{ConnectionState, ConnectionStatusSnapshot};
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub connections: Vec<ConnectionStatusSnapshot>,
}

pub fn build_health_response(started_at: Instant, registry: &ConnectionRegistry) -> HealthResponse {
    let connections = registry.statuses();
    let status = if connections
        .iter()
        .any(|connection| connection.state == ConnectionState::Failed)
    {
        "degraded"
    } else {
        "ok"
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        connections,
    }
}

pub fn health(state: &AppState) -> HealthResponse {
    build_health_response(state.started_at, &state.registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::supervisor::ReconnectPolicy;
    use crate::market::transport::testing::ScriptedFactory;
    use crate::market::types::ConnectionKey;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn health_reports_ok_without_connections() {
        let response = build_health_response(Instant::now(), &ConnectionRegistry::new());

        assert_eq!(response.status, "ok");
        assert!(response.connections.is_empty());
        assert!(response.uptime_ms <= 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn health_is_degraded_once_a_key_fails() {
        let registry = ConnectionRegistry::new();
        let mut subscription = registry.open(
            ConnectionKey::alerts(),
            Arc::new(ScriptedFactory::new(Vec::new())),
            ReconnectPolicy::fixed(1, Duration::from_millis(100)),
            16,
        );
        while subscription.next_event().await.is_some() {}

        let response = build_health_response(Instant::now(), &registry);
        assert_eq!(response.status, "degraded");
        assert_eq!(response.connections.len(), 1);
        assert_eq!(response.connections[0].state, ConnectionState::Failed);
        assert_eq!(response.connections[0].attempt, 1);
    }
}
