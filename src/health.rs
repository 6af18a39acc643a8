//! Composite gateway health.

use serde::Serialize;

use crate::rest::CircuitState;

/// Overall health, composed from auth × websocket × cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum HealthStatus {
    /// Authenticated, streaming, caches writable, circuit closed.
    Up,
    /// Authenticated but something supporting is impaired.
    Degraded,
    /// Not authenticated; nothing useful can run.
    Down,
}

/// Point-in-time health report for the monitoring surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Composite status.
    pub status: HealthStatus,
    /// Whether a broker session is installed and validated.
    pub authenticated: bool,
    /// Whether the market-data socket is up; `None` when disabled.
    pub websocket_connected: Option<bool>,
    /// Whether the cache tiers are accepting writes.
    pub cache_healthy: bool,
    /// Current circuit-breaker state.
    #[serde(serialize_with = "serialize_circuit")]
    pub circuit: CircuitState,
}

fn serialize_circuit<S: serde::Serializer>(
    state: &CircuitState,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&state.to_string())
}

impl HealthReport {
    /// Compose the status from its parts.
    #[must_use]
    pub fn compose(
        authenticated: bool,
        websocket_connected: Option<bool>,
        cache_healthy: bool,
        circuit: CircuitState,
    ) -> Self {
        let status = if !authenticated {
            HealthStatus::Down
        } else if websocket_connected == Some(false)
            || !cache_healthy
            || circuit != CircuitState::Closed
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Up
        };
        Self {
            status,
            authenticated,
            websocket_connected,
            cache_healthy,
            circuit,
        }
    }
}
