//! Health and resilience state handlers.

use serde::Serialize;
use stowage::StorageFacade;
use stowage::models::HealthStatus;
use stowage::resilience::{CircuitSnapshot, MonitorMetrics};

use super::{CommandResult, print_json};

#[derive(Serialize)]
struct StatusReport {
    backend: &'static str,
    local_only: bool,
    circuit: CircuitSnapshot,
    monitor: MonitorMetrics,
}

/// Health command. Fails when the primary backend is unhealthy.
pub async fn cmd_health(storage: &StorageFacade) -> CommandResult {
    let report = storage.check_health().await;
    print_json(&report)?;
    if report.status == HealthStatus::Unhealthy {
        return Err(format!(
            "{} backend is unhealthy: {}",
            report.backend,
            report.error.as_deref().unwrap_or("unknown error")
        )
        .into());
    }
    Ok(())
}

/// Status command. Probes once, then prints breaker and monitor state.
pub async fn cmd_status(storage: &StorageFacade) -> CommandResult {
    storage.check_health().await;
    print_json(&StatusReport {
        backend: storage.primary_backend(),
        local_only: storage.is_local_only(),
        circuit: storage.circuit_state(),
        monitor: storage.monitor_metrics(),
    })
}
