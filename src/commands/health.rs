use crate::{error::AppError, state::AppState};
use crate::sync::types::ConnectionState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub connection: &'static str,
}

pub fn build_health_response(
    started_at: Instant,
    connection: Option<ConnectionState>,
) -> HealthResponse {
    let connection_status = match connection {
        None => "stopped",
        Some(state) => state.as_str(),
    };

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        connection: connection_status,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let connection = state
        .engine
        .lock()
        .await
        .as_ref()
        .map(|handle| handle.connection().state);
    Ok(build_health_response(state.started_at, connection))
}
