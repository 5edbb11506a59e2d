use crate::error::AppError;
use crate::state::AppState;
use crate::sync::engine::EngineHandle;
use crate::sync::model::DashboardState;
use crate::sync::protocol::Command;
use crate::sync::types::{ConnectionStatus, EngineArgs, EngineSession, EngineStopResult};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusSnapshot {
    pub running: bool,
    pub accepting_commands: bool,
    pub connection: ConnectionStatus,
    pub state: DashboardState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReceipt {
    pub kind: String,
    pub delivered: bool,
}

/// Starts a fresh engine, tearing down any engine that is already running.
pub async fn start_engine(
    state: &AppState,
    args: Option<EngineArgs>,
) -> Result<EngineSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut engine_slot = state.engine.lock().await;
        engine_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.shutdown().await;
    }

    let session = EngineSession::from_config(&config);
    let handle = EngineHandle::start(config);

    {
        let mut engine_slot = state.engine.lock().await;
        *engine_slot = Some(handle);
    }

    Ok(session)
}

pub async fn stop_engine(state: &AppState) -> Result<EngineStopResult, AppError> {
    let existing_handle = {
        let mut engine_slot = state.engine.lock().await;
        engine_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.shutdown().await;
        true
    } else {
        false
    };

    Ok(EngineStopResult { stopped })
}

pub async fn engine_status(state: &AppState) -> Result<EngineStatusSnapshot, AppError> {
    let engine_slot = state.engine.lock().await;
    let snapshot = match engine_slot.as_ref() {
        Some(handle) => EngineStatusSnapshot {
            running: true,
            accepting_commands: handle.dispatcher().is_active(),
            connection: handle.connection(),
            state: handle.store().snapshot(),
        },
        None => EngineStatusSnapshot {
            running: false,
            accepting_commands: false,
            connection: ConnectionStatus::idle(),
            state: DashboardState::default(),
        },
    };
    Ok(snapshot)
}

/// Fire-and-forget. `delivered` is false when no engine runs or the
/// connection is not active; nothing is queued either way.
pub async fn send_command(state: &AppState, command: &Command) -> Result<CommandReceipt, AppError> {
    let frame = serde_json::to_value(command)?;
    let kind = frame
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let engine_slot = state.engine.lock().await;
    let delivered = engine_slot
        .as_ref()
        .is_some_and(|handle| handle.dispatch(command));

    Ok(CommandReceipt { kind, delivered })
}

pub async fn send_raw_command(
    state: &AppState,
    kind: &str,
    payload: Option<Map<String, Value>>,
) -> Result<CommandReceipt, AppError> {
    let kind = kind.trim();
    if kind.is_empty() {
        return Err(AppError::InvalidArgument(
            "command kind must not be empty".to_string(),
        ));
    }

    let engine_slot = state.engine.lock().await;
    let delivered = engine_slot
        .as_ref()
        .is_some_and(|handle| handle.send(kind, payload));

    Ok(CommandReceipt {
        kind: kind.to_string(),
        delivered,
    })
}

pub async fn set_engine_credential(
    state: &AppState,
    credential: Option<String>,
) -> Result<bool, AppError> {
    let engine_slot = state.engine.lock().await;
    match engine_slot.as_ref() {
        Some(handle) => {
            handle.set_credential(credential);
            Ok(true)
        }
        None => Ok(false),
    }
}
