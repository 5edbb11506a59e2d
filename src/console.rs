use crate::commands::engine::{
    engine_status, send_command, send_raw_command, set_engine_credential, CommandReceipt,
};
use crate::error::AppError;
use crate::state::AppState;
use crate::sync::activity::{ActivityLog, ActivityTone};
use crate::sync::engine::EngineHandle;
use crate::sync::merge::system_or_unknown;
use crate::sync::protocol::Command;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// One line of operator input.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorInput {
    Typed(Command),
    Raw {
        kind: String,
        payload: Option<Map<String, Value>>,
    },
    Status,
    ClearActivity,
    Credential(Option<String>),
}

/// Activity entries shown by `status`.
const RECENT_ACTIVITY_SHOWN: usize = 5;

pub type SharedActivityLog = Arc<Mutex<ActivityLog>>;

/// Accepts a JSON command object, a bare command kind (`PAUSE`), `status`,
/// `clear`, or `token [value]`. Returns `Ok(None)` for blank lines.
pub fn parse_operator_line(line: &str) -> Result<Option<OperatorInput>, AppError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    if line.starts_with('{') {
        let value: Value = serde_json::from_str(line)?;
        if let Ok(command) = serde_json::from_value::<Command>(value.clone()) {
            return Ok(Some(OperatorInput::Typed(command)));
        }

        let Value::Object(mut payload) = value else {
            return Err(AppError::InvalidArgument(
                "command must be a JSON object".to_string(),
            ));
        };
        let kind = match payload.remove("type") {
            Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
            _ => {
                return Err(AppError::InvalidArgument(
                    "command object needs a string \"type\"".to_string(),
                ))
            }
        };
        let payload = (!payload.is_empty()).then_some(payload);
        return Ok(Some(OperatorInput::Raw { kind, payload }));
    }

    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default();
    match head.to_ascii_lowercase().as_str() {
        "status" => Ok(Some(OperatorInput::Status)),
        "clear" => Ok(Some(OperatorInput::ClearActivity)),
        "token" => Ok(Some(OperatorInput::Credential(
            words.next().map(str::to_string),
        ))),
        _ => parse_bare_command(head, words.collect()).map(Some),
    }
}

/// Field names a single trailing word may fill, tried in order.
const ARGUMENT_FIELDS: [&str; 3] = ["symbol", "path", "days"];

fn parse_bare_command(head: &str, arguments: Vec<&str>) -> Result<OperatorInput, AppError> {
    let kind = head.to_ascii_uppercase();
    let json_hint = || format!("use the JSON form, e.g. {{\"type\":\"{kind}\",...}}");

    let parsed = match arguments.as_slice() {
        [] => serde_json::from_value::<Command>(json!({ "type": kind })).ok(),
        [argument] => ARGUMENT_FIELDS
            .iter()
            .find_map(|field| command_with_argument(&kind, field, argument)),
        _ => {
            return Err(AppError::InvalidArgument(format!(
                "{kind} takes at most one argument; {}",
                json_hint()
            )))
        }
    };

    if let Some(command) = parsed {
        return Ok(OperatorInput::Typed(command));
    }

    if !arguments.is_empty() {
        return Err(AppError::InvalidArgument(format!(
            "{kind} does not accept '{}'; {}",
            arguments.join(" "),
            json_hint()
        )));
    }
    if Command::is_known_kind(&kind) {
        return Err(AppError::InvalidArgument(format!(
            "{kind} needs arguments; {}",
            json_hint()
        )));
    }

    Ok(OperatorInput::Raw {
        kind,
        payload: None,
    })
}

/// Only accepts the command when `field` is one it actually carries.
fn command_with_argument(kind: &str, field: &str, argument: &str) -> Option<Command> {
    let value = match (field, argument.parse::<u64>()) {
        ("days", Ok(days)) => json!(days),
        _ => json!(argument),
    };
    let mut frame = Map::new();
    frame.insert("type".to_string(), json!(kind));
    frame.insert(field.to_string(), value);

    let command = serde_json::from_value::<Command>(Value::Object(frame)).ok()?;
    let carried = serde_json::to_value(&command)
        .ok()
        .is_some_and(|encoded| encoded.get(field).is_some());
    carried.then_some(command)
}

pub async fn read_operator_commands(
    state: &AppState,
    activity: Option<&SharedActivityLog>,
) -> Result<(), AppError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let input = match parse_operator_line(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(error) => {
                log::warn!("ignoring operator input: {error}");
                continue;
            }
        };

        match input {
            OperatorInput::Typed(command) => {
                log_receipt(send_command(state, &command).await?);
            }
            OperatorInput::Raw { kind, payload } => {
                log::warn!("sending unrecognized command kind {kind} as-is");
                log_receipt(send_raw_command(state, &kind, payload).await?);
            }
            OperatorInput::Credential(credential) => {
                let cleared = credential.is_none();
                if set_engine_credential(state, credential).await? {
                    if cleared {
                        log::info!("credential cleared, applies from the next connection");
                    } else {
                        log::info!("credential replaced, applies from the next connection");
                    }
                }
            }
            OperatorInput::Status => {
                let status = engine_status(state).await?;
                let system = system_or_unknown(&status.state);
                log::info!(
                    "connection {} (attempt {}), {} symbols, {} models, balance {}, equity {}, status {}",
                    status.connection.state.as_str(),
                    status.connection.attempt,
                    status.state.symbols.len(),
                    status.state.available_models.len(),
                    format_metric(system.balance),
                    format_metric(system.equity),
                    system.status.as_deref().unwrap_or("UNKNOWN")
                );
                if system.status.is_some() && !system.is_running() {
                    log::warn!("peer is not trading");
                }
                if status.running && !status.accepting_commands {
                    log::info!("commands are dropped until the connection is active");
                }
                if let Some(error) = &status.connection.error {
                    log::info!("last connection error: {}", error.message());
                }
                if let Some(activity) = activity {
                    let activity = activity.lock();
                    log::info!("{} activity entries", activity.len());
                    let skip = activity.len().saturating_sub(RECENT_ACTIVITY_SHOWN);
                    for entry in activity.entries().skip(skip) {
                        log::info!("  [{:?}] {}", entry.kind, entry.message);
                    }
                }
            }
            OperatorInput::ClearActivity => {
                if let Some(activity) = activity {
                    activity.lock().clear();
                    log::info!("activity log cleared");
                }
            }
        }
    }

    log::info!("operator input closed");
    Ok(())
}

fn log_receipt(receipt: CommandReceipt) {
    if receipt.delivered {
        log::info!("sent {}", receipt.kind);
    } else {
        log::warn!("{} dropped: not connected", receipt.kind);
    }
}

fn format_metric(value: Option<f64>) -> String {
    value
        .map(|value| format!("{value:.2}"))
        .unwrap_or_else(|| "-".to_string())
}

/// Background log writers for one engine.
pub struct Watchers {
    connection: JoinHandle<()>,
    activity: JoinHandle<()>,
    activity_log: SharedActivityLog,
}

impl Watchers {
    pub fn activity_log(&self) -> &SharedActivityLog {
        &self.activity_log
    }

    pub fn abort(self) {
        self.connection.abort();
        self.activity.abort();
    }
}

pub fn spawn_watchers(handle: &EngineHandle) -> Watchers {
    let mut connection_rx = handle.store().subscribe_connection();
    let connection = tokio::spawn(async move {
        while connection_rx.changed().await.is_ok() {
            let status = connection_rx.borrow_and_update().clone();
            match &status.error {
                Some(error) if error.is_persistent() => log::error!(
                    "status {}: {}",
                    status.state.as_str(),
                    error.message()
                ),
                _ => log::debug!("status {}", status.state.as_str()),
            }
        }
    });

    let activity_log: SharedActivityLog = Arc::new(Mutex::new(ActivityLog::new()));
    let mut messages = handle.store().subscribe_messages();
    let task_log = Arc::clone(&activity_log);
    let activity = tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(raw) => {
                    let mut log = task_log.lock();
                    if let Some(entry) = log.observe(&raw) {
                        let tag = match entry.tone {
                            ActivityTone::Positive => "+",
                            ActivityTone::Negative => "-",
                            ActivityTone::Neutral | ActivityTone::Notice => " ",
                        };
                        log::info!("[{:?}]{tag} {}", entry.kind, entry.message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("activity log skipped {skipped} messages");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    Watchers {
        connection,
        activity,
        activity_log,
    }
}
