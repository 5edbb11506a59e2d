use crate::error::AppError;
use crate::sync::model::{lenient_count, Position, SymbolState, SymbolStatus, SystemState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const AUTHENTICATED_STATUS: &str = "authenticated";
pub const INVALID_TOKEN_ERROR: &str = "Invalid token";
pub const FULL_STATE_TYPE: &str = "full_state";
pub const SYMBOL_UPDATE_TYPE: &str = "symbol_update";
pub const TICK_TYPE: &str = "tick";
pub const RESPONSE_TYPE: &str = "response";
pub const MODEL_LOADED_EVENT: &str = "MODEL_LOADED";
pub const MODEL_UNLOADED_EVENT: &str = "MODEL_UNLOADED";
pub const GET_ANALYTICS_CMD: &str = "GET_ANALYTICS";

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPayload {
    pub system: Option<SystemState>,
    pub symbols: BTreeMap<String, SymbolState>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickPayload {
    pub system: Option<SystemState>,
    pub positions: Option<BTreeMap<String, Position>>,
    pub symbol_updates: Option<BTreeMap<String, SymbolState>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelLoadedPayload {
    pub symbol: String,
    #[serde(default)]
    pub timeframe: Option<String>,
    #[serde(default)]
    pub status: Option<SymbolStatus>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub n_states: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub available_models: Option<Vec<String>>,
    #[serde(default)]
    pub analytics: Option<Value>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl CommandResponse {
    pub fn is_analytics(&self) -> bool {
        self.cmd.as_deref() == Some(GET_ANALYTICS_CMD) || self.analytics.is_some()
    }
}

/// Closed set of inbound message kinds, produced once per decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    AuthAccepted,
    AuthRejected,
    Snapshot(SnapshotPayload),
    SymbolUpdate { symbol: String, patch: SymbolState },
    Tick(TickPayload),
    ModelLoaded(ModelLoadedPayload),
    ModelUnloaded { symbol: String },
    CommandResponse(CommandResponse),
    Analytics(Value),
    Unrecognized,
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthAccepted => "auth_accepted",
            Self::AuthRejected => "auth_rejected",
            Self::Snapshot(_) => "snapshot",
            Self::SymbolUpdate { .. } => "symbol_update",
            Self::Tick(_) => "tick",
            Self::ModelLoaded(_) => "model_loaded",
            Self::ModelUnloaded { .. } => "model_unloaded",
            Self::CommandResponse(_) => "command_response",
            Self::Analytics(_) => "analytics",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// Decodes one transport frame into a JSON object. Anything that is not a JSON
/// object is rejected.
pub fn decode_frame(payload: &mut [u8]) -> Result<Value, AppError> {
    let value: Value = simd_json::serde::from_slice(payload)?;
    if !value.is_object() {
        return Err(AppError::Decode(format!(
            "expected a JSON object, found {}",
            json_kind(&value)
        )));
    }
    Ok(value)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn str_field<'a>(message: &'a Value, key: &str) -> Option<&'a str> {
    message.get(key).and_then(Value::as_str)
}

fn parse_section<T>(message: &Value, section: &str) -> Option<T>
where
    T: serde::de::DeserializeOwned,
{
    let payload = message.get(section)?;
    match serde_json::from_value::<T>(payload.clone()) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            log::warn!("malformed '{section}' section in inbound message: {error}");
            None
        }
    }
}

/// Decodes one optional record of a payload. A record that does not fit its
/// type is logged and treated as absent.
fn parse_record<T>(data: &Map<String, Value>, section: &str) -> Option<T>
where
    T: serde::de::DeserializeOwned,
{
    match data.get(section) {
        None | Some(Value::Null) => None,
        Some(record) => match serde_json::from_value::<T>(record.clone()) {
            Ok(parsed) => Some(parsed),
            Err(error) => {
                log::warn!("skipping malformed '{section}' record: {error}");
                None
            }
        },
    }
}

/// Decodes a per-symbol section entry by entry, skipping only the entries
/// that do not fit. `None` when the section is absent or not an object.
fn parse_symbol_map<T>(data: &Map<String, Value>, section: &str) -> Option<BTreeMap<String, T>>
where
    T: serde::de::DeserializeOwned,
{
    let entries = match data.get(section) {
        None | Some(Value::Null) => return None,
        Some(Value::Object(entries)) => entries,
        Some(_) => {
            log::warn!("skipping '{section}' section that is not an object");
            return None;
        }
    };

    let mut parsed = BTreeMap::new();
    for (symbol, entry) in entries {
        match serde_json::from_value::<T>(entry.clone()) {
            Ok(value) => {
                parsed.insert(symbol.clone(), value);
            }
            Err(error) => log::warn!("skipping malformed '{section}' entry for {symbol}: {error}"),
        }
    }
    Some(parsed)
}

fn parse_snapshot(message: &Value) -> Option<SnapshotPayload> {
    let data = message.get("data")?.as_object()?;
    Some(SnapshotPayload {
        system: parse_record(data, "system"),
        symbols: parse_symbol_map(data, "symbols").unwrap_or_default(),
    })
}

fn parse_symbol_update(message: &Value) -> Option<InboundMessage> {
    let symbol = str_field(message, "symbol")?.to_string();
    let data = message.get("data").filter(|data| data.is_object())?;
    let patch = match serde_json::from_value::<SymbolState>(data.clone()) {
        Ok(patch) => patch,
        Err(error) => {
            log::warn!("malformed symbol update for {symbol}: {error}");
            return None;
        }
    };
    Some(InboundMessage::SymbolUpdate { symbol, patch })
}

fn parse_tick(message: &Value) -> Option<TickPayload> {
    let data = match message.get("data") {
        None | Some(Value::Null) => return Some(TickPayload::default()),
        Some(data) => data.as_object()?,
    };
    Some(TickPayload {
        system: parse_record(data, "system"),
        positions: parse_symbol_map(data, "positions"),
        symbol_updates: parse_symbol_map(data, "symbol_updates"),
    })
}

fn parse_model_unloaded(message: &Value) -> Option<InboundMessage> {
    let symbol = message.get("data").and_then(|data| str_field(data, "symbol"))?;
    Some(InboundMessage::ModelUnloaded {
        symbol: symbol.to_string(),
    })
}

fn malformed(kind: &str) -> InboundMessage {
    log::warn!("dropping malformed '{kind}' message");
    InboundMessage::Unrecognized
}

/// Classifies a decoded message. The first matching rule wins; payloads may
/// satisfy more than one loose shape check, so the order is significant.
pub fn classify(message: &Value) -> InboundMessage {
    if str_field(message, "status") == Some(AUTHENTICATED_STATUS) {
        return InboundMessage::AuthAccepted;
    }
    if str_field(message, "error") == Some(INVALID_TOKEN_ERROR) {
        return InboundMessage::AuthRejected;
    }

    match str_field(message, "type") {
        Some(FULL_STATE_TYPE) => {
            return match parse_snapshot(message) {
                Some(snapshot) => InboundMessage::Snapshot(snapshot),
                None => malformed(FULL_STATE_TYPE),
            };
        }
        Some(SYMBOL_UPDATE_TYPE) => {
            return parse_symbol_update(message).unwrap_or_else(|| malformed(SYMBOL_UPDATE_TYPE));
        }
        Some(TICK_TYPE) => {
            return match parse_tick(message) {
                Some(tick) => InboundMessage::Tick(tick),
                None => malformed(TICK_TYPE),
            };
        }
        _ => {}
    }

    match str_field(message, "event") {
        Some(MODEL_LOADED_EVENT) => {
            return match parse_section::<ModelLoadedPayload>(message, "data") {
                Some(payload) => InboundMessage::ModelLoaded(payload),
                None => malformed(MODEL_LOADED_EVENT),
            };
        }
        Some(MODEL_UNLOADED_EVENT) => {
            return parse_model_unloaded(message).unwrap_or_else(|| malformed(MODEL_UNLOADED_EVENT));
        }
        _ => {}
    }

    if str_field(message, "type") == Some(RESPONSE_TYPE) || message.get("cmd").is_some() {
        return match serde_json::from_value::<CommandResponse>(message.clone()) {
            Ok(response) => InboundMessage::CommandResponse(response),
            Err(_) => malformed(RESPONSE_TYPE),
        };
    }

    match message.get("analytics") {
        Some(analytics) if !analytics.is_null() => InboundMessage::Analytics(analytics.clone()),
        _ => InboundMessage::Unrecognized,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    pub lot_multiplier: f64,
    #[serde(default)]
    pub sl_max_pips: Option<f64>,
}

/// Operator commands understood by the peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    GetState,
    GetConfig,
    SetConfig { config: Value },
    GetSymbolConfig { symbol: String },
    SetSymbolConfig { symbol: String, config: SymbolConfig },
    GetAnalytics { days: u32 },
    GetAvailableModels,
    LoadModel { path: String },
    ReloadAllModels,
    ReloadModel { symbol: String },
    Pause,
    Resume,
    CloseAll,
    ClosePosition { symbol: String },
    EmergencyStop,
    BlockSymbol { symbol: String },
    UnblockSymbol { symbol: String },
    ForceNormal { symbol: String },
}

impl Command {
    /// Wire tags of every command, in declaration order.
    pub const KINDS: [&'static str; 18] = [
        "GET_STATE",
        "GET_CONFIG",
        "SET_CONFIG",
        "GET_SYMBOL_CONFIG",
        "SET_SYMBOL_CONFIG",
        "GET_ANALYTICS",
        "GET_AVAILABLE_MODELS",
        "LOAD_MODEL",
        "RELOAD_ALL_MODELS",
        "RELOAD_MODEL",
        "PAUSE",
        "RESUME",
        "CLOSE_ALL",
        "CLOSE_POSITION",
        "EMERGENCY_STOP",
        "BLOCK_SYMBOL",
        "UNBLOCK_SYMBOL",
        "FORCE_NORMAL",
    ];

    pub fn is_known_kind(kind: &str) -> bool {
        Self::KINDS.contains(&kind)
    }

    pub fn to_frame(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Builds the `{ "type": kind, ...payload }` envelope. `kind` always wins over
/// a `type` key inside the payload.
pub fn command_envelope(kind: &str, payload: Option<Map<String, Value>>) -> Value {
    let mut envelope = payload.unwrap_or_default();
    envelope.insert("type".to_string(), Value::String(kind.to_string()));
    Value::Object(envelope)
}

pub fn credential_frame(credential: &str) -> String {
    let mut frame = Map::new();
    frame.insert("token".to_string(), Value::String(credential.to_string()));
    Value::Object(frame).to_string()
}
