use crate::sync::protocol::{FULL_STATE_TYPE, RESPONSE_TYPE, TICK_TYPE};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACTIVITY_LOG_CAPACITY: usize = 50;

const TRADE_TYPE: &str = "trade";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityKind {
    Trade,
    #[serde(rename = "CMD")]
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityTone {
    Positive,
    Negative,
    Neutral,
    Notice,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub recorded_at_ms: i64,
    pub kind: ActivityKind,
    pub message: String,
    pub tone: ActivityTone,
}

/// Rolling log of ephemeral peer events that the aggregate state drops.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry recorded for `message`, if any.
    pub fn observe(&mut self, message: &Value) -> Option<&ActivityEntry> {
        let entry = describe(message)?;
        if self.entries.len() == ACTIVITY_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.entries.back()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn describe(message: &Value) -> Option<ActivityEntry> {
    let kind = message.get("type").and_then(Value::as_str);
    let data = message.get("data");

    if matches!(kind, Some(TICK_TYPE) | Some(FULL_STATE_TYPE))
        && data.and_then(|data| data.get("event")).is_none()
    {
        return None;
    }

    match kind {
        Some(TRADE_TYPE) => data.map(describe_trade),
        Some(RESPONSE_TYPE) => Some(describe_response(message)),
        _ => None,
    }
}

fn describe_trade(data: &Value) -> ActivityEntry {
    let action = display_field(data, "action");
    let symbol = display_field(data, "symbol");
    let size = display_field(data, "size");
    let pnl = data.get("pnl").and_then(Value::as_f64);

    let mut text = format!("{action} {symbol} ({size} lots)");
    if let Some(pnl) = pnl.filter(|pnl| *pnl != 0.0) {
        text.push_str(&format!(" PnL: ${pnl:.2}"));
    }

    let tone = match pnl {
        Some(pnl) if pnl > 0.0 => ActivityTone::Positive,
        Some(pnl) if pnl < 0.0 => ActivityTone::Negative,
        _ => ActivityTone::Neutral,
    };

    ActivityEntry {
        recorded_at_ms: now_unix_ms(),
        kind: ActivityKind::Trade,
        message: text,
        tone,
    }
}

fn describe_response(message: &Value) -> ActivityEntry {
    let cmd = display_field(message, "cmd");
    let detail = message
        .get("message")
        .filter(|value| is_truthy(value))
        .or_else(|| message.get("status"))
        .map(display_value)
        .unwrap_or_default();

    ActivityEntry {
        recorded_at_ms: now_unix_ms(),
        kind: ActivityKind::Command,
        message: format!("{cmd}: {detail}"),
        tone: ActivityTone::Notice,
    }
}

fn display_field(source: &Value, key: &str) -> String {
    source.get(key).map(display_value).unwrap_or_default()
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
