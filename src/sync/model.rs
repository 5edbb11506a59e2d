//! Aggregate dashboard state as mirrored from the trading peer.
//!
//! Every record keeps unrecognized wire fields in `extra` so consumers can
//! read them opaquely. Scalars are `Option`: absence means "unknown", and a
//! patch only overwrites the fields it actually carries.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

pub const PLACEHOLDER_HMM_STATE: &str = "-";
pub const PLACEHOLDER_ACTION: &str = "WAIT";

fn integral_count(number: &Number) -> Option<u64> {
    number.as_u64().or_else(|| {
        number
            .as_f64()
            .filter(|value| value.fract() == 0.0 && *value >= 0.0 && *value <= u64::MAX as f64)
            .map(|value| value as u64)
    })
}

/// Counts computed upstream sometimes arrive as integral floats (`12.0`).
pub(crate) fn lenient_count<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let Some(value) = Option::<Value>::deserialize(deserializer)?.filter(|value| !value.is_null())
    else {
        return Ok(None);
    };
    value
        .as_number()
        .and_then(integral_count)
        .and_then(|count| T::try_from(count).ok())
        .map(Some)
        .ok_or_else(|| {
            D::Error::custom(format!("expected a non-negative integer count, found {value}"))
        })
}

fn patched_extra(base: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equity: Option<f64>,
    #[serde(rename = "dd_pct", default, skip_serializing_if = "Option::is_none")]
    pub drawdown_pct: Option<f64>,
    #[serde(rename = "max_dd_pct", default, skip_serializing_if = "Option::is_none")]
    pub max_drawdown_pct: Option<f64>,
    #[serde(rename = "pnl", default, skip_serializing_if = "Option::is_none")]
    pub total_pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SystemState {
    pub fn patched(&self, patch: &SystemState) -> SystemState {
        SystemState {
            balance: patch.balance.or(self.balance),
            equity: patch.equity.or(self.equity),
            drawdown_pct: patch.drawdown_pct.or(self.drawdown_pct),
            max_drawdown_pct: patch.max_drawdown_pct.or(self.max_drawdown_pct),
            total_pnl: patch.total_pnl.or(self.total_pnl),
            status: patch.status.clone().or_else(|| self.status.clone()),
            extra: patched_extra(&self.extra, &patch.extra),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.as_deref() == Some("RUNNING")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolStatus {
    Normal,
    Warmup,
    Blocked,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
    #[serde(rename = "")]
    #[serde(other)]
    Flat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl_pips: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_price: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Position {
    pub fn flat() -> Self {
        Self {
            direction: Some(Direction::Flat),
            size: Some(0.0),
            pnl: Some(0.0),
            pnl_pips: Some(0.0),
            open_price: Some(0.0),
            extra: Map::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.size, Some(size) if size != 0.0)
    }

    pub fn patched(&self, patch: &Position) -> Position {
        Position {
            direction: patch.direction.or(self.direction),
            size: patch.size.or(self.size),
            pnl: patch.pnl.or(self.pnl),
            pnl_pips: patch.pnl_pips.or(self.pnl_pips),
            open_price: patch.open_price.or(self.open_price),
            extra: patched_extra(&self.extra, &patch.extra),
        }
    }
}

/// Model state label; the peer sends either a numeric index or a text token.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum HmmLabel {
    Index(i64),
    Label(String),
}

impl<'de> Deserialize<'de> for HmmLabel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Number(number) => match number.as_i64() {
                Some(index) => Ok(HmmLabel::Index(index)),
                None => match number.as_f64() {
                    Some(value)
                        if value.fract() == 0.0
                            && value >= i64::MIN as f64
                            && value <= i64::MAX as f64 =>
                    {
                        Ok(HmmLabel::Index(value as i64))
                    }
                    _ => Ok(HmmLabel::Label(number.to_string())),
                },
            },
            Value::String(label) => Ok(HmmLabel::Label(label)),
            other => Err(D::Error::custom(format!(
                "expected a state index or label, found {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Prediction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmm_state: Option<HmmLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Prediction {
    pub fn placeholder() -> Self {
        Self {
            hmm_state: Some(HmmLabel::Label(PLACEHOLDER_HMM_STATE.to_string())),
            action: Some(PLACEHOLDER_ACTION.to_string()),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Stats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_rate: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub trades: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Stats {
    pub fn zeroed() -> Self {
        Self {
            win_rate: Some(0.0),
            trades: Some(0),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SymbolState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SymbolStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub n_states: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Prediction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SymbolState {
    /// Fresh entry for a symbol whose model was just loaded.
    pub fn loaded(
        status: Option<SymbolStatus>,
        timeframe: Option<String>,
        n_states: Option<u32>,
        default_timeframe: &str,
    ) -> Self {
        Self {
            status: Some(status.unwrap_or(SymbolStatus::Warmup)),
            timeframe: Some(timeframe.unwrap_or_else(|| default_timeframe.to_string())),
            n_states,
            position: Some(Position::flat()),
            prediction: Some(Prediction::placeholder()),
            stats: Some(Stats::zeroed()),
            extra: Map::new(),
        }
    }

    /// Shallow merge: sub-records present in the patch replace the current ones.
    pub fn patched(&self, patch: &SymbolState) -> SymbolState {
        SymbolState {
            status: patch.status.or(self.status),
            timeframe: patch.timeframe.clone().or_else(|| self.timeframe.clone()),
            n_states: patch.n_states.or(self.n_states),
            position: patch.position.clone().or_else(|| self.position.clone()),
            prediction: patch.prediction.clone().or_else(|| self.prediction.clone()),
            stats: patch.stats.clone().or_else(|| self.stats.clone()),
            extra: patched_extra(&self.extra, &patch.extra),
        }
    }

    pub fn has_open_position(&self) -> bool {
        self.position.as_ref().is_some_and(Position::is_open)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AnalyticsReport {
    #[serde(
        default,
        deserialize_with = "lenient_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub period_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlights: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_stats: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_stats: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday_stats: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equity_curve: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction_stats: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmm_stats: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmm_stats_by_symbol: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalyticsData {
    Error { message: String },
    Empty { period_days: Option<u32> },
    Populated(AnalyticsReport),
}

impl AnalyticsData {
    pub fn from_payload(payload: &Value) -> AnalyticsData {
        if let Some(error) = payload.get("error").filter(|value| !value.is_null()) {
            return AnalyticsData::Error {
                message: value_to_message(error),
            };
        }

        if payload.get("empty").and_then(Value::as_bool) == Some(true) {
            return AnalyticsData::Empty {
                period_days: payload
                    .get("period_days")
                    .and_then(Value::as_number)
                    .and_then(integral_count)
                    .map(|days| days.min(u32::MAX as u64) as u32),
            };
        }

        match serde_json::from_value::<AnalyticsReport>(payload.clone()) {
            Ok(report) => AnalyticsData::Populated(report),
            Err(error) => AnalyticsData::Error {
                message: format!("malformed analytics payload: {error}"),
            },
        }
    }
}

pub(crate) fn value_to_message(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub epoch: u64,
    pub data: AnalyticsData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DashboardState {
    pub system: Option<SystemState>,
    pub symbols: BTreeMap<String, SymbolState>,
    pub analytics: Option<AnalyticsSnapshot>,
    pub available_models: Vec<String>,
    pub system_config: Option<Value>,
    pub symbol_configs: BTreeMap<String, Value>,
    pub last_message: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direction_accepts_empty_and_flat_tokens() {
        let flat: Direction = serde_json::from_value(json!("")).expect("empty direction");
        let legacy: Direction = serde_json::from_value(json!("FLAT")).expect("FLAT direction");
        let long: Direction = serde_json::from_value(json!("LONG")).expect("LONG direction");

        assert_eq!(flat, Direction::Flat);
        assert_eq!(legacy, Direction::Flat);
        assert_eq!(long, Direction::Long);
        assert_eq!(serde_json::to_value(Direction::Flat).expect("serialize"), json!(""));
    }

    #[test]
    fn unknown_symbol_status_maps_to_unknown() {
        let status: SymbolStatus =
            serde_json::from_value(json!("COOLDOWN")).expect("status should parse");
        assert_eq!(status, SymbolStatus::Unknown);
    }

    #[test]
    fn system_patch_keeps_unspecified_fields() {
        let base: SystemState = serde_json::from_value(json!({
            "balance": 10_000.0, "equity": 10_050.0, "status": "RUNNING", "uptime": 12
        }))
        .expect("system state");
        let patch: SystemState =
            serde_json::from_value(json!({ "equity": 10_100.0, "uptime": 13 })).expect("patch");

        let merged = base.patched(&patch);

        assert_eq!(merged.balance, Some(10_000.0));
        assert_eq!(merged.equity, Some(10_100.0));
        assert_eq!(merged.status.as_deref(), Some("RUNNING"));
        assert_eq!(merged.extra.get("uptime"), Some(&json!(13)));
        assert!(merged.is_running());
    }

    #[test]
    fn symbol_patch_replaces_sub_records_shallowly() {
        let base = SymbolState::loaded(None, None, Some(3), DEFAULT_TEST_TIMEFRAME);
        let patch: SymbolState = serde_json::from_value(json!({
            "prediction": { "hmm_state": 2, "action": "BUY" }
        }))
        .expect("patch");

        let merged = base.patched(&patch);
        let prediction = merged.prediction.expect("prediction");

        assert_eq!(prediction.hmm_state, Some(HmmLabel::Index(2)));
        assert_eq!(prediction.action.as_deref(), Some("BUY"));
        assert_eq!(merged.status, Some(SymbolStatus::Warmup));
        assert_eq!(merged.n_states, Some(3));
    }

    const DEFAULT_TEST_TIMEFRAME: &str = "H1";

    #[test]
    fn analytics_payload_variants_are_distinguished() {
        let error = AnalyticsData::from_payload(&json!({ "error": "database offline" }));
        let empty = AnalyticsData::from_payload(&json!({ "empty": true, "period_days": 30 }));
        let populated = AnalyticsData::from_payload(&json!({
            "summary": { "total_trades": 12 },
            "equity_curve": [1, 2, 3],
            "custom_section": "kept"
        }));

        assert_eq!(
            error,
            AnalyticsData::Error {
                message: "database offline".to_string()
            }
        );
        assert_eq!(
            empty,
            AnalyticsData::Empty {
                period_days: Some(30)
            }
        );
        match populated {
            AnalyticsData::Populated(report) => {
                assert_eq!(report.summary, Some(json!({ "total_trades": 12 })));
                assert_eq!(report.extra.get("custom_section"), Some(&json!("kept")));
            }
            other => panic!("expected populated analytics, got {other:?}"),
        }
    }
}
