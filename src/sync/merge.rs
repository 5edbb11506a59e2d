use crate::sync::model::{
    value_to_message, AnalyticsData, AnalyticsSnapshot, DashboardState, Position, SymbolState,
    SystemState,
};
use crate::sync::protocol::{
    CommandResponse, InboundMessage, ModelLoadedPayload, SnapshotPayload, TickPayload,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Computes the next aggregate state from the previous one and a classified
/// message. The previous state is never mutated; `raw` always becomes the new
/// `last_message`, whatever the classification.
pub fn apply(
    previous: &DashboardState,
    raw: &Value,
    message: &InboundMessage,
    default_timeframe: &str,
) -> DashboardState {
    let mut next = previous.clone();
    next.last_message = Some(raw.clone());

    match message {
        InboundMessage::Snapshot(snapshot) => apply_snapshot(&mut next, snapshot),
        InboundMessage::SymbolUpdate { symbol, patch } => {
            apply_symbol_patch(&mut next.symbols, symbol, patch)
        }
        InboundMessage::Tick(tick) => apply_tick(&mut next, tick),
        InboundMessage::ModelLoaded(payload) => {
            apply_model_loaded(&mut next.symbols, payload, default_timeframe)
        }
        InboundMessage::ModelUnloaded { symbol } => {
            next.symbols.remove(symbol);
        }
        InboundMessage::CommandResponse(response) => apply_response(&mut next, response),
        InboundMessage::Analytics(payload) => {
            replace_analytics(&mut next, AnalyticsData::from_payload(payload))
        }
        InboundMessage::AuthAccepted
        | InboundMessage::AuthRejected
        | InboundMessage::Unrecognized => {}
    }

    next
}

fn apply_snapshot(state: &mut DashboardState, snapshot: &SnapshotPayload) {
    state.system = snapshot.system.clone();
    state.symbols = snapshot.symbols.clone();
}

fn apply_symbol_patch(symbols: &mut BTreeMap<String, SymbolState>, symbol: &str, patch: &SymbolState) {
    if let Some(entry) = symbols.get_mut(symbol) {
        *entry = entry.patched(patch);
    }
}

fn apply_tick(state: &mut DashboardState, tick: &TickPayload) {
    if let Some(system_patch) = &tick.system {
        let base = state.system.clone().unwrap_or_default();
        state.system = Some(base.patched(system_patch));
    }

    if let Some(open_positions) = &tick.positions {
        apply_open_positions(&mut state.symbols, open_positions);
    }

    if let Some(symbol_updates) = &tick.symbol_updates {
        for (symbol, patch) in symbol_updates {
            apply_symbol_patch(&mut state.symbols, symbol, patch);
        }
    }
}

/// Positions missing from the open set are treated as closed.
fn apply_open_positions(
    symbols: &mut BTreeMap<String, SymbolState>,
    open_positions: &BTreeMap<String, Position>,
) {
    for (symbol, entry) in symbols.iter_mut() {
        match open_positions.get(symbol) {
            Some(position_patch) => {
                let base = entry.position.clone().unwrap_or_default();
                entry.position = Some(base.patched(position_patch));
            }
            None if entry.has_open_position() => {
                entry.position = Some(Position::flat());
            }
            None => {}
        }
    }
}

fn apply_model_loaded(
    symbols: &mut BTreeMap<String, SymbolState>,
    payload: &ModelLoadedPayload,
    default_timeframe: &str,
) {
    let entry = SymbolState::loaded(
        payload.status,
        payload.timeframe.clone(),
        payload.n_states,
        default_timeframe,
    );
    symbols.insert(payload.symbol.clone(), entry);
}

fn apply_response(state: &mut DashboardState, response: &CommandResponse) {
    if let Some(models) = &response.available_models {
        state.available_models = models.clone();
    }

    if response.is_analytics() {
        match (&response.error, &response.analytics) {
            (Some(error), _) if !error.is_null() => replace_analytics(
                state,
                AnalyticsData::Error {
                    message: value_to_message(error),
                },
            ),
            (_, Some(analytics)) if !analytics.is_null() => {
                replace_analytics(state, AnalyticsData::from_payload(analytics))
            }
            _ => {}
        }
    }

    if let Some(config) = response.config.as_ref().filter(|config| !config.is_null()) {
        match &response.symbol {
            Some(symbol) => {
                state.symbol_configs.insert(symbol.clone(), config.clone());
            }
            None => state.system_config = Some(config.clone()),
        }
    }
}

fn replace_analytics(state: &mut DashboardState, data: AnalyticsData) {
    let epoch = state
        .analytics
        .as_ref()
        .map(|snapshot| snapshot.epoch.saturating_add(1))
        .unwrap_or(1);
    state.analytics = Some(AnalyticsSnapshot { epoch, data });
}

/// Convenience for consumers holding only the system record.
pub fn system_or_unknown(state: &DashboardState) -> SystemState {
    state.system.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::model::{Direction, HmmLabel, SymbolStatus};
    use crate::sync::protocol::classify;
    use serde_json::json;

    const TIMEFRAME: &str = "M15";

    fn feed(state: &DashboardState, raw: Value) -> DashboardState {
        let message = classify(&raw);
        apply(state, &raw, &message, TIMEFRAME)
    }

    fn seeded() -> DashboardState {
        feed(
            &DashboardState::default(),
            json!({
                "type": "full_state",
                "data": {
                    "system": { "balance": 10000.0, "equity": 10025.0, "dd_pct": 0.4, "status": "RUNNING" },
                    "symbols": {
                        "EURUSD": {
                            "status": "NORMAL",
                            "timeframe": "M15",
                            "position": { "direction": "LONG", "size": 1.0, "pnl": 25.0, "pnl_pips": 2.5, "open_price": 1.0850 },
                            "prediction": { "hmm_state": 1, "action": "HOLD" },
                            "stats": { "win_rate": 0.55, "trades": 40 }
                        },
                        "USDJPY": {
                            "status": "WARMUP",
                            "position": { "direction": "", "size": 0.0 }
                        }
                    }
                }
            }),
        )
    }

    #[test]
    fn tick_system_patch_keeps_unspecified_fields() {
        let state = seeded();
        let next = feed(&state, json!({ "type": "tick", "data": { "system": { "equity": 10040.0 } } }));
        let next = feed(&next, json!({ "type": "tick", "data": { "system": { "dd_pct": 0.1 } } }));

        let system = next.system.expect("system state");
        assert_eq!(system.balance, Some(10000.0));
        assert_eq!(system.equity, Some(10040.0));
        assert_eq!(system.drawdown_pct, Some(0.1));
        assert_eq!(system.status.as_deref(), Some("RUNNING"));
    }

    #[test]
    fn tick_system_patch_before_snapshot_starts_from_unknown() {
        let next = feed(
            &DashboardState::default(),
            json!({ "type": "tick", "data": { "system": { "equity": 5.0 } } }),
        );

        let system = next.system.expect("system state");
        assert_eq!(system.equity, Some(5.0));
        assert_eq!(system.balance, None);
    }

    #[test]
    fn omitted_open_position_is_reset_to_flat() {
        let state = seeded();
        let next = feed(&state, json!({ "type": "tick", "data": { "positions": {} } }));

        let position = next.symbols["EURUSD"].position.clone().expect("position");
        assert_eq!(position.size, Some(0.0));
        assert_eq!(position.direction, Some(Direction::Flat));
        assert_eq!(position.pnl, Some(0.0));
        assert_eq!(position.pnl_pips, Some(0.0));
        assert_eq!(position.open_price, Some(0.0));
        assert_eq!(
            serde_json::to_value(&position).expect("serialize")["direction"],
            json!("")
        );
    }

    #[test]
    fn open_position_patch_merges_fields() {
        let state = seeded();
        let next = feed(
            &state,
            json!({ "type": "tick", "data": { "positions": { "EURUSD": { "pnl": 31.5, "pnl_pips": 3.1 } } } }),
        );

        let position = next.symbols["EURUSD"].position.clone().expect("position");
        assert_eq!(position.pnl, Some(31.5));
        assert_eq!(position.pnl_pips, Some(3.1));
        assert_eq!(position.size, Some(1.0));
        assert_eq!(position.direction, Some(Direction::Long));
    }

    #[test]
    fn tick_never_creates_unknown_symbols() {
        let state = seeded();
        let next = feed(
            &state,
            json!({
                "type": "tick",
                "data": {
                    "positions": { "XAUUSD": { "direction": "SHORT", "size": 2.0 } },
                    "symbol_updates": { "AUDCAD": { "status": "NORMAL" } }
                }
            }),
        );

        assert_eq!(next.symbols.len(), 2);
        assert!(!next.symbols.contains_key("XAUUSD"));
        assert!(!next.symbols.contains_key("AUDCAD"));
    }

    #[test]
    fn tick_symbol_updates_patch_known_symbols() {
        let state = seeded();
        let next = feed(
            &state,
            json!({ "type": "tick", "data": { "symbol_updates": { "USDJPY": { "status": "NORMAL" } } } }),
        );

        assert_eq!(next.symbols["USDJPY"].status, Some(SymbolStatus::Normal));
        assert_eq!(next.symbols["EURUSD"], state.symbols["EURUSD"]);
    }

    #[test]
    fn model_loaded_creates_placeholder_entry() {
        let next = feed(
            &seeded(),
            json!({
                "event": "MODEL_LOADED",
                "data": { "symbol": "GBPUSD", "timeframe": "M15", "status": "WARMUP", "n_states": 4 }
            }),
        );

        let entry = next.symbols.get("GBPUSD").expect("GBPUSD entry");
        let prediction = entry.prediction.clone().expect("prediction");
        assert_eq!(prediction.hmm_state, Some(HmmLabel::Label("-".to_string())));
        assert_eq!(prediction.action.as_deref(), Some("WAIT"));
        assert_eq!(entry.stats.as_ref().and_then(|stats| stats.trades), Some(0));
        assert_eq!(entry.n_states, Some(4));
        assert!(!entry.has_open_position());
    }

    #[test]
    fn model_loaded_defaults_status_and_timeframe() {
        let next = feed(
            &DashboardState::default(),
            json!({ "event": "MODEL_LOADED", "data": { "symbol": "NZDUSD" } }),
        );

        let entry = &next.symbols["NZDUSD"];
        assert_eq!(entry.status, Some(SymbolStatus::Warmup));
        assert_eq!(entry.timeframe.as_deref(), Some(TIMEFRAME));
    }

    #[test]
    fn model_unloaded_removes_the_key() {
        let loaded = feed(
            &seeded(),
            json!({ "event": "MODEL_LOADED", "data": { "symbol": "GBPUSD", "n_states": 4 } }),
        );
        let unloaded = feed(
            &loaded,
            json!({ "event": "MODEL_UNLOADED", "data": { "symbol": "GBPUSD" } }),
        );

        assert!(!unloaded.symbols.contains_key("GBPUSD"));
        assert_eq!(unloaded.symbols.len(), 2);
    }

    #[test]
    fn symbol_update_for_unknown_symbol_is_a_no_op() {
        let state = seeded();
        let next = feed(
            &state,
            json!({ "type": "symbol_update", "symbol": "EURJPY", "data": { "status": "BLOCKED" } }),
        );

        assert_eq!(next.symbols, state.symbols);
    }

    #[test]
    fn symbol_update_merges_into_known_symbol() {
        let state = seeded();
        let next = feed(
            &state,
            json!({ "type": "symbol_update", "symbol": "EURUSD", "data": { "status": "BLOCKED" } }),
        );

        let entry = &next.symbols["EURUSD"];
        assert_eq!(entry.status, Some(SymbolStatus::Blocked));
        assert_eq!(entry.position, state.symbols["EURUSD"].position);
    }

    #[test]
    fn replaying_the_same_snapshot_is_idempotent() {
        let snapshot = json!({
            "type": "full_state",
            "data": { "system": { "balance": 1.0 }, "symbols": { "EURUSD": { "status": "NORMAL" } } }
        });

        let once = feed(&seeded(), snapshot.clone());
        let twice = feed(&once, snapshot);

        assert_eq!(once, twice);
    }

    #[test]
    fn snapshot_replaces_symbols_wholesale() {
        let next = feed(
            &seeded(),
            json!({ "type": "full_state", "data": { "system": { "balance": 1.0 }, "symbols": {} } }),
        );

        assert!(next.symbols.is_empty());
        assert_eq!(next.system.and_then(|system| system.equity), None);
    }

    #[test]
    fn model_list_response_replaces_available_models() {
        let state = feed(
            &DashboardState::default(),
            json!({ "type": "response", "cmd": "GET_AVAILABLE_MODELS", "available_models": ["a", "b"] }),
        );
        let next = feed(
            &state,
            json!({ "type": "response", "cmd": "GET_AVAILABLE_MODELS", "available_models": ["c"] }),
        );

        assert_eq!(next.available_models, vec!["c".to_string()]);
    }

    #[test]
    fn analytics_error_replaces_stale_report() {
        let populated = feed(
            &DashboardState::default(),
            json!({ "type": "response", "cmd": "GET_ANALYTICS", "analytics": { "summary": { "trades": 3 } } }),
        );
        let failed = feed(
            &populated,
            json!({ "type": "response", "cmd": "GET_ANALYTICS", "error": "no database" }),
        );

        let first = populated.analytics.expect("analytics");
        let second = failed.analytics.expect("analytics");
        assert!(matches!(first.data, AnalyticsData::Populated(_)));
        assert_eq!(
            second.data,
            AnalyticsData::Error {
                message: "no database".to_string()
            }
        );
        assert_eq!(second.epoch, first.epoch + 1);
    }

    #[test]
    fn bare_analytics_payload_is_delivered() {
        let next = feed(
            &DashboardState::default(),
            json!({ "analytics": { "empty": true, "period_days": 7 } }),
        );

        assert_eq!(
            next.analytics.map(|snapshot| snapshot.data),
            Some(AnalyticsData::Empty {
                period_days: Some(7)
            })
        );
    }

    #[test]
    fn config_responses_are_keyed_by_symbol() {
        let state = feed(
            &DashboardState::default(),
            json!({ "type": "response", "cmd": "GET_CONFIG", "config": { "risk": 0.01 } }),
        );
        let next = feed(
            &state,
            json!({
                "type": "response",
                "cmd": "GET_SYMBOL_CONFIG",
                "symbol": "EURUSD",
                "config": { "enabled": true, "lot_multiplier": 1.5 }
            }),
        );

        assert_eq!(next.system_config, Some(json!({ "risk": 0.01 })));
        assert_eq!(
            next.symbol_configs.get("EURUSD"),
            Some(&json!({ "enabled": true, "lot_multiplier": 1.5 }))
        );
    }

    #[test]
    fn unrecognized_message_only_updates_last_message() {
        let state = seeded();
        let trade = json!({ "type": "trade", "data": { "symbol": "EURUSD", "action": "BUY", "size": 1.0 } });
        let next = feed(&state, trade.clone());

        assert_eq!(next.last_message, Some(trade));
        assert_eq!(next.symbols, state.symbols);
        assert_eq!(next.system, state.system);
        assert_eq!(system_or_unknown(&next), state.system.clone().unwrap_or_default());
    }

    #[test]
    fn snapshot_keeps_valid_symbols_when_one_entry_is_malformed() {
        let next = feed(
            &DashboardState::default(),
            json!({
                "type": "full_state",
                "data": {
                    "system": { "balance": 500.0 },
                    "symbols": {
                        "EURUSD": { "status": "NORMAL", "stats": { "trades": 12.0 }, "prediction": { "hmm_state": 3.0 } },
                        "GBPUSD": { "status": "WARMUP" },
                        "USDJPY": { "n_states": "four" }
                    }
                }
            }),
        );

        assert_eq!(next.system.as_ref().and_then(|system| system.balance), Some(500.0));
        let eurusd = &next.symbols["EURUSD"];
        assert_eq!(eurusd.stats.as_ref().and_then(|stats| stats.trades), Some(12));
        assert_eq!(
            eurusd.prediction.as_ref().and_then(|prediction| prediction.hmm_state.clone()),
            Some(HmmLabel::Index(3))
        );
        assert_eq!(next.symbols["GBPUSD"].status, Some(SymbolStatus::Warmup));
        assert!(!next.symbols.contains_key("USDJPY"));
    }

    #[test]
    fn tick_applies_valid_sections_around_a_malformed_entry() {
        let state = seeded();
        let next = feed(
            &state,
            json!({
                "type": "tick",
                "data": {
                    "system": { "equity": 10080.0 },
                    "positions": {
                        "EURUSD": { "pnl": 40.0 },
                        "USDJPY": { "size": "broken" }
                    },
                    "symbol_updates": {
                        "EURUSD": { "n_states": 4.0 },
                        "USDJPY": { "stats": { "trades": 2.5 } }
                    }
                }
            }),
        );

        assert_eq!(next.system.as_ref().and_then(|system| system.equity), Some(10080.0));
        let eurusd = &next.symbols["EURUSD"];
        assert_eq!(eurusd.n_states, Some(4));
        assert_eq!(eurusd.position.as_ref().and_then(|position| position.pnl), Some(40.0));
        assert_eq!(next.symbols["USDJPY"], state.symbols["USDJPY"]);
    }
}
