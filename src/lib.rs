pub mod commands;
pub mod console;
pub mod error;
pub mod state;
pub mod sync;

pub use error::AppError;
pub use state::AppState;
pub use sync::engine::EngineHandle;
pub use sync::types::{EngineArgs, EngineConfig};

use commands::engine::{start_engine, stop_engine};

/// Runs the engine headless until stdin closes or the process is interrupted.
pub async fn run(args: EngineArgs) -> Result<(), AppError> {
    let state = AppState::new();
    let session = start_engine(&state, Some(args)).await?;
    log::info!(
        "engine started (fallback {}, discovery {}, timeframe {})",
        session.fallback_url,
        if session.discovery_enabled { "on" } else { "off" },
        session.default_timeframe
    );

    let watchers = {
        let engine_slot = state.engine.lock().await;
        engine_slot.as_ref().map(console::spawn_watchers)
    };

    tokio::select! {
        result = console::read_operator_commands(
            &state,
            watchers.as_ref().map(console::Watchers::activity_log),
        ) => {
            if let Err(error) = result {
                log::warn!("operator input failed: {error}");
            }
        }
        interrupted = tokio::signal::ctrl_c() => {
            if let Err(error) = interrupted {
                log::warn!("failed to listen for interrupt: {error}");
            }
        }
    }

    let result = stop_engine(&state).await?;
    if let Some(watchers) = watchers {
        watchers.abort();
    }
    log::info!("engine stopped: {}", result.stopped);
    Ok(())
}
