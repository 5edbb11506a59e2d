use crate::sync::engine::EngineHandle;
use std::time::Instant;
use tokio::sync::Mutex;

pub struct AppState {
    pub started_at: Instant,
    pub engine: Mutex<Option<EngineHandle>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            engine: Mutex::new(None),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
