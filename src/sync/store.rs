use crate::sync::model::DashboardState;
use crate::sync::types::ConnectionStatus;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

const MESSAGE_BROADCAST_CAPACITY: usize = 256;

struct StoreChannels {
    state: watch::Sender<DashboardState>,
    connection: watch::Sender<ConnectionStatus>,
    messages: broadcast::Sender<Arc<Value>>,
}

/// Subscribable aggregate state owned by one engine instance.
///
/// `subscribe` yields complete states only and may skip intermediate ones;
/// `subscribe_messages` sees every processed raw message in arrival order
/// (lagging receivers lose the oldest entries).
#[derive(Clone)]
pub struct LocalStateStore {
    channels: Arc<StoreChannels>,
}

impl LocalStateStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(DashboardState::default());
        let (connection, _) = watch::channel(ConnectionStatus::idle());
        let (messages, _) = broadcast::channel(MESSAGE_BROADCAST_CAPACITY);

        Self {
            channels: Arc::new(StoreChannels {
                state,
                connection,
                messages,
            }),
        }
    }

    pub fn snapshot(&self) -> DashboardState {
        self.channels.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.channels.state.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Arc<Value>> {
        self.channels.messages.subscribe()
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.channels.connection.borrow().clone()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.channels.connection.subscribe()
    }

    pub(crate) fn publish(&self, next: DashboardState, raw: Arc<Value>) {
        self.channels.state.send_replace(next);
        let _ = self.channels.messages.send(raw);
    }

    pub(crate) fn publish_connection(&self, status: ConnectionStatus) {
        self.channels.connection.send_replace(status);
    }
}

impl Default for LocalStateStore {
    fn default() -> Self {
        Self::new()
    }
}
