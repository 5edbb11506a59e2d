use crate::sync::discovery::EndpointResolver;
use crate::sync::dispatcher::CommandDispatcher;
use crate::sync::merge;
use crate::sync::protocol::Command;
use crate::sync::store::LocalStateStore;
use crate::sync::supervisor::{InboundEnvelope, SharedCredential, Supervisor};
use crate::sync::types::{ConnectionStatus, EngineConfig};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

const INBOUND_QUEUE_CAPACITY: usize = 1_024;

/// A running synchronization engine: connection supervisor plus merge loop.
///
/// Dropping the handle cancels both tasks; [`EngineHandle::shutdown`] also
/// waits for them to finish.
pub struct EngineHandle {
    cancellation_token: CancellationToken,
    _cancel_on_drop: DropGuard,
    supervisor_handle: JoinHandle<()>,
    merge_handle: JoinHandle<()>,
    store: LocalStateStore,
    dispatcher: CommandDispatcher,
    credential: SharedCredential,
}

impl EngineHandle {
    /// Spawns the engine tasks on the current tokio runtime.
    pub fn start(config: EngineConfig) -> Self {
        Self::start_with_client(config, Client::new())
    }

    pub fn start_with_client(config: EngineConfig, http_client: Client) -> Self {
        let cancellation_token = CancellationToken::new();
        let store = LocalStateStore::new();
        let dispatcher = CommandDispatcher::new();
        let credential: SharedCredential = Arc::new(Mutex::new(config.credential.clone()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        let merge_handle = tokio::spawn(run_merge_loop(
            store.clone(),
            inbound_rx,
            config.default_timeframe.clone(),
            cancellation_token.clone(),
        ));

        let resolver = EndpointResolver::new(http_client, &config);
        let supervisor = Supervisor::new(
            config,
            resolver,
            store.clone(),
            dispatcher.clone(),
            Arc::clone(&credential),
            inbound_tx,
            cancellation_token.clone(),
        );
        let supervisor_handle = tokio::spawn(supervisor.run());

        Self {
            _cancel_on_drop: cancellation_token.clone().drop_guard(),
            cancellation_token,
            supervisor_handle,
            merge_handle,
            store,
            dispatcher,
            credential,
        }
    }

    pub fn store(&self) -> &LocalStateStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.store.connection()
    }

    pub fn send(&self, kind: &str, payload: Option<Map<String, Value>>) -> bool {
        self.dispatcher.send(kind, payload)
    }

    pub fn dispatch(&self, command: &Command) -> bool {
        self.dispatcher.dispatch(command)
    }

    /// Takes effect on the next connection attempt.
    pub fn set_credential(&self, credential: Option<String>) {
        let credential = credential
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        *self.credential.lock() = credential;
    }

    /// Cancels the pending retry timer, closes the transport without
    /// re-arming reconnect, and waits for both tasks to finish.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        let _ = self.supervisor_handle.await;
        let _ = self.merge_handle.await;
    }
}

pub(crate) async fn run_merge_loop(
    store: LocalStateStore,
    mut inbound: mpsc::Receiver<InboundEnvelope>,
    default_timeframe: String,
    cancel_token: CancellationToken,
) {
    let mut current = store.snapshot();

    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            next = inbound.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        current = merge::apply(
            &current,
            &envelope.raw,
            &envelope.message,
            &default_timeframe,
        );
        store.publish(current.clone(), envelope.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::classify;
    use serde_json::json;

    fn envelope(raw: Value) -> InboundEnvelope {
        let message = classify(&raw);
        InboundEnvelope {
            raw: Arc::new(raw),
            message,
        }
    }

    #[tokio::test]
    async fn merge_loop_applies_messages_in_arrival_order() {
        let store = LocalStateStore::new();
        let (tx, rx) = mpsc::channel(8);
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_merge_loop(
            store.clone(),
            rx,
            "M15".to_string(),
            cancel_token.clone(),
        ));

        tx.send(envelope(json!({ "event": "MODEL_LOADED", "data": { "symbol": "GBPUSD" } })))
            .await
            .expect("queue open");
        tx.send(envelope(json!({ "event": "MODEL_UNLOADED", "data": { "symbol": "GBPUSD" } })))
            .await
            .expect("queue open");
        tx.send(envelope(json!({ "event": "MODEL_LOADED", "data": { "symbol": "EURUSD" } })))
            .await
            .expect("queue open");
        drop(tx);
        handle.await.expect("merge loop should finish");

        let state = store.snapshot();
        assert!(!state.symbols.contains_key("GBPUSD"));
        assert!(state.symbols.contains_key("EURUSD"));
        assert_eq!(
            state.last_message,
            Some(json!({ "event": "MODEL_LOADED", "data": { "symbol": "EURUSD" } }))
        );
    }

    #[tokio::test]
    async fn cancelled_merge_loop_stops_mutating_state() {
        let store = LocalStateStore::new();
        let (tx, rx) = mpsc::channel(8);
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        tx.send(envelope(json!({ "event": "MODEL_LOADED", "data": { "symbol": "GBPUSD" } })))
            .await
            .expect("queue open");
        run_merge_loop(store.clone(), rx, "M15".to_string(), cancel_token).await;

        assert!(store.snapshot().symbols.is_empty());
    }
}
