use crate::sync::protocol::{command_envelope, Command};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Best-effort command channel to the peer.
///
/// The supervisor installs a session sink when the connection becomes active
/// and removes it before the session ends. Commands sent while no sink is
/// installed are dropped: nothing is queued for a later session, and callers
/// learn the outcome only from the peer's eventual response message.
#[derive(Clone, Default)]
pub struct CommandDispatcher {
    sink: Arc<Mutex<Option<UnboundedSender<String>>>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the frame was handed to an active session.
    pub fn send(&self, kind: &str, payload: Option<Map<String, Value>>) -> bool {
        self.transmit(command_envelope(kind, payload).to_string())
    }

    pub fn dispatch(&self, command: &Command) -> bool {
        match command.to_frame() {
            Ok(frame) => self.transmit(frame),
            Err(error) => {
                log::warn!("failed to encode command {command:?}: {error}");
                false
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.sink
            .lock()
            .as_ref()
            .is_some_and(|sink| !sink.is_closed())
    }

    pub(crate) fn attach(&self, sink: UnboundedSender<String>) {
        *self.sink.lock() = Some(sink);
    }

    pub(crate) fn detach(&self) {
        self.sink.lock().take();
    }

    fn transmit(&self, frame: String) -> bool {
        let guard = self.sink.lock();
        let Some(sink) = guard.as_ref() else {
            log::debug!("dropping command while disconnected");
            return false;
        };
        sink.send(frame).is_ok()
    }
}
