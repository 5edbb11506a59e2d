use crate::sync::discovery::{connect_peer_stream, EndpointResolver, PeerWsStream};
use crate::sync::dispatcher::CommandDispatcher;
use crate::sync::protocol::{classify, credential_frame, decode_frame, Command, InboundMessage};
use crate::sync::store::LocalStateStore;
use crate::sync::types::{ConnectionError, ConnectionState, ConnectionStatus, EngineConfig};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub type SharedCredential = Arc<Mutex<Option<String>>>;

type PeerWriter = SplitSink<PeerWsStream, Message>;

const TRANSPORT_FAILURE_REASON: &str = "Connection failed";

/// One decoded inbound frame on its way to the merge loop.
#[derive(Debug)]
pub(crate) struct InboundEnvelope {
    pub raw: Arc<Value>,
    pub message: InboundMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Dropped,
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameDirective {
    Continue,
    Authenticated,
    Rejected,
    PeerClosed,
}

/// Owns the transport and the connection lifecycle. Exactly one session is
/// alive at a time; the reconnect delay only starts once it has ended.
pub(crate) struct Supervisor {
    config: EngineConfig,
    resolver: EndpointResolver,
    store: LocalStateStore,
    dispatcher: CommandDispatcher,
    credential: SharedCredential,
    rejected_credential: Option<String>,
    inbound: mpsc::Sender<InboundEnvelope>,
    cancel_token: CancellationToken,
    status: ConnectionStatus,
}

impl Supervisor {
    pub(crate) fn new(
        config: EngineConfig,
        resolver: EndpointResolver,
        store: LocalStateStore,
        dispatcher: CommandDispatcher,
        credential: SharedCredential,
        inbound: mpsc::Sender<InboundEnvelope>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            resolver,
            store,
            dispatcher,
            credential,
            rejected_credential: None,
            inbound,
            cancel_token,
            status: ConnectionStatus::idle(),
        }
    }

    pub(crate) async fn run(mut self) {
        let cancel_token = self.cancel_token.clone();

        while !cancel_token.is_cancelled() {
            self.advance(ConnectionState::Resolving);
            let endpoint = tokio::select! {
                _ = cancel_token.cancelled() => break,
                endpoint = self.resolver.resolve() => endpoint,
            };
            self.status.endpoint = Some(endpoint.clone());
            self.advance(ConnectionState::Connecting);

            log::info!(
                "connecting to {endpoint} (attempt {})",
                self.status.attempt + 1
            );
            let connected = tokio::select! {
                _ = cancel_token.cancelled() => break,
                connected = tokio::time::timeout(
                    self.config.auth_timeout,
                    connect_peer_stream(&endpoint),
                ) => connected,
            };

            match connected {
                Ok(Ok(stream)) => {
                    if self.run_session(stream).await == SessionEnd::TornDown {
                        break;
                    }
                }
                Ok(Err(error)) => {
                    log::warn!("websocket connect error: {error}");
                    self.record_error(ConnectionError::Transport {
                        reason: TRANSPORT_FAILURE_REASON.to_string(),
                    });
                }
                Err(_) => {
                    log::warn!("websocket connect to {endpoint} timed out");
                    self.record_error(ConnectionError::Transport {
                        reason: "Connection timed out".to_string(),
                    });
                }
            }

            self.advance(ConnectionState::Closed);
            self.status.attempt = self.status.attempt.saturating_add(1);
            self.publish_status();

            if cancel_token.is_cancelled() {
                break;
            }
            log::info!(
                "reconnecting in {}ms",
                self.config.reconnect_delay.as_millis()
            );
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.dispatcher.detach();
        self.advance(ConnectionState::Closed);
        log::info!("connection supervisor stopped");
    }

    async fn run_session(&mut self, stream: PeerWsStream) -> SessionEnd {
        let cancel_token = self.cancel_token.clone();
        let (mut writer, mut reader) = stream.split();
        let (session_sink, mut outbound) = mpsc::unbounded_channel::<String>();

        let credential = self.credential.lock().clone();
        if self.status.error == Some(ConnectionError::InvalidCredential)
            && credential != self.rejected_credential
        {
            self.status.error = None;
        }

        let auth_deadline = tokio::time::sleep(self.config.auth_timeout);
        tokio::pin!(auth_deadline);

        let mut authenticating = match credential.as_deref() {
            Some(token) => {
                self.advance(ConnectionState::Authenticating);
                if let Err(error) = writer.send(Message::Text(credential_frame(token))).await {
                    log::warn!("failed to send credential: {error}");
                    self.record_error(ConnectionError::Transport {
                        reason: TRANSPORT_FAILURE_REASON.to_string(),
                    });
                    return SessionEnd::Dropped;
                }
                true
            }
            None => {
                self.activate(&session_sink);
                false
            }
        };

        let end = loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    self.dispatcher.detach();
                    close_writer(&mut writer).await;
                    break SessionEnd::TornDown;
                }
                _ = &mut auth_deadline, if authenticating => {
                    log::warn!(
                        "no authentication outcome within {}ms, closing",
                        self.config.auth_timeout.as_millis()
                    );
                    self.record_error(ConnectionError::HandshakeTimeout);
                    close_writer(&mut writer).await;
                    break SessionEnd::Dropped;
                }
                Some(frame) = outbound.recv() => {
                    if let Err(error) = writer.send(Message::Text(frame)).await {
                        log::warn!("websocket send error: {error}");
                        self.record_error(ConnectionError::Transport {
                            reason: TRANSPORT_FAILURE_REASON.to_string(),
                        });
                        break SessionEnd::Dropped;
                    }
                }
                next_frame = reader.next() => {
                    let Some(frame_result) = next_frame else {
                        log::info!("websocket stream ended");
                        break SessionEnd::Dropped;
                    };

                    let message = match frame_result {
                        Ok(message) => message,
                        Err(error) => {
                            log::warn!("websocket frame error: {error}");
                            self.record_error(ConnectionError::Transport {
                                reason: TRANSPORT_FAILURE_REASON.to_string(),
                            });
                            break SessionEnd::Dropped;
                        }
                    };

                    match self.handle_frame(message).await {
                        FrameDirective::Continue => {}
                        FrameDirective::Authenticated if authenticating => {
                            authenticating = false;
                            log::info!("authenticated with peer");
                            self.activate(&session_sink);
                        }
                        FrameDirective::Authenticated => {}
                        FrameDirective::Rejected => {
                            self.rejected_credential = credential.clone();
                            close_writer(&mut writer).await;
                            break SessionEnd::Dropped;
                        }
                        FrameDirective::PeerClosed => break SessionEnd::Dropped,
                    }
                }
            }
        };

        self.dispatcher.detach();
        end
    }

    async fn handle_frame(&mut self, message: Message) -> FrameDirective {
        let mut payload = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                match frame {
                    Some(frame) => log::info!("peer closed connection: code {}", frame.code),
                    None => log::info!("peer closed connection"),
                }
                return FrameDirective::PeerClosed;
            }
            _ => return FrameDirective::Continue,
        };

        let raw = match decode_frame(payload.as_mut_slice()) {
            Ok(raw) => raw,
            Err(error) => {
                log::warn!("failed to decode inbound frame: {error}");
                return FrameDirective::Continue;
            }
        };

        let message = classify(&raw);
        log::debug!("inbound message classified as {}", message.kind());

        let directive = match &message {
            InboundMessage::AuthAccepted => FrameDirective::Authenticated,
            InboundMessage::AuthRejected => {
                log::error!("peer rejected the configured credential");
                self.record_error(ConnectionError::InvalidCredential);
                FrameDirective::Rejected
            }
            _ => FrameDirective::Continue,
        };

        let envelope = InboundEnvelope {
            raw: Arc::new(raw),
            message,
        };
        if self.inbound.send(envelope).await.is_err() {
            log::debug!("merge loop stopped, dropping inbound message");
        }

        directive
    }

    fn activate(&mut self, session_sink: &mpsc::UnboundedSender<String>) {
        self.advance(ConnectionState::Active);
        self.status.attempt = 0;
        self.status.error = None;
        self.rejected_credential = None;
        self.publish_status();

        self.dispatcher.attach(session_sink.clone());
        match Command::GetState.to_frame() {
            Ok(frame) => {
                let _ = session_sink.send(frame);
            }
            Err(error) => log::warn!("failed to encode initial state request: {error}"),
        }
    }

    /// The only place the connection state changes.
    fn advance(&mut self, next: ConnectionState) {
        let current = self.status.state;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            log::error!(
                "ignoring invalid connection transition {} -> {}",
                current.as_str(),
                next.as_str()
            );
            return;
        }

        log::info!("connection {} -> {}", current.as_str(), next.as_str());
        if next != ConnectionState::Active {
            self.dispatcher.detach();
        }
        self.status.state = next;
        self.publish_status();
    }

    /// A persistent error is never overwritten by a transient one.
    fn record_error(&mut self, error: ConnectionError) {
        let keep_existing = self
            .status
            .error
            .as_ref()
            .is_some_and(|existing| existing.is_persistent() && !error.is_persistent());
        if !keep_existing {
            self.status.error = Some(error);
            self.publish_status();
        }
    }

    fn publish_status(&self) {
        self.store.publish_connection(self.status.clone());
    }
}

async fn close_writer(writer: &mut PeerWriter) {
    if let Err(error) = writer.send(Message::Close(None)).await {
        log::debug!("close frame not delivered: {error}");
    }
}
