//! # Transport Channel
//!
//! Persistent duplex WebSocket link to the live service. One background task
//! per connection owns the socket: it sends the setup message, forwards queued
//! input frames once the server acknowledges setup, and turns every inbound
//! message into a [`TransportEvent`] on an unbounded channel.
//!
//! ## Event order:
//! Events are delivered in the order the server sent them. `Open` is always
//! first; `Closed` or `Error` is always last.

use crate::audio::codec::EncodedInputChunk;
use crate::config::LiveConfig;
use crate::error::{SessionError, SessionResult};
use crate::transport::messages::{RealtimeInputMessage, ServerMessage, SetupMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

/// What the channel reports back to the session controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The service acknowledged setup and accepts input
    Open,
    /// One base64 PCM16 payload of synthesized speech
    AudioChunk(String),
    /// The user barged in; pending speech is stale
    Interrupted,
    /// The socket closed, with the reason if the server gave one
    Closed(String),
    /// Connecting or reading failed
    Error(String),
}

/// Handle to one connection.
///
/// Dropping or closing the handle cancels the background task, including a
/// connect that has not completed yet.
pub struct TransportChannel {
    outbound: Option<mpsc::UnboundedSender<EncodedInputChunk>>,
    task: Option<JoinHandle<()>>,
}

impl TransportChannel {
    pub fn new(outbound: mpsc::UnboundedSender<EncodedInputChunk>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            outbound: Some(outbound),
            task,
        }
    }

    /// Queue one chunk for sending. Fire-and-forget.
    ///
    /// ## Errors:
    /// `TransportSendFailed` once the channel is closed or its task has ended.
    pub fn send(&self, chunk: EncodedInputChunk) -> SessionResult<()> {
        match &self.outbound {
            Some(outbound) => outbound
                .send(chunk)
                .map_err(|_| SessionError::TransportSendFailed("connection task has ended".to_string())),
            None => Err(SessionError::TransportSendFailed("channel is closed".to_string())),
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&mut self) {
        self.outbound.take();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Transport channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_none()
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens transport channels. The controller holds one for its whole lifetime.
pub trait Connector: Send {
    /// Start connecting; completion is signalled by [`TransportEvent::Open`].
    ///
    /// Must be called from inside a tokio runtime.
    fn connect(&self, live: &LiveConfig, events: mpsc::UnboundedSender<TransportEvent>) -> TransportChannel;
}

/// Connects to the live service over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, live: &LiveConfig, events: mpsc::UnboundedSender<TransportEvent>) -> TransportChannel {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        if live.api_key.trim().is_empty() {
            warn!("No API key configured for the live service");
            let _ = events.send(TransportEvent::Error("missing API key".to_string()));
            return TransportChannel::new(outbound_tx, None);
        }

        let url = connect_url(live);
        let setup = SetupMessage::from_config(live);
        info!(endpoint = %live.endpoint, model = %live.model, "Connecting to live service");

        let task = tokio::spawn(run_connection(url, setup, outbound_rx, events));
        TransportChannel::new(outbound_tx, Some(task))
    }
}

/// `{endpoint}?key={api_key}`, or `&key=` when the endpoint already has a query.
pub fn connect_url(live: &LiveConfig) -> String {
    let separator = if live.endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}key={}", live.endpoint, separator, live.api_key)
}

async fn run_connection(
    url: String,
    setup: SetupMessage,
    mut outbound: mpsc::UnboundedReceiver<EncodedInputChunk>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!("Live service connect failed: {}", e);
            let _ = events.send(TransportEvent::Error(e.to_string()));
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    let setup_json = match serde_json::to_string(&setup) {
        Ok(json) => json,
        Err(e) => {
            let _ = events.send(TransportEvent::Error(e.to_string()));
            return;
        }
    };
    if let Err(e) = write.send(Message::Text(setup_json)).await {
        warn!("Sending setup message failed: {}", e);
        let _ = events.send(TransportEvent::Error(e.to_string()));
        return;
    }

    // Input is held in the queue until the server acknowledges setup
    let mut ready = false;

    loop {
        tokio::select! {
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    dispatch_server_message(text.as_bytes(), &mut ready, &events);
                }
                Some(Ok(Message::Binary(data))) => {
                    dispatch_server_message(&data, &mut ready, &events);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    trace!("Live service heartbeat");
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "no close frame".to_string());
                    info!(reason = %reason, "Live service closed the connection");
                    let _ = events.send(TransportEvent::Closed(reason));
                    return;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    warn!("Live service read failed: {}", e);
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    return;
                }
                None => {
                    let _ = events.send(TransportEvent::Closed("stream ended".to_string()));
                    return;
                }
            },
            chunk = outbound.recv(), if ready => match chunk {
                Some(chunk) => {
                    let json = match serde_json::to_string(&RealtimeInputMessage::from(chunk)) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Encoding input message failed: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(json)).await {
                        warn!("Live service write failed: {}", e);
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
            },
        }
    }
}

fn dispatch_server_message(raw: &[u8], ready: &mut bool, events: &mpsc::UnboundedSender<TransportEvent>) {
    let message: ServerMessage = match serde_json::from_slice(raw) {
        Ok(message) => message,
        Err(e) => {
            debug!("Ignoring unparseable server message: {}", e);
            return;
        }
    };

    if message.is_setup_complete() {
        *ready = true;
    }
    if let Some(go_away) = &message.go_away {
        warn!(time_left = ?go_away.time_left, "Live service is going away");
    }
    if message.is_turn_complete() {
        debug!("Model turn complete");
    }

    for event in server_events(&message) {
        let _ = events.send(event);
    }
}

/// Events carried by one server message, in delivery order.
pub fn server_events(message: &ServerMessage) -> Vec<TransportEvent> {
    let mut events = Vec::new();

    if message.is_setup_complete() {
        events.push(TransportEvent::Open);
    }
    for payload in message.audio_payloads() {
        events.push(TransportEvent::AudioChunk(payload.to_string()));
    }
    if message.is_interrupted() {
        events.push(TransportEvent::Interrupted);
    }

    events
}
