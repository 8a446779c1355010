//! # Session Status WebSocket
//!
//! Live status feed for the voice session. Clients connect to `/ws/session`
//! and receive a `session_status` message immediately and on every change:
//! connecting, listening, assistant speaking, back to idle, with the generic
//! failure notice when something went wrong.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the current status is pushed right away
//! 2. **Commands**: `start_session` / `end_session` control the single session
//! 3. **Heartbeat**: the server sends `ping` every 30s; clients answer `pong`
//!
//! ## Message Format:
//! JSON text frames tagged by a `type` field. Audio never travels over this
//! socket; it stays between the local devices and the live service.

use crate::audio::session::SessionStatus;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket message types for client-server communication.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebSocketMessage {
    /// Start the voice session, with optional per-session overrides
    #[serde(rename = "start_session")]
    StartSession {
        #[serde(default)]
        voice: Option<String>,
        #[serde(default)]
        system_instruction: Option<String>,
    },

    /// End the voice session
    #[serde(rename = "end_session")]
    EndSession,

    /// Session status update
    #[serde(rename = "session_status")]
    SessionStatus { session: SessionStatus },

    /// Error messages
    #[serde(rename = "error")]
    Error {
        /// Error code
        code: String,
        /// Human-readable error message
        message: String,
    },

    /// Heartbeat/ping message
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    /// Heartbeat/pong response
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

/// WebSocket actor pushing session status to one client.
pub struct SessionStatusSocket {
    state: web::Data<AppState>,

    /// Last heartbeat time
    last_heartbeat: Instant,
}

impl SessionStatusSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &WebSocketMessage) {
        if let Ok(json) = serde_json::to_string(message) {
            ctx.text(json);
        }
    }

    /// Send error message to client.
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!("WebSocket error {}: {}", code, message);
        self.send(
            ctx,
            &WebSocketMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_start_session(
        &mut self,
        voice: Option<String>,
        system_instruction: Option<String>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let mut settings = self.state.get_config().session_settings();
        if let Some(voice) = voice {
            settings.live.voice = voice;
        }
        if let Some(instruction) = system_instruction {
            settings.live.system_instruction = instruction;
        }

        let state = self.state.clone();
        let addr = ctx.address();

        // Status changes arrive on the watch stream; only failures are reported here
        tokio::spawn(async move {
            let result = state.session.start(settings).await;
            state.record_control_request(result.is_err());

            if let Err(err) = result {
                addr.do_send(SendError {
                    code: "session_error".to_string(),
                    message: err.user_notice().to_string(),
                });
            }
        });
    }

    fn handle_end_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let state = self.state.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            let result = state.session.stop().await;
            state.record_control_request(result.is_err());

            if let Err(err) = result {
                addr.do_send(SendError {
                    code: "session_error".to_string(),
                    message: err.user_notice().to_string(),
                });
            }
        });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<WebSocketMessage>(text) {
            Ok(WebSocketMessage::StartSession { voice, system_instruction }) => {
                info!("Session start requested over WebSocket");
                self.handle_start_session(voice, system_instruction, ctx);
            }
            Ok(WebSocketMessage::EndSession) => {
                info!("Session end requested over WebSocket");
                self.handle_end_session(ctx);
            }
            Ok(WebSocketMessage::Pong { .. }) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(other) => {
                debug!(?other, "Ignoring server-only message type from client");
                self.send_error(ctx, "unexpected_message", "Message type is not accepted from clients");
            }
            Err(err) => {
                self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
            }
        }
    }
}

/// Message for reporting an asynchronous command failure to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendError {
    code: String,
    message: String,
}

impl Actor for SessionStatusSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Status WebSocket connection started");
        self.state.increment_status_clients();

        // Yields the current status first, then every change
        ctx.add_stream(WatchStream::new(self.state.session.subscribe()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
                act.send(ctx, &WebSocketMessage::Ping { timestamp });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.decrement_status_clients();
        info!("Status WebSocket connection stopped");
    }
}

/// Forward every status change to the client.
impl StreamHandler<SessionStatus> for SessionStatusSocket {
    fn handle(&mut self, status: SessionStatus, ctx: &mut Self::Context) {
        self.send(ctx, &WebSocketMessage::SessionStatus { session: status });
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        warn!("Session controller is gone, closing status socket");
        ctx.stop();
    }
}

/// Handle incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionStatusSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "Binary frames are not accepted");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendError> for SessionStatusSocket {
    type Result = ();

    fn handle(&mut self, msg: SendError, ctx: &mut Self::Context) {
        self.send_error(ctx, &msg.code, &msg.message);
    }
}

/// WebSocket endpoint handler for `/ws/session`.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New status WebSocket request from: {:?}", req.connection_info().peer_addr());
    ws::start(SessionStatusSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::SessionState;

    #[test]
    fn test_commands_deserialize() {
        let msg: WebSocketMessage = serde_json::from_str(r#"{"type": "start_session"}"#).unwrap();
        assert!(matches!(
            msg,
            WebSocketMessage::StartSession { voice: None, system_instruction: None }
        ));

        let msg: WebSocketMessage =
            serde_json::from_str(r#"{"type": "start_session", "voice": "Puck"}"#).unwrap();
        match msg {
            WebSocketMessage::StartSession { voice, .. } => assert_eq!(voice.as_deref(), Some("Puck")),
            other => panic!("Wrong message type: {:?}", other),
        }

        let msg: WebSocketMessage = serde_json::from_str(r#"{"type": "end_session"}"#).unwrap();
        assert!(matches!(msg, WebSocketMessage::EndSession));
    }

    #[test]
    fn test_status_message_is_tagged() {
        let msg = WebSocketMessage::SessionStatus {
            session: SessionStatus {
                state: SessionState::Active,
                speaking: true,
                ..Default::default()
            },
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "session_status");
        assert_eq!(json["session"]["state"], "active");
        assert_eq!(json["session"]["speaking"], true);
    }

    #[test]
    fn test_error_message_creation() {
        let error_msg = WebSocketMessage::Error {
            code: "session_error".to_string(),
            message: "Microphone access was denied".to_string(),
        };

        let json = serde_json::to_string(&error_msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("session_error"));
        assert!(json.contains("Microphone access was denied"));
    }
}
