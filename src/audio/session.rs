//! # Session Controller
//!
//! Top-level state machine of the live voice session. It wires
//! microphone → codec → transport upstream and transport → codec → playback
//! downstream, and owns every per-session resource.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: nothing open; `start()` moves to Connecting
//! 2. **Connecting**: output open, transport connecting, microphone still closed
//! 3. **Active**: server acknowledged setup, microphone frames flow upstream
//! 4. back to **Idle** on `stop()`, on transport close/error, or on a device failure
//!
//! ## Threading:
//! cpal streams cannot leave the thread that created them, so the controller
//! runs on its own thread with a current-thread tokio runtime. Everything
//! else talks to it through a cloneable [`SessionHandle`].

use crate::audio::buffer::PlaybackTimeline;
use crate::audio::capture::CaptureDevice;
use crate::audio::codec::{decode_server_audio, encode_frame, AudioFrame, SERVER_AUDIO_RATE};
use crate::audio::playback::PlaybackScheduler;
use crate::config::SessionSettings;
use crate::device::AudioDevices;
use crate::error::{SessionError, SessionResult};
use crate::transport::{Connector, TransportChannel, TransportEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state of the (single) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable snapshot of the session, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// True while synthesized speech is audible
    pub speaking: bool,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Generic notice of the last failure; cleared by the next `start()`
    pub last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            speaking: false,
            session_id: None,
            started_at: None,
            last_error: None,
        }
    }
}

/// Counters across all sessions since process start.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionMetrics {
    pub sessions_started: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub audio_chunks_received: u64,
    pub malformed_chunks: u64,
    pub interruptions: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

pub type SharedMetrics = Arc<RwLock<SessionMetrics>>;

fn update_metrics(metrics: &SharedMetrics, f: impl FnOnce(&mut SessionMetrics)) {
    let mut guard = metrics.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}

/// Resources owned by the running session. Each is released exactly once.
struct ActiveSession {
    id: Uuid,
    channel: TransportChannel,
    capture: Box<dyn CaptureDevice>,
    scheduler: PlaybackScheduler,
    frames_tx: mpsc::UnboundedSender<AudioFrame>,
}

pub struct SessionController {
    connector: Box<dyn Connector>,
    devices: Box<dyn AudioDevices>,
    status_tx: watch::Sender<SessionStatus>,
    speaking_tx: Arc<watch::Sender<bool>>,
    metrics: SharedMetrics,
    active: Option<ActiveSession>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    frames_rx: Option<mpsc::UnboundedReceiver<AudioFrame>>,
}

impl SessionController {
    pub fn new(
        connector: Box<dyn Connector>,
        devices: Box<dyn AudioDevices>,
        status_tx: watch::Sender<SessionStatus>,
        metrics: SharedMetrics,
    ) -> Self {
        let (speaking_tx, _) = watch::channel(false);
        Self {
            connector,
            devices,
            status_tx,
            speaking_tx: Arc::new(speaking_tx),
            metrics,
            active: None,
            events_rx: None,
            frames_rx: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.status_tx.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    fn publish(&self, f: impl FnOnce(&mut SessionStatus)) {
        self.status_tx.send_modify(f);
    }

    /// Idle → Connecting. A no-op in any other state.
    ///
    /// The microphone is resolved and the speaker opened before any network
    /// work, so a missing device never leaves a half-open connection behind.
    ///
    /// ## Errors:
    /// `PermissionDenied` / `DeviceUnavailable` from the devices. The failure
    /// is also published as `last_error` and the session stays Idle.
    pub fn start(&mut self, settings: SessionSettings) -> SessionResult<()> {
        if self.state() != SessionState::Idle {
            debug!(state = %self.state(), "Start ignored, session already running");
            return Ok(());
        }

        let id = Uuid::new_v4();
        self.publish(|status| {
            status.state = SessionState::Connecting;
            status.speaking = false;
            status.session_id = Some(id.to_string());
            status.started_at = Some(Utc::now());
            status.last_error = None;
        });
        update_metrics(&self.metrics, |m| m.sessions_started += 1);
        info!(session_id = %id, voice = %settings.live.voice, "Starting voice session");

        if let Err(e) = self.devices.check_input(&settings.audio) {
            return Err(self.fail_start(e));
        }

        let timeline =
            PlaybackTimeline::new(settings.audio.output_sample_rate).with_speaking_signal(self.speaking_tx.clone());
        let scheduler = match PlaybackScheduler::open(self.devices.output(&settings.audio), timeline) {
            Ok(scheduler) => scheduler,
            Err(e) => return Err(self.fail_start(e)),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let channel = self.connector.connect(&settings.live, events_tx);

        self.active = Some(ActiveSession {
            id,
            channel,
            capture: self.devices.capture(&settings.audio),
            scheduler,
            frames_tx,
        });
        self.events_rx = Some(events_rx);
        self.frames_rx = Some(frames_rx);

        Ok(())
    }

    fn fail_start(&mut self, err: SessionError) -> SessionError {
        self.record_failure(&err);
        self.stop();
        err
    }

    fn record_failure(&self, err: &SessionError) {
        error!(error = %err, "Voice session failed");
        let notice = err.user_notice().to_string();
        update_metrics(&self.metrics, |m| {
            m.failures += 1;
            m.last_error = Some(notice.clone());
        });
        self.publish(|status| status.last_error = Some(notice));
    }

    /// Record a fatal error and tear the session down.
    fn fail(&mut self, err: SessionError) {
        self.record_failure(&err);
        self.stop();
    }

    /// Fatal errors end the session; the rest cost one frame or chunk and are counted.
    fn handle_error(&mut self, err: SessionError) {
        if err.is_fatal() {
            self.fail(err);
            return;
        }

        match err {
            SessionError::MalformedAudioData(cause) => {
                warn!(error = %cause, "Dropping malformed audio chunk");
                update_metrics(&self.metrics, |m| m.malformed_chunks += 1);
            }
            other => {
                debug!(error = %other, "Frame not sent");
                update_metrics(&self.metrics, |m| m.send_failures += 1);
            }
        }
    }

    /// React to one transport event, in arrival order.
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        let state = self.state();
        if state == SessionState::Idle {
            debug!(?event, "Dropping transport event for a stopped session");
            return;
        }

        match event {
            TransportEvent::Open => self.activate(),
            TransportEvent::AudioChunk(text) => self.play_chunk(&text),
            TransportEvent::Interrupted => {
                update_metrics(&self.metrics, |m| m.interruptions += 1);
                if let Some(session) = self.active.as_mut() {
                    let cursor = session.scheduler.reset();
                    info!(session_id = %session.id, cursor, "Speech interrupted");
                }
            }
            // Before setup completes, any ending means the service was never reached
            TransportEvent::Closed(cause) | TransportEvent::Error(cause) => {
                let err = if state == SessionState::Connecting {
                    SessionError::TransportConnectFailed(cause)
                } else {
                    SessionError::TransportClosedUnexpectedly(cause)
                };
                self.handle_error(err);
            }
        }
    }

    /// Connecting → Active: open the microphone.
    fn activate(&mut self) {
        if self.state() != SessionState::Connecting {
            return;
        }

        let opened = match self.active.as_mut() {
            Some(session) => session.capture.open(session.frames_tx.clone()),
            None => return,
        };

        match opened {
            Ok(()) => {
                self.publish(|status| status.state = SessionState::Active);
                info!("Voice session active");
            }
            Err(e) => self.handle_error(e),
        }
    }

    fn play_chunk(&mut self, text: &str) {
        update_metrics(&self.metrics, |m| m.audio_chunks_received += 1);
        let Some(session) = self.active.as_mut() else {
            return;
        };

        match decode_server_audio(text, SERVER_AUDIO_RATE) {
            Ok(buffer) if buffer.is_empty() => {}
            Ok(buffer) => {
                session.scheduler.schedule(buffer);
            }
            Err(e) => self.handle_error(e),
        }
    }

    /// Encode one microphone frame and send it. Only while Active.
    pub fn on_frame(&mut self, frame: AudioFrame) {
        if self.state() != SessionState::Active {
            return;
        }
        let Some(session) = self.active.as_ref() else {
            return;
        };

        match session.channel.send(encode_frame(&frame)) {
            Ok(()) => update_metrics(&self.metrics, |m| m.frames_sent += 1),
            Err(e) => self.handle_error(e),
        }
    }

    /// Any state → Idle. Closes capture, playback and channel. Never fails.
    pub fn stop(&mut self) {
        if let Some(mut session) = self.active.take() {
            session.capture.close();
            session.scheduler.close();
            session.channel.close();
            info!(session_id = %session.id, "Voice session stopped");
        }
        self.events_rx = None;
        self.frames_rx = None;

        self.publish(|status| {
            status.state = SessionState::Idle;
            status.speaking = false;
        });
    }

    /// Drive the controller until every [`SessionHandle`] is dropped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let mut speaking_rx = self.speaking_tx.subscribe();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Start { settings, reply }) => {
                        let result = self.start(*settings).map(|_| self.status());
                        let _ = reply.send(result);
                    }
                    Some(SessionCommand::Stop { reply }) => {
                        self.stop();
                        let _ = reply.send(self.status());
                    }
                    None => break,
                },
                Some(event) = recv_or_pending(&mut self.events_rx) => {
                    self.on_transport_event(event);
                }
                Some(frame) = recv_or_pending(&mut self.frames_rx) => {
                    self.on_frame(frame);
                }
                Ok(()) = speaking_rx.changed() => {
                    let speaking = *speaking_rx.borrow_and_update();
                    if self.state() != SessionState::Idle || !speaking {
                        self.publish(|status| status.speaking = speaking);
                    }
                }
            }
        }

        self.stop();
        info!("Session controller stopped");
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Requests sent from handles to the controller thread.
pub enum SessionCommand {
    Start {
        settings: Box<SessionSettings>,
        reply: oneshot::Sender<SessionResult<SessionStatus>>,
    },
    Stop {
        reply: oneshot::Sender<SessionStatus>,
    },
}

/// Cloneable front door to the controller thread.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    metrics: SharedMetrics,
}

impl SessionHandle {
    /// Start the controller on a dedicated thread.
    pub fn spawn<D, C>(devices: D, connector: C) -> std::io::Result<Self>
    where
        D: AudioDevices + 'static,
        C: Connector + 'static,
    {
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let metrics = SharedMetrics::default();
        let controller_metrics = metrics.clone();

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

        std::thread::Builder::new()
            .name("voice-session".to_string())
            .spawn(move || {
                let controller =
                    SessionController::new(Box::new(connector), Box::new(devices), status_tx, controller_metrics);
                runtime.block_on(controller.run(commands_rx));
            })?;

        Ok(Self {
            commands: commands_tx,
            status: status_rx,
            metrics,
        })
    }

    /// Ask for a new session; returns the status right after the request.
    pub async fn start(&self, settings: SessionSettings) -> SessionResult<SessionStatus> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::Start {
                settings: Box::new(settings),
                reply,
            })
            .map_err(|_| SessionError::ControllerUnavailable)?;

        response.await.map_err(|_| SessionError::ControllerUnavailable)?
    }

    pub async fn stop(&self) -> SessionResult<SessionStatus> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::Stop { reply })
            .map_err(|_| SessionError::ControllerUnavailable)?;

        response.await.map_err(|_| SessionError::ControllerUnavailable)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
