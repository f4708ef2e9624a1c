//! Streaming session engine
//!
//! [`StreamingSession`] owns the session loop: one task that receives
//! [`Event`]s, runs them through [`reduce`], publishes the resulting state and
//! executes the effects. Background work (capture thread, send timer,
//! connection task) only ever posts events back to the loop, so session state
//! has a single writer and needs no lock.
//!
//! # Session Flow
//!
//! 1. `start_listening()` - validate config, post `Activate`
//! 2. `Configure` - token + URL, open and start the capture buffer (inline,
//!    on the blocking pool); capture failures are posted straight to the loop
//! 3. `Connect` - open the WebSocket; a pump task turns connection events
//!    into session events
//! 4. `ConnectionOpened` → auth frame, then the send timer
//! 5. `stop_listening()` → capture stops; the timer flushes and the loop sends
//!    the end-of-stream marker
//! 6. Final result or server close → teardown, terminal event

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{AudioCaptureBuffer, AudioDevice, CaptureError};
use crate::auth::AuthTokenProvider;
use crate::config::{AsrConfig, ConfigError};
use crate::state_machine::{reduce, Effect, Event, SessionOptions, SessionState, State};
use crate::streaming::{
    connection_url, spawn_send_timer, AuthFrame, Connection, ConnectionEvent, ErrorCode,
    ResponseParser, ResultDispatcher, SendOptions, SenderEvent, SessionListener, END_OF_STREAM,
};

/// Errors returned synchronously by [`StreamingSession`] calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Required server settings are missing
    ConfigIncomplete(Vec<&'static str>),
    /// A setting holds an unusable value
    ConfigInvalid(String),
    /// A session is already in progress
    SessionActive,
    /// The engine was destroyed
    EngineStopped,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::ConfigIncomplete(missing) => {
                write!(f, "Configuration incomplete, missing: {}", missing.join(", "))
            }
            SessionError::ConfigInvalid(e) => write!(f, "Invalid configuration: {}", e),
            SessionError::SessionActive => write!(f, "A session is already active"),
            SessionError::EngineStopped => write!(f, "Engine has been destroyed"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Handle to the streaming engine
///
/// Must be created inside a tokio runtime. One session is active at a time;
/// a new one may be started once the previous one reached `Closed` or
/// `Error`.
pub struct StreamingSession {
    tx: mpsc::UnboundedSender<Event>,
    state_rx: watch::Receiver<SessionState>,
    options: SessionOptions,
    config_error: Option<ConfigError>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingSession {
    /// Spawn the session loop and the dispatcher worker
    pub fn new(
        config: AsrConfig,
        device: impl AudioDevice,
        listener: impl SessionListener,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let options = SessionOptions {
            partial_results: config.enable_partial_results,
            unlimited_duration: config.unlimited_duration,
        };
        let config_error = config.validate().err();

        let runtime = SessionRuntime {
            parser: ResponseParser::new(config.pretty_print),
            config,
            device: Arc::new(device),
            dispatcher: ResultDispatcher::spawn(listener),
            events: tx.clone(),
            active: None,
        };
        let handle = tokio::spawn(run_session_loop(runtime, rx, state_tx));

        Self {
            tx,
            state_rx,
            options,
            config_error,
            loop_handle: Mutex::new(Some(handle)),
        }
    }

    /// Activate a session and start listening
    pub fn start_listening(&self) -> Result<(), SessionError> {
        if let Some(e) = &self.config_error {
            log::warn!("Engine: cannot start: {}", e);
            return Err(match e {
                ConfigError::Incomplete(missing) => SessionError::ConfigIncomplete(missing.clone()),
                other => SessionError::ConfigInvalid(other.to_string()),
            });
        }
        if self.state().is_active() {
            return Err(SessionError::SessionActive);
        }
        self.post(Event::Activate {
            options: self.options,
        })
    }

    /// Stop recording; results already in flight are still delivered
    pub fn stop_listening(&self) -> Result<(), SessionError> {
        self.post(Event::StopRequested)
    }

    /// Abandon the session. The listener receives an empty final result.
    pub fn cancel(&self) -> Result<(), SessionError> {
        self.post(Event::Cancel)
    }

    /// Tear down without further events and stop the engine
    ///
    /// Waits for the loop to exit and queued events to be delivered.
    pub async fn destroy(&self) {
        let _ = self.tx.send(Event::Destroy);

        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("Engine: session loop ended abnormally: {}", e);
            }
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    fn post(&self, event: Event) -> Result<(), SessionError> {
        self.tx.send(event).map_err(|_| SessionError::EngineStopped)
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        let _ = self.tx.send(Event::Destroy);
    }
}

/// Resources of the current session
struct ActiveSession {
    id: Uuid,
    url: String,
    auth_frame: String,
    options: SessionOptions,
    capture: Arc<AudioCaptureBuffer>,
    connection: Option<Arc<Connection>>,
    /// Cancels the send timer and the inbound pump
    cancel: CancellationToken,
}

/// Effect executor, owned by the session loop
struct SessionRuntime {
    config: AsrConfig,
    device: Arc<dyn AudioDevice>,
    parser: ResponseParser,
    dispatcher: ResultDispatcher,
    events: mpsc::UnboundedSender<Event>,
    active: Option<ActiveSession>,
}

impl SessionRuntime {
    /// Execute one effect. Effects that complete inline return their outcome
    /// as a follow-up event.
    async fn run(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Configure { id, options } => Some(self.configure(id, options).await),
            Effect::Connect { id } => {
                self.connect(id);
                None
            }
            Effect::SendAuth { id } => {
                if let Some((active, connection)) = self.connected(id) {
                    log::info!("Engine: sending auth frame");
                    if let Err(e) = connection.send_text(active.auth_frame.clone()) {
                        log::warn!("Engine: auth frame not sent: {}", e);
                    }
                }
                None
            }
            Effect::StartSendTimer { id } => {
                self.start_send_timer(id);
                None
            }
            Effect::StopCapture { id } => {
                if let Some(active) = self.active_for(id) {
                    active.capture.stop();
                }
                None
            }
            Effect::SendEndOfStream { id } => {
                if let Some((_, connection)) = self.connected(id) {
                    log::info!("Engine: sending end of stream");
                    if let Err(e) = connection.send_text(END_OF_STREAM) {
                        log::warn!("Engine: end of stream not sent: {}", e);
                    }
                }
                None
            }
            Effect::Teardown { id } => {
                if self.active.as_ref().is_some_and(|a| a.id == id) {
                    self.teardown();
                }
                None
            }
            Effect::Notify(event) => {
                self.dispatcher.post(event);
                None
            }
        }
    }

    async fn configure(&mut self, id: Uuid, options: SessionOptions) -> Event {
        // A previous session that ended without teardown is released first
        self.teardown();

        let config = &self.config;
        let (Some(endpoint), Some(asr_system), Some(app_id), Some(app_secret)) = (
            config.endpoint.as_deref(),
            config.asr_system.as_deref(),
            config.app_id.as_deref(),
            config.app_secret.as_deref(),
        ) else {
            log::warn!("Engine: config incomplete at activation");
            return Event::ConfigIncomplete { id };
        };
        if config.validate().is_err() {
            log::warn!("Engine: config incomplete at activation");
            return Event::ConfigIncomplete { id };
        }

        let url = connection_url(endpoint, asr_system, config.sample_rate);
        let token = AuthTokenProvider::new(app_id, app_secret).generate();
        let auth_frame =
            AuthFrame::new(&token, config.postprocessors(), &config.custom_info).to_json();

        let device = self.device.clone();
        let sample_rate = config.sample_rate;
        let max_secs = config.max_buffer_secs;
        let events = self.events.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let capture = AudioCaptureBuffer::open(device.as_ref(), sample_rate, max_secs)?;
            // Capture failures reach the loop even before the send timer runs
            capture.on_failure(move |code| {
                let _ = events.send(Event::CaptureFailed { id, code });
            });
            capture.start()?;
            Ok::<_, CaptureError>(capture)
        })
        .await;

        let capture = match opened {
            Ok(Ok(capture)) => capture,
            Ok(Err(e)) => {
                log::error!("Engine: capture failed to start: {}", e);
                return Event::CaptureFailed { id, code: e.code() };
            }
            Err(e) => {
                log::error!("Engine: capture setup task failed: {}", e);
                return Event::CaptureFailed {
                    id,
                    code: ErrorCode::DeviceInitFailed,
                };
            }
        };

        log::info!("Engine: session {} configured for {}", id, url);
        self.active = Some(ActiveSession {
            id,
            url,
            auth_frame,
            options,
            capture: Arc::new(capture),
            connection: None,
            cancel: CancellationToken::new(),
        });
        Event::Configured { id }
    }

    fn connect(&mut self, id: Uuid) {
        let connect_timeout = self.config.connect_timeout();
        let events = self.events.clone();
        let parser = self.parser;

        let Some(active) = self.active_for(id) else {
            return;
        };

        let (connection, mut inbound) = Connection::open(active.url.clone(), connect_timeout);
        active.connection = Some(Arc::new(connection));

        let cancel = active.cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = inbound.recv() => next,
                };
                let Some(conn_event) = next else {
                    break;
                };

                let event = match conn_event {
                    ConnectionEvent::Opened => Event::ConnectionOpened { id },
                    ConnectionEvent::Message(text) => Event::ServerMessage {
                        id,
                        message: parser.parse(&text),
                    },
                    ConnectionEvent::Closed { code, reason } => {
                        Event::ConnectionClosed { id, code, reason }
                    }
                    ConnectionEvent::Failed(e) => Event::ConnectionFailed { id, code: e.code() },
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            log::debug!("Engine: inbound pump for {} exiting", id);
        });
    }

    fn start_send_timer(&mut self, id: Uuid) {
        let timing = self.config.send_timing();
        let stop_on_pause = self.config.stop_on_pause;
        let events = self.events.clone();

        let Some((active, connection)) = self.connected(id) else {
            return;
        };

        let options = SendOptions {
            truncate: active.options.unlimited_duration,
            stop_on_pause,
        };

        spawn_send_timer(
            active.capture.clone(),
            connection,
            timing,
            options,
            active.cancel.child_token(),
            move |sender_event| {
                let event = match sender_event {
                    SenderEvent::AudioSent { level_db, .. } => Event::AudioSent { id, level_db },
                    SenderEvent::PauseDetected => Event::PauseDetected { id },
                    SenderEvent::EndOfStreamDue => Event::EndOfStreamDue { id },
                    SenderEvent::CaptureFailed(code) => Event::CaptureFailed { id, code },
                };
                let _ = events.send(event);
            },
        );
    }

    fn active_for(&mut self, id: Uuid) -> Option<&mut ActiveSession> {
        self.active.as_mut().filter(|a| a.id == id)
    }

    fn connected(&mut self, id: Uuid) -> Option<(&mut ActiveSession, Arc<Connection>)> {
        let active = self.active_for(id)?;
        let connection = active.connection.clone()?;
        Some((active, connection))
    }

    /// Cancel the timer, close the connection, release the device. Idempotent.
    fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        if let Some(connection) = &active.connection {
            connection.close();
        }
        active.capture.release();
        log::info!("Engine: session {} torn down", active.id);
    }

    async fn shutdown(mut self) {
        self.teardown();
        self.dispatcher.shutdown().await;
    }
}

async fn run_session_loop(
    mut runtime: SessionRuntime,
    mut rx: mpsc::UnboundedReceiver<Event>,
    state_tx: watch::Sender<SessionState>,
) {
    let mut state = State::default();
    log::info!("Session loop started");

    while let Some(event) = rx.recv().await {
        let destroy = matches!(event, Event::Destroy);

        // Follow-up events from inline effects run before anything else
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            log::debug!("Received event: {:?}", event);

            let old_discriminant = std::mem::discriminant(&state);
            let (next, effects) = reduce(&state, event);
            if old_discriminant != std::mem::discriminant(&next) {
                log::info!("State transition: {:?} -> {:?}", state.phase(), next.phase());
            }

            state = next;
            state_tx.send_replace(state.phase());

            for effect in effects {
                if let Some(follow_up) = runtime.run(effect).await {
                    pending.push_back(follow_up);
                }
            }
        }

        if destroy {
            log::info!("Destroy requested, shutting down session loop");
            break;
        }
    }

    runtime.shutdown().await;
    log::info!("Session loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioError, AudioSource};
    use crate::streaming::RecognitionEvent;

    struct NoDevice;

    impl AudioDevice for NoDevice {
        fn open(&self, _sample_rate: u32) -> Result<Box<dyn AudioSource>, AudioError> {
            Err(AudioError::NoInputDevice)
        }
    }

    fn complete_config() -> AsrConfig {
        AsrConfig {
            endpoint: Some("ws://127.0.0.1:9".to_string()),
            asr_system: Some("en".to_string()),
            app_id: Some("app".to_string()),
            app_secret: Some("secret".to_string()),
            ..AsrConfig::default()
        }
    }

    #[tokio::test]
    async fn test_incomplete_config_is_rejected_without_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = StreamingSession::new(AsrConfig::default(), NoDevice, tx);

        match engine.start_listening() {
            Err(SessionError::ConfigIncomplete(missing)) => assert_eq!(missing.len(), 4),
            other => panic!("expected ConfigIncomplete, got {:?}", other),
        }
        assert_eq!(engine.state(), SessionState::Idle);

        engine.destroy().await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_zero_sample_rate_is_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = AsrConfig {
            sample_rate: 0,
            ..complete_config()
        };
        let engine = StreamingSession::new(config, NoDevice, tx);

        assert!(matches!(
            engine.start_listening(),
            Err(SessionError::ConfigInvalid(_))
        ));
        engine.destroy().await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_device_failure_reports_error_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = StreamingSession::new(complete_config(), NoDevice, tx);
        let mut state = engine.subscribe_state();

        engine.start_listening().unwrap();
        state
            .wait_for(|s| matches!(s, SessionState::Error(_)))
            .await
            .unwrap();

        engine.destroy().await;
        assert_eq!(
            rx.recv().await,
            Some(RecognitionEvent::Error(ErrorCode::DeviceInitFailed))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_calls_after_destroy_fail() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = StreamingSession::new(complete_config(), NoDevice, tx);
        engine.destroy().await;
        engine.destroy().await;

        assert_eq!(engine.start_listening(), Err(SessionError::EngineStopped));
        assert_eq!(engine.cancel(), Err(SessionError::EngineStopped));
    }
}
