//! Session state machine
//!
//! Single-writer pattern: every transition goes through [`reduce`], which
//! returns the next state and the effects the session loop must run. The
//! reducer does no I/O; the loop in [`crate::engine`] executes effects and
//! feeds their outcomes back in as events.
//!
//! Events raised by a session's background tasks carry that session's id.
//! Once the session is torn down (or a new one is activated) those events are
//! stale and ignored.

use uuid::Uuid;

use crate::streaming::{ErrorCode, InboundMessage, RecognitionEvent, Status};

/// Per-activation options, fixed for the lifetime of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Deliver non-final hypotheses
    pub partial_results: bool,
    /// Deliver server finals as semi-final partials and keep streaming
    pub unlimited_duration: bool,
}

/// Authoritative session state, owned by the session loop
#[derive(Debug, Clone, Default, PartialEq)]
pub enum State {
    #[default]
    Idle,
    /// Token, URL and capture buffer are being prepared
    Configuring {
        session_id: Uuid,
        options: SessionOptions,
    },
    /// Recording; waiting for the connection to open
    Connecting {
        session_id: Uuid,
        options: SessionOptions,
    },
    /// Connected; audio frames are flowing
    Streaming {
        session_id: Uuid,
        options: SessionOptions,
    },
    /// Capture stopped; waiting for the server to finish
    Finishing {
        session_id: Uuid,
        options: SessionOptions,
        /// The connection opened (auth sent, timer running)
        connected: bool,
        eos_sent: bool,
    },
    Closed,
    Error {
        code: ErrorCode,
    },
}

/// Consumer-visible summary of [`State`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Configuring,
    Connecting,
    Streaming,
    Finishing,
    Closed,
    Error(ErrorCode),
}

impl SessionState {
    /// A session is in progress; another activation would be rejected
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Configuring
                | SessionState::Connecting
                | SessionState::Streaming
                | SessionState::Finishing
        )
    }
}

impl State {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Configuring { session_id, .. }
            | State::Connecting { session_id, .. }
            | State::Streaming { session_id, .. }
            | State::Finishing { session_id, .. } => Some(*session_id),
            State::Idle | State::Closed | State::Error { .. } => None,
        }
    }

    pub fn phase(&self) -> SessionState {
        match self {
            State::Idle => SessionState::Idle,
            State::Configuring { .. } => SessionState::Configuring,
            State::Connecting { .. } => SessionState::Connecting,
            State::Streaming { .. } => SessionState::Streaming,
            State::Finishing { .. } => SessionState::Finishing,
            State::Closed => SessionState::Closed,
            State::Error { code } => SessionState::Error(*code),
        }
    }
}

/// Inputs to the reducer: caller requests and background task outcomes
#[derive(Debug, Clone)]
pub enum Event {
    /// Caller asked to start listening
    Activate { options: SessionOptions },
    /// Caller asked to stop recording and finish
    StopRequested,
    /// Caller abandoned the session
    Cancel,
    /// Engine shutdown
    Destroy,

    /// Capture buffer opened and recording
    Configured { id: Uuid },
    /// Server settings were missing at activation; nothing was started
    ConfigIncomplete { id: Uuid },
    CaptureFailed { id: Uuid, code: ErrorCode },
    /// The send timer saw the input go quiet
    PauseDetected { id: Uuid },
    AudioSent { id: Uuid, level_db: f32 },
    /// Capture stopped and all audio is queued; the marker may go out
    EndOfStreamDue { id: Uuid },

    ConnectionOpened { id: Uuid },
    ConnectionClosed {
        id: Uuid,
        code: Option<u16>,
        reason: String,
    },
    ConnectionFailed { id: Uuid, code: ErrorCode },
    ServerMessage { id: Uuid, message: InboundMessage },
}

impl Event {
    fn session_id(&self) -> Option<Uuid> {
        match self {
            Event::Activate { .. } | Event::StopRequested | Event::Cancel | Event::Destroy => None,
            Event::Configured { id }
            | Event::ConfigIncomplete { id }
            | Event::CaptureFailed { id, .. }
            | Event::PauseDetected { id }
            | Event::AudioSent { id, .. }
            | Event::EndOfStreamDue { id }
            | Event::ConnectionOpened { id }
            | Event::ConnectionClosed { id, .. }
            | Event::ConnectionFailed { id, .. }
            | Event::ServerMessage { id, .. } => Some(*id),
        }
    }
}

/// Work for the session loop
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Build the token and URL, open and start the capture buffer
    Configure { id: Uuid, options: SessionOptions },
    Connect { id: Uuid },
    /// Send the auth frame (always the first frame on the connection)
    SendAuth { id: Uuid },
    StartSendTimer { id: Uuid },
    StopCapture { id: Uuid },
    SendEndOfStream { id: Uuid },
    /// Cancel the timer, close the connection, release the device
    Teardown { id: Uuid },
    Notify(RecognitionEvent),
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Events with a stale session id are ignored
/// - Every failure goes through one path: teardown first, then a single
///   `Error` notification
/// - Terminal states (`Closed`, `Error`) ignore everything but `Activate`
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use RecognitionEvent as Rec;

    if let Some(eid) = event.session_id() {
        if state.session_id() != Some(eid) {
            log::debug!("Ignoring stale event for session {}", eid);
            return (state.clone(), vec![]);
        }
    }

    match (state, event) {
        // -----------------
        // Activation
        // -----------------
        (State::Idle | State::Closed | State::Error { .. }, Activate { options }) => {
            let id = Uuid::new_v4();
            (
                State::Configuring {
                    session_id: id,
                    options,
                },
                vec![Configure { id, options }],
            )
        }
        (_, Activate { .. }) => {
            log::warn!("Activate ignored: a session is already active");
            (state.clone(), vec![])
        }

        // -----------------
        // Configuring
        // -----------------
        (
            State::Configuring {
                session_id,
                options,
            },
            Configured { .. },
        ) => (
            State::Connecting {
                session_id: *session_id,
                options: *options,
            },
            vec![
                Notify(Rec::Ready),
                Notify(Rec::BeginningOfSpeech),
                Connect { id: *session_id },
            ],
        ),

        (State::Configuring { session_id, .. }, ConfigIncomplete { .. }) => {
            (State::Idle, vec![Teardown { id: *session_id }])
        }

        // -----------------
        // Connection open
        // -----------------
        (
            State::Connecting {
                session_id,
                options,
            },
            ConnectionOpened { .. },
        ) => (
            State::Streaming {
                session_id: *session_id,
                options: *options,
            },
            vec![
                SendAuth { id: *session_id },
                StartSendTimer { id: *session_id },
            ],
        ),
        // Stopped before the connection opened: the timer still flushes what
        // was recorded and sends the marker
        (
            State::Finishing {
                session_id,
                options,
                connected: false,
                eos_sent,
            },
            ConnectionOpened { .. },
        ) => (
            State::Finishing {
                session_id: *session_id,
                options: *options,
                connected: true,
                eos_sent: *eos_sent,
            },
            vec![
                SendAuth { id: *session_id },
                StartSendTimer { id: *session_id },
            ],
        ),

        // -----------------
        // Stop
        // -----------------
        (
            State::Connecting {
                session_id,
                options,
            },
            StopRequested | PauseDetected { .. },
        ) => begin_finishing(*session_id, *options, false),
        (
            State::Streaming {
                session_id,
                options,
            },
            StopRequested | PauseDetected { .. },
        ) => begin_finishing(*session_id, *options, true),

        // -----------------
        // Sender progress
        // -----------------
        (
            State::Streaming { .. } | State::Finishing { .. },
            AudioSent { level_db, .. },
        ) => (state.clone(), vec![Notify(Rec::VolumeLevel(level_db))]),

        (
            State::Finishing {
                session_id,
                options,
                connected: true,
                eos_sent: false,
            },
            EndOfStreamDue { .. },
        ) => (
            State::Finishing {
                session_id: *session_id,
                options: *options,
                connected: true,
                eos_sent: true,
            },
            vec![SendEndOfStream { id: *session_id }],
        ),
        // Capture stopped on its own while streaming
        (
            State::Streaming {
                session_id,
                options,
            },
            EndOfStreamDue { .. },
        ) => (
            State::Finishing {
                session_id: *session_id,
                options: *options,
                connected: true,
                eos_sent: true,
            },
            vec![
                Notify(Rec::EndOfSpeech),
                SendEndOfStream { id: *session_id },
            ],
        ),

        // -----------------
        // Failures
        // -----------------
        (_, CaptureFailed { id, code }) | (_, ConnectionFailed { id, code }) => fail(id, code),

        (
            State::Finishing {
                session_id,
                eos_sent: true,
                ..
            },
            ConnectionClosed { code, reason, .. },
        ) => {
            log::info!(
                "Session {} closed by server after end of stream (code {:?}, reason {:?})",
                session_id,
                code,
                reason
            );
            (
                State::Closed,
                vec![
                    Teardown { id: *session_id },
                    Notify(Rec::FinalHypotheses { hypotheses: vec![] }),
                ],
            )
        }
        (_, ConnectionClosed { id, code, reason }) => {
            log::warn!(
                "Session {} closed by server before end of stream (code {:?}, reason {:?})",
                id,
                code,
                reason
            );
            fail(id, ErrorCode::SpeechTimeout)
        }

        // -----------------
        // Inbound messages
        // -----------------
        (
            State::Streaming { .. } | State::Finishing { .. },
            ServerMessage { id, message },
        ) => on_server_message(state, id, message),

        // -----------------
        // Cancel / Destroy
        // -----------------
        (
            State::Configuring { session_id, .. }
            | State::Connecting { session_id, .. }
            | State::Streaming { session_id, .. }
            | State::Finishing { session_id, .. },
            Cancel,
        ) => (
            State::Closed,
            vec![
                Teardown { id: *session_id },
                Notify(Rec::FinalHypotheses { hypotheses: vec![] }),
            ],
        ),
        (
            State::Configuring { session_id, .. }
            | State::Connecting { session_id, .. }
            | State::Streaming { session_id, .. }
            | State::Finishing { session_id, .. },
            Destroy,
        ) => (State::Closed, vec![Teardown { id: *session_id }]),

        // Everything else (stop when idle, late sender events, ...) is a no-op
        (_, event) => {
            log::debug!("No transition for {:?} in {:?}", event, state.phase());
            (state.clone(), vec![])
        }
    }
}

fn begin_finishing(session_id: Uuid, options: SessionOptions, connected: bool) -> (State, Vec<Effect>) {
    (
        State::Finishing {
            session_id,
            options,
            connected,
            eos_sent: false,
        },
        vec![
            Effect::StopCapture { id: session_id },
            Effect::Notify(RecognitionEvent::EndOfSpeech),
        ],
    )
}

fn fail(id: Uuid, code: ErrorCode) -> (State, Vec<Effect>) {
    log::error!("Session {} failed: {}", id, code);
    (
        State::Error { code },
        vec![
            Effect::Teardown { id },
            Effect::Notify(RecognitionEvent::Error(code)),
        ],
    )
}

fn on_server_message(state: &State, id: Uuid, message: InboundMessage) -> (State, Vec<Effect>) {
    let options = match state {
        State::Streaming { options, .. } | State::Finishing { options, .. } => *options,
        _ => return (state.clone(), vec![]),
    };

    match message {
        InboundMessage::ParseError { cause } => {
            log::error!("Malformed server message: {}", cause);
            fail(id, ErrorCode::ProtocolParseError)
        }
        InboundMessage::Ack { status } => match ErrorCode::from_status(status) {
            None => (state.clone(), vec![]),
            Some(code) => fail(id, code),
        },
        InboundMessage::Result {
            status,
            is_final,
            hypotheses,
            raw_status,
        } => {
            if status != Status::Success {
                log::warn!("Server result with status {}", raw_status);
                return match ErrorCode::from_status(status) {
                    Some(code) => fail(id, code),
                    None => (state.clone(), vec![]),
                };
            }

            if !is_final {
                if options.partial_results && !hypotheses.is_empty() {
                    return (
                        state.clone(),
                        vec![Effect::Notify(RecognitionEvent::PartialHypotheses {
                            hypotheses,
                            semi_final: false,
                        })],
                    );
                }
                return (state.clone(), vec![]);
            }

            if hypotheses.is_empty() {
                return fail(id, ErrorCode::SpeechTimeout);
            }

            if options.unlimited_duration {
                return (
                    state.clone(),
                    vec![Effect::Notify(RecognitionEvent::PartialHypotheses {
                        hypotheses,
                        semi_final: true,
                    })],
                );
            }

            let mut effects = Vec::new();
            if matches!(state, State::Streaming { .. }) {
                effects.push(Effect::StopCapture { id });
                effects.push(Effect::Notify(RecognitionEvent::EndOfSpeech));
            }
            effects.push(Effect::Teardown { id });
            effects.push(Effect::Notify(RecognitionEvent::FinalHypotheses { hypotheses }));
            (State::Closed, effects)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SessionOptions {
        SessionOptions::default()
    }

    fn streaming(id: Uuid, options: SessionOptions) -> State {
        State::Streaming {
            session_id: id,
            options,
        }
    }

    fn final_result(hypotheses: &[&str]) -> InboundMessage {
        InboundMessage::Result {
            status: Status::Success,
            is_final: true,
            hypotheses: hypotheses.iter().map(|h| h.to_string()).collect(),
            raw_status: 0,
        }
    }

    fn partial_result(hypotheses: &[&str]) -> InboundMessage {
        InboundMessage::Result {
            status: Status::Success,
            is_final: false,
            hypotheses: hypotheses.iter().map(|h| h.to_string()).collect(),
            raw_status: 0,
        }
    }

    fn notifications(effects: &[Effect]) -> Vec<RecognitionEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn errors(effects: &[Effect]) -> usize {
        notifications(effects)
            .iter()
            .filter(|e| matches!(e, RecognitionEvent::Error(_)))
            .count()
    }

    #[test]
    fn idle_activate_transitions_to_configuring() {
        let (next, effects) = reduce(&State::Idle, Event::Activate { options: options() });
        let State::Configuring { session_id, .. } = next else {
            panic!("expected Configuring, got {:?}", next);
        };
        assert_eq!(
            effects,
            vec![Effect::Configure {
                id: session_id,
                options: options()
            }]
        );
    }

    #[test]
    fn activate_while_active_is_ignored() {
        let state = streaming(Uuid::new_v4(), options());
        let (next, effects) = reduce(&state, Event::Activate { options: options() });
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn terminal_states_can_reactivate_with_new_id() {
        for state in [
            State::Closed,
            State::Error {
                code: ErrorCode::SpeechTimeout,
            },
        ] {
            let (next, _) = reduce(&state, Event::Activate { options: options() });
            assert!(matches!(next, State::Configuring { .. }));
        }
    }

    #[test]
    fn configured_emits_ready_and_connects() {
        let id = Uuid::new_v4();
        let state = State::Configuring {
            session_id: id,
            options: options(),
        };
        let (next, effects) = reduce(&state, Event::Configured { id });

        assert!(matches!(next, State::Connecting { .. }));
        assert_eq!(
            effects,
            vec![
                Effect::Notify(RecognitionEvent::Ready),
                Effect::Notify(RecognitionEvent::BeginningOfSpeech),
                Effect::Connect { id },
            ]
        );
    }

    #[test]
    fn device_failure_while_configuring_is_fatal() {
        let id = Uuid::new_v4();
        let state = State::Configuring {
            session_id: id,
            options: options(),
        };
        let (next, effects) = reduce(
            &state,
            Event::CaptureFailed {
                id,
                code: ErrorCode::DeviceInitFailed,
            },
        );

        assert_eq!(
            next,
            State::Error {
                code: ErrorCode::DeviceInitFailed
            }
        );
        assert_eq!(
            effects,
            vec![
                Effect::Teardown { id },
                Effect::Notify(RecognitionEvent::Error(ErrorCode::DeviceInitFailed)),
            ]
        );
    }

    #[test]
    fn incomplete_config_returns_to_idle_silently() {
        let id = Uuid::new_v4();
        let state = State::Configuring {
            session_id: id,
            options: options(),
        };
        let (next, effects) = reduce(&state, Event::ConfigIncomplete { id });
        assert_eq!(next, State::Idle);
        assert_eq!(effects, vec![Effect::Teardown { id }]);
    }

    #[test]
    fn open_sends_auth_before_starting_timer() {
        let id = Uuid::new_v4();
        let state = State::Connecting {
            session_id: id,
            options: options(),
        };
        let (next, effects) = reduce(&state, Event::ConnectionOpened { id });

        assert!(matches!(next, State::Streaming { .. }));
        assert_eq!(
            effects,
            vec![Effect::SendAuth { id }, Effect::StartSendTimer { id }]
        );
    }

    #[test]
    fn stale_event_is_ignored() {
        let id = Uuid::new_v4();
        let state = State::Connecting {
            session_id: id,
            options: options(),
        };
        let (next, effects) = reduce(
            &state,
            Event::ConnectionOpened {
                id: Uuid::new_v4(),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());

        // Events from a torn-down session never reach a terminal state
        let (next, effects) = reduce(
            &State::Closed,
            Event::ConnectionFailed {
                id,
                code: ErrorCode::ConnectionFailed,
            },
        );
        assert_eq!(next, State::Closed);
        assert!(effects.is_empty());
    }

    // =========================================================================
    // Stop and end of stream
    // =========================================================================

    #[test]
    fn stop_emits_end_of_speech_and_stops_capture() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&streaming(id, options()), Event::StopRequested);

        assert_eq!(
            next,
            State::Finishing {
                session_id: id,
                options: options(),
                connected: true,
                eos_sent: false,
            }
        );
        assert_eq!(
            effects,
            vec![
                Effect::StopCapture { id },
                Effect::Notify(RecognitionEvent::EndOfSpeech),
            ]
        );

        // A second stop is a no-op
        let (again, effects) = reduce(&next, Event::StopRequested);
        assert_eq!(again, next);
        assert!(effects.is_empty());
    }

    #[test]
    fn pause_behaves_like_stop() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&streaming(id, options()), Event::PauseDetected { id });
        assert!(matches!(next, State::Finishing { .. }));
        assert!(effects.contains(&Effect::StopCapture { id }));
    }

    #[test]
    fn end_of_stream_is_sent_exactly_once() {
        let id = Uuid::new_v4();
        let (finishing, _) = reduce(&streaming(id, options()), Event::StopRequested);

        let (next, effects) = reduce(&finishing, Event::EndOfStreamDue { id });
        assert_eq!(effects, vec![Effect::SendEndOfStream { id }]);
        assert!(matches!(next, State::Finishing { eos_sent: true, .. }));

        let (_, effects) = reduce(&next, Event::EndOfStreamDue { id });
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_before_open_finishes_after_open() {
        let id = Uuid::new_v4();
        let connecting = State::Connecting {
            session_id: id,
            options: options(),
        };
        let (finishing, _) = reduce(&connecting, Event::StopRequested);
        assert!(matches!(
            finishing,
            State::Finishing {
                connected: false,
                ..
            }
        ));

        let (next, effects) = reduce(&finishing, Event::ConnectionOpened { id });
        assert!(matches!(
            next,
            State::Finishing {
                connected: true,
                eos_sent: false,
                ..
            }
        ));
        assert_eq!(
            effects,
            vec![Effect::SendAuth { id }, Effect::StartSendTimer { id }]
        );
    }

    #[test]
    fn close_after_end_of_stream_is_clean() {
        let id = Uuid::new_v4();
        let state = State::Finishing {
            session_id: id,
            options: options(),
            connected: true,
            eos_sent: true,
        };
        let (next, effects) = reduce(
            &state,
            Event::ConnectionClosed {
                id,
                code: Some(1000),
                reason: String::new(),
            },
        );

        assert_eq!(next, State::Closed);
        assert_eq!(errors(&effects), 0);
        assert_eq!(
            notifications(&effects),
            vec![RecognitionEvent::FinalHypotheses { hypotheses: vec![] }]
        );
        assert_eq!(effects[0], Effect::Teardown { id });
    }

    #[test]
    fn close_before_end_of_stream_is_speech_timeout() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &streaming(id, options()),
            Event::ConnectionClosed {
                id,
                code: None,
                reason: String::new(),
            },
        );

        assert_eq!(
            next,
            State::Error {
                code: ErrorCode::SpeechTimeout
            }
        );
        assert_eq!(
            notifications(&effects),
            vec![RecognitionEvent::Error(ErrorCode::SpeechTimeout)]
        );
        assert_eq!(effects[0], Effect::Teardown { id });

        // Nothing more after the error
        let (_, effects) = reduce(
            &next,
            Event::ConnectionClosed {
                id,
                code: None,
                reason: String::new(),
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn volume_is_forwarded() {
        let id = Uuid::new_v4();
        let (_, effects) = reduce(
            &streaming(id, options()),
            Event::AudioSent { id, level_db: 21.5 },
        );
        assert_eq!(
            effects,
            vec![Effect::Notify(RecognitionEvent::VolumeLevel(21.5))]
        );
    }

    // =========================================================================
    // Inbound messages
    // =========================================================================

    #[test]
    fn final_result_ends_session() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &streaming(id, options()),
            Event::ServerMessage {
                id,
                message: final_result(&["Hello world", "Hello word"]),
            },
        );

        assert_eq!(next, State::Closed);
        assert_eq!(
            effects,
            vec![
                Effect::StopCapture { id },
                Effect::Notify(RecognitionEvent::EndOfSpeech),
                Effect::Teardown { id },
                Effect::Notify(RecognitionEvent::FinalHypotheses {
                    hypotheses: vec!["Hello world".to_string(), "Hello word".to_string()],
                }),
            ]
        );
    }

    #[test]
    fn final_result_while_finishing_does_not_repeat_end_of_speech() {
        let id = Uuid::new_v4();
        let state = State::Finishing {
            session_id: id,
            options: options(),
            connected: true,
            eos_sent: true,
        };
        let (_, effects) = reduce(
            &state,
            Event::ServerMessage {
                id,
                message: final_result(&["done"]),
            },
        );
        assert!(!notifications(&effects).contains(&RecognitionEvent::EndOfSpeech));
    }

    #[test]
    fn empty_final_result_is_speech_timeout() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &streaming(id, options()),
            Event::ServerMessage {
                id,
                message: final_result(&[]),
            },
        );

        assert_eq!(
            next,
            State::Error {
                code: ErrorCode::SpeechTimeout
            }
        );
        assert_eq!(errors(&effects), 1);
        assert!(!notifications(&effects)
            .iter()
            .any(|e| matches!(e, RecognitionEvent::FinalHypotheses { .. })));
    }

    #[test]
    fn unlimited_final_is_semi_final_partial() {
        let id = Uuid::new_v4();
        let opts = SessionOptions {
            partial_results: false,
            unlimited_duration: true,
        };
        let state = streaming(id, opts);
        let (next, effects) = reduce(
            &state,
            Event::ServerMessage {
                id,
                message: final_result(&["first sentence"]),
            },
        );

        assert_eq!(next, state);
        assert_eq!(
            effects,
            vec![Effect::Notify(RecognitionEvent::PartialHypotheses {
                hypotheses: vec!["first sentence".to_string()],
                semi_final: true,
            })]
        );
    }

    #[test]
    fn partials_only_when_requested() {
        let id = Uuid::new_v4();
        let event = || Event::ServerMessage {
            id,
            message: partial_result(&["hel"]),
        };

        let (_, effects) = reduce(&streaming(id, options()), event());
        assert!(effects.is_empty());

        let opts = SessionOptions {
            partial_results: true,
            unlimited_duration: false,
        };
        let (_, effects) = reduce(&streaming(id, opts), event());
        assert_eq!(
            effects,
            vec![Effect::Notify(RecognitionEvent::PartialHypotheses {
                hypotheses: vec!["hel".to_string()],
                semi_final: false,
            })]
        );

        // Empty partials are dropped silently
        let (next, effects) = reduce(
            &streaming(id, opts),
            Event::ServerMessage {
                id,
                message: partial_result(&[]),
            },
        );
        assert!(matches!(next, State::Streaming { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn success_ack_is_silent() {
        let id = Uuid::new_v4();
        let state = streaming(id, options());
        let (next, effects) = reduce(
            &state,
            Event::ServerMessage {
                id,
                message: InboundMessage::Ack {
                    status: Status::Success,
                },
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn status_codes_map_to_errors() {
        let cases = [
            (Status::NoSpeech, ErrorCode::ServerNoSpeech),
            (Status::Aborted, ErrorCode::ServerAborted),
            (Status::NoValidFrames, ErrorCode::ServerNoMatch),
            (Status::NotAvailable, ErrorCode::ServerBusy),
            (Status::Unknown(42), ErrorCode::ServerUnsupported),
        ];

        for (status, code) in cases {
            let id = Uuid::new_v4();
            let (next, effects) = reduce(
                &streaming(id, options()),
                Event::ServerMessage {
                    id,
                    message: InboundMessage::Ack { status },
                },
            );
            assert_eq!(next, State::Error { code });
            assert_eq!(
                effects,
                vec![
                    Effect::Teardown { id },
                    Effect::Notify(RecognitionEvent::Error(code)),
                ]
            );
        }
    }

    #[test]
    fn parse_error_is_fatal() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &streaming(id, options()),
            Event::ServerMessage {
                id,
                message: InboundMessage::ParseError {
                    cause: "expected value".to_string(),
                },
            },
        );
        assert_eq!(
            next,
            State::Error {
                code: ErrorCode::ProtocolParseError
            }
        );
        assert_eq!(errors(&effects), 1);
    }

    // =========================================================================
    // Cancel / Destroy
    // =========================================================================

    #[test]
    fn cancel_tears_down_with_empty_final() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&streaming(id, options()), Event::Cancel);

        assert_eq!(next, State::Closed);
        assert_eq!(
            effects,
            vec![
                Effect::Teardown { id },
                Effect::Notify(RecognitionEvent::FinalHypotheses { hypotheses: vec![] }),
            ]
        );
    }

    #[test]
    fn cancel_when_idle_is_noop() {
        let (next, effects) = reduce(&State::Idle, Event::Cancel);
        assert_eq!(next, State::Idle);
        assert!(effects.is_empty());
    }

    #[test]
    fn destroy_tears_down_silently() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&streaming(id, options()), Event::Destroy);
        assert_eq!(next, State::Closed);
        assert_eq!(effects, vec![Effect::Teardown { id }]);
    }

    #[test]
    fn phase_reports_active_states() {
        let id = Uuid::new_v4();
        assert!(streaming(id, options()).phase().is_active());
        assert!(!State::Closed.phase().is_active());
        assert_eq!(
            State::Error {
                code: ErrorCode::ServerBusy
            }
            .phase(),
            SessionState::Error(ErrorCode::ServerBusy)
        );
    }
}
