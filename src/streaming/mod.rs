//! Streaming transport for real-time speech recognition
//!
//! # Architecture
//!
//! ```text
//! AudioCaptureBuffer ──(send timer)──▶ Connection ──▶ ASR server
//!                                          │
//!                                          ▼
//!                              ResponseParser (inbound task)
//!                                          │
//!                                          ▼
//!                  session loop ──▶ ResultDispatcher ──▶ SessionListener
//! ```
//!
//! The session loop (see [`crate::engine`]) is the only writer of session
//! state. The send timer and the connection's inbound task only post events
//! to it; consumer callbacks run on the dispatcher's single worker.

mod connection;
mod dispatcher;
mod protocol;
mod sender;

pub use connection::{Connection, ConnectionEvent};
pub use dispatcher::{RecognitionEvent, ResultDispatcher, SessionListener};
pub use protocol::{
    connection_url, AuthFrame, InboundMessage, ResponseParser, Status, END_OF_STREAM,
    MAX_HYPOTHESES,
};
pub(crate) use sender::{spawn_send_timer, SendOptions, SendTiming, SenderEvent};

/// Consumer-visible recognition errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The audio device could not be opened or stopped delivering audio
    DeviceInitFailed,
    /// Capture exceeded the buffer capacity
    BufferOverflow,
    /// The connection could not be established or broke
    ConnectionFailed,
    /// The connection attempt timed out
    ConnectionTimeout,
    /// The server sent a message that could not be decoded
    ProtocolParseError,
    /// Status 2: recognition aborted by the server
    ServerAborted,
    /// Status 9: no recognizer available
    ServerBusy,
    /// Status 1: no speech in the audio
    ServerNoSpeech,
    /// Status 5: no valid frames before end of stream
    ServerNoMatch,
    /// Any other status: the client needs an update
    ServerUnsupported,
    /// Empty final result, or the server hung up before end of stream
    SpeechTimeout,
}

impl ErrorCode {
    /// Map a non-success server status to its error
    pub fn from_status(status: Status) -> Option<Self> {
        match status {
            Status::Success => None,
            Status::NoSpeech => Some(ErrorCode::ServerNoSpeech),
            Status::Aborted => Some(ErrorCode::ServerAborted),
            Status::NoValidFrames => Some(ErrorCode::ServerNoMatch),
            Status::NotAvailable => Some(ErrorCode::ServerBusy),
            Status::Unknown(_) => Some(ErrorCode::ServerUnsupported),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorCode::DeviceInitFailed => "audio device error",
            ErrorCode::BufferOverflow => "audio buffer overflow",
            ErrorCode::ConnectionFailed => "connection failed",
            ErrorCode::ConnectionTimeout => "connection timed out",
            ErrorCode::ProtocolParseError => "malformed server message",
            ErrorCode::ServerAborted => "recognition aborted by server",
            ErrorCode::ServerBusy => "recognizer busy",
            ErrorCode::ServerNoSpeech => "no speech detected",
            ErrorCode::ServerNoMatch => "no valid audio frames",
            ErrorCode::ServerUnsupported => "unsupported server status, client update required",
            ErrorCode::SpeechTimeout => "speech timeout",
        };
        f.write_str(text)
    }
}

impl std::error::Error for ErrorCode {}

/// Errors from the WebSocket connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Handshake or transport failure
    Failed(String),
    /// The handshake did not complete in time
    Timeout,
    /// The connection is already closed
    Closed,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Failed(e) => write!(f, "Connection failed: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl ConnectionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConnectionError::Timeout => ErrorCode::ConnectionTimeout,
            ConnectionError::Failed(_) | ConnectionError::Closed => ErrorCode::ConnectionFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::from_status(Status::Success), None);
        assert_eq!(
            ErrorCode::from_status(Status::NoSpeech),
            Some(ErrorCode::ServerNoSpeech)
        );
        assert_eq!(
            ErrorCode::from_status(Status::Aborted),
            Some(ErrorCode::ServerAborted)
        );
        assert_eq!(
            ErrorCode::from_status(Status::NoValidFrames),
            Some(ErrorCode::ServerNoMatch)
        );
        assert_eq!(
            ErrorCode::from_status(Status::NotAvailable),
            Some(ErrorCode::ServerBusy)
        );
        assert_eq!(
            ErrorCode::from_status(Status::Unknown(7)),
            Some(ErrorCode::ServerUnsupported)
        );
    }

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::Failed("refused".to_string());
        assert!(err.to_string().contains("refused"));
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
        assert_eq!(ConnectionError::Timeout.code(), ErrorCode::ConnectionTimeout);
    }
}
