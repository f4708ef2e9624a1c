//! Live microphone streaming to a WebSocket speech recognition endpoint
//!
//! [`StreamingSession`] is the entry point: give it an [`AsrConfig`], an
//! [`audio::AudioDevice`] and a [`SessionListener`], call
//! `start_listening()`, and recognition events arrive on the listener in
//! order.

pub mod audio;
pub mod auth;
pub mod config;
pub mod engine;
pub mod state_machine;
pub mod streaming;
pub mod text;

pub use audio::CpalDevice;
pub use config::{AsrConfig, ConfigError};
pub use engine::{SessionError, StreamingSession};
pub use state_machine::SessionState;
pub use streaming::{ErrorCode, RecognitionEvent, SessionListener};
