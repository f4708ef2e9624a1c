//! Wire protocol for the streaming recognition endpoint
//!
//! # Protocol Overview
//!
//! 1. Connect to `<endpoint>/<asr-system>?content-type=audio/x-raw,...`
//! 2. Send the auth frame (JSON text) as the first message
//! 3. Stream raw PCM16 mono little-endian audio as binary frames
//! 4. Send the text marker `EOS` once after the last audio frame
//! 5. Receive JSON replies: `{status, result?: {hypotheses: [{transcript}], final?}}`

use serde::{Deserialize, Deserializer, Serialize};

use crate::auth::AuthToken;
use crate::text::TextNormalizer;

/// End-of-stream marker, sent as a text frame
pub const END_OF_STREAM: &str = "EOS";

/// Upper bound on hypotheses kept from one reply
pub const MAX_HYPOTHESES: usize = 100;

/// Build the connection target for a session
pub fn connection_url(endpoint: &str, asr_system: &str, sample_rate: u32) -> String {
    format!(
        "{}/{}?content-type=audio/x-raw,+layout=(string)interleaved,+rate=(int){},+format=(string)S16LE,+channels=(int)1",
        endpoint, asr_system, sample_rate
    )
}

// ============================================================================
// Client Messages (sent TO the server)
// ============================================================================

/// First message of every session
#[derive(Debug, Clone, Serialize)]
pub struct AuthFrame {
    #[serde(rename = "appID")]
    pub app_id: String,
    #[serde(rename = "appKey")]
    pub app_key: String,
    pub timestamp: String,
    /// Post-processors applied to final results
    #[serde(rename = "enable-postprocess")]
    pub enable_postprocess: Vec<String>,
    /// Post-processors applied to partial results
    #[serde(rename = "enable-partial-postprocess")]
    pub enable_partial_postprocess: Vec<String>,
    /// Opaque JSON object, serialized to a string
    #[serde(rename = "custom-info")]
    pub custom_info: String,
}

impl AuthFrame {
    pub fn new(
        token: &AuthToken,
        postprocessors: Vec<String>,
        custom_info: &serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            app_id: token.app_id.clone(),
            app_key: token.signature.clone(),
            timestamp: token.timestamp.clone(),
            enable_postprocess: postprocessors,
            enable_partial_postprocess: Vec::new(),
            custom_info: serde_json::Value::Object(custom_info.clone()).to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // A struct of strings and string lists always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ============================================================================
// Server Messages (received FROM the server)
// ============================================================================

/// Server status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Recognition results, or informational acknowledgements
    Success,
    /// Audio was mostly silence or non-speech
    NoSpeech,
    /// Recognition was aborted server-side
    Aborted,
    /// No valid frames before end of stream
    NoValidFrames,
    /// All recognizer processes are busy
    NotAvailable,
    /// A code this client does not know
    Unknown(i64),
}

impl Status {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Status::Success,
            1 => Status::NoSpeech,
            2 => Status::Aborted,
            5 => Status::NoValidFrames,
            9 => Status::NotAvailable,
            other => Status::Unknown(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Status::Success => 0,
            Status::NoSpeech => 1,
            Status::Aborted => 2,
            Status::NoValidFrames => 5,
            Status::NotAvailable => 9,
            Status::Unknown(code) => *code,
        }
    }
}

/// One decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A reply without a `result` object
    Ack { status: Status },
    /// A reply carrying hypotheses
    Result {
        status: Status,
        is_final: bool,
        hypotheses: Vec<String>,
        raw_status: i64,
    },
    /// The message could not be decoded; nothing in it may be acted upon
    ParseError { cause: String },
}

#[derive(Deserialize)]
struct RawResponse {
    status: i64,
    /// Absent means acknowledgement; when present, even as `null`, it must be an object
    #[serde(default, deserialize_with = "present_result")]
    result: Option<RawResult>,
}

fn present_result<'de, D>(deserializer: D) -> Result<Option<RawResult>, D::Error>
where
    D: Deserializer<'de>,
{
    RawResult::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
struct RawResult {
    hypotheses: Vec<RawHypothesis>,
    #[serde(rename = "final", default)]
    is_final: bool,
}

#[derive(Deserialize)]
struct RawHypothesis {
    transcript: String,
}

/// Decodes inbound text frames into [`InboundMessage`]s
#[derive(Debug, Clone, Copy)]
pub struct ResponseParser {
    pretty_print: bool,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self { pretty_print: true }
    }
}

impl ResponseParser {
    /// `pretty_print` runs [`TextNormalizer::format`] over every hypothesis
    pub fn new(pretty_print: bool) -> Self {
        Self { pretty_print }
    }

    pub fn parse(&self, text: &str) -> InboundMessage {
        let raw: RawResponse = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(e) => {
                return InboundMessage::ParseError {
                    cause: e.to_string(),
                }
            }
        };

        let status = Status::from_code(raw.status);
        match raw.result {
            None => InboundMessage::Ack { status },
            Some(result) => InboundMessage::Result {
                status,
                is_final: result.is_final,
                hypotheses: result
                    .hypotheses
                    .into_iter()
                    .take(MAX_HYPOTHESES)
                    .map(|h| self.clean_transcript(&h.transcript))
                    .collect(),
                raw_status: raw.status,
            },
        }
    }

    fn clean_transcript(&self, transcript: &str) -> String {
        let stripped = strip_tags(transcript);
        if self.pretty_print {
            TextNormalizer::format(&stripped)
        } else {
            stripped.trim().to_string()
        }
    }
}

/// Remove inline `<...>` markup (non-empty, no nested angle brackets)
fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('<') {
        let after = &rest[start + 1..];
        match after.find(['<', '>']) {
            Some(end) if end > 0 && after.as_bytes()[end] == b'>' => {
                out.push_str(&rest[..start]);
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str(&rest[..=start]);
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
