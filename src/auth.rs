//! Per-session credentials for the recognition endpoint
//!
//! The server authenticates a session with a signature derived from the
//! current time and the application's shared secret:
//!
//! ```text
//! appKey = hex(SHA-256(timestamp ++ appId ++ appSecret))
//! ```
//!
//! This is a plain digest over the concatenation, not a keyed MAC. The server
//! recomputes the same digest, so the scheme must not be changed on one side
//! only. Tokens are time-bound and are generated once per activation.

use sha2::{Digest, Sha256};

/// Signed credential sent in the first frame of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub app_id: String,
    /// Lowercase hex SHA-256 digest (the `appKey` field on the wire)
    pub signature: String,
    /// Unix seconds, decimal string form
    pub timestamp: String,
}

/// Derives [`AuthToken`]s from static app credentials
#[derive(Clone)]
pub struct AuthTokenProvider {
    app_id: String,
    app_secret: String,
}

impl AuthTokenProvider {
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
        }
    }

    /// Generate a token stamped with the current wall-clock time
    pub fn generate(&self) -> AuthToken {
        self.generate_at(chrono::Utc::now().timestamp())
    }

    /// Generate a token for a fixed unix timestamp (seconds)
    pub fn generate_at(&self, unix_secs: i64) -> AuthToken {
        let timestamp = unix_secs.to_string();

        let mut hasher = Sha256::new();
        hasher.update(timestamp.as_bytes());
        hasher.update(self.app_id.as_bytes());
        hasher.update(self.app_secret.as_bytes());
        let signature = format!("{:x}", hasher.finalize());

        log::debug!(
            "Auth: generated token for app {} at {} (sig {})",
            self.app_id,
            timestamp,
            signature
        );

        AuthToken {
            app_id: self.app_id.clone(),
            signature,
            timestamp,
        }
    }
}

// Keep the secret out of debug output.
impl std::fmt::Debug for AuthTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthTokenProvider")
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .finish()
    }
}
