//! Top-level error type for the session manager
//!
//! Component errors live next to their components; this module aggregates
//! the ones that can surface to the host process and provides log
//! sanitisation so tokens never reach log output.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors surfaced to the host process
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Device identity is not available: {reason}")]
    MissingDeviceIdentity { reason: String },

    #[error("Session manager is already running")]
    AlreadyRunning,

    #[error("Session manager was stopped; reset it before starting again")]
    Stopped,

    #[error("Credential resolution failed: {0}")]
    Resolve(#[from] crate::credentials::ResolveError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Reply failed: {0}")]
    Reply(#[from] crate::reply::ReplyError),
}

impl SessionError {
    /// Create missing identity error
    pub fn missing_device_identity<S: Into<String>>(reason: S) -> Self {
        Self::MissingDeviceIdentity {
            reason: reason.into(),
        }
    }

    /// Display form with secrets redacted, for logging
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

static SECRET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret|sig)[=:]\s*[^\s&]+")
        .unwrap_or_else(|e| panic!("invalid secret pattern: {e}"))
});

static SHARED_ACCESS_SIGNATURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"SharedAccessSignature\s+\S+")
        .unwrap_or_else(|e| panic!("invalid signature pattern: {e}"))
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials from an error string and bound its length
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SHARED_ACCESS_SIGNATURE.replace_all(message, "SharedAccessSignature ***");
    let mut sanitized = SECRET_ASSIGNMENT
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_assignments() {
        let sanitized = sanitize_error_message("auth failed: password=hunter2 token=abc456");
        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_redacts_shared_access_signature() {
        let message = "connect refused for SharedAccessSignature sr=hub%2Fdevices%2Fabc&sig=AbC%3D&se=1700000000";
        let sanitized = sanitize_error_message(message);
        assert!(!sanitized.contains("AbC%3D"));
        assert!(sanitized.contains("SharedAccessSignature ***"));
    }

    #[test]
    fn test_redacts_query_signature() {
        let sanitized = sanitize_error_message("sr=hub&sig=secretvalue&se=1");
        assert!(!sanitized.contains("secretvalue"));
        assert!(sanitized.contains("sig=***"));
        assert!(sanitized.contains("se=1"));
    }

    #[test]
    fn test_case_insensitive() {
        let sanitized = sanitize_error_message("PASSWORD=a Token: b Key=c");
        assert!(!sanitized.contains("=a"));
        assert!(!sanitized.contains(" b"));
        assert!(!sanitized.contains("=c"));
    }

    #[test]
    fn test_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= MAX_MESSAGE_LEN);
        assert!(sanitized.ends_with("...[truncated]"));

        let exact = sanitize_error_message(&"x".repeat(MAX_MESSAGE_LEN));
        assert_eq!(exact.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_empty_message() {
        assert_eq!(sanitize_error_message(""), "");
    }

    #[test]
    fn test_session_error_display() {
        let error = SessionError::missing_device_identity("device id is empty");
        assert_eq!(
            error.to_string(),
            "Device identity is not available: device id is empty"
        );
        assert!(!SessionError::AlreadyRunning.to_string().is_empty());
        assert!(!SessionError::Stopped.to_string().is_empty());
    }
}
