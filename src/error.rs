//! Error taxonomy for the tracker client
//!
//! Each subsystem defines its own error enum next to its implementation;
//! this module aggregates them into a single [`TrackerError`] that maps onto
//! the CLI exit codes, and provides the log sanitizer used before error text
//! reaches a log line.

use crate::auth::TokenError;
use crate::config::ConfigError;
use crate::provisioning::ProvisioningError;
use crate::transport::TransportError;
use crate::twin::TwinError;
use thiserror::Error;

/// Top-level error type for tracker operations
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("twin error: {0}")]
    Twin(#[from] TwinError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("retry policy exhausted after {attempts} attempts")]
    PolicyExhausted { attempts: u32 },
}

/// Process exit codes for the CLI surface
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_ERROR: i32 = 1;
pub const EXIT_CONNECTION_FAILURE: i32 = 2;
pub const EXIT_CERTIFICATE_ERROR: i32 = 3;
pub const EXIT_RUNTIME_ERROR: i32 = 4;

impl TrackerError {
    /// Map an error to the documented CLI exit code
    pub fn exit_code(&self) -> i32 {
        match self {
            TrackerError::Config(_) => EXIT_CONFIG_ERROR,
            TrackerError::Transport(TransportError::MissingCertificate { .. }) => {
                EXIT_CERTIFICATE_ERROR
            }
            TrackerError::Transport(_) => EXIT_CONNECTION_FAILURE,
            TrackerError::Provisioning(_) => EXIT_CONNECTION_FAILURE,
            TrackerError::PolicyExhausted { .. } => EXIT_CONNECTION_FAILURE,
            TrackerError::Twin(_) => EXIT_RUNTIME_ERROR,
            TrackerError::Token(_) => EXIT_RUNTIME_ERROR,
        }
    }
}

/// Sanitize a message before it is logged.
///
/// Device keys and SAS signatures must never appear in logs; certificate
/// paths are allowed. Long messages are truncated to keep log lines bounded.
pub fn sanitize_log_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    // Redact common secret patterns (device keys, tokens, shared access keys)
    sanitized = regex::Regex::new(r"(?i)(password|token|key|secret|sig)[=:]\s*[^\s&;]+")
        .unwrap()
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    // A full SAS token is a secret in its own right
    sanitized = regex::Regex::new(r"SharedAccessSignature\s+\S+")
        .unwrap()
        .replace_all(&sanitized, "SharedAccessSignature ***")
        .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let max_content_len = 500 - truncate_suffix.len();
        sanitized = format!("{}{}", &sanitized[..max_content_len], truncate_suffix);
    }

    sanitized
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_exit_code_mapping() {
        let cert = TrackerError::Transport(TransportError::MissingCertificate {
            path: PathBuf::from("/etc/certs/device.cert.pem"),
        });
        assert_eq!(cert.exit_code(), EXIT_CERTIFICATE_ERROR);

        let conn = TrackerError::Transport(TransportError::ConnectionFailed(
            "broker refused".to_string(),
        ));
        assert_eq!(conn.exit_code(), EXIT_CONNECTION_FAILURE);

        let exhausted = TrackerError::PolicyExhausted { attempts: 10 };
        assert_eq!(exhausted.exit_code(), EXIT_CONNECTION_FAILURE);

        let token = TrackerError::Token(TokenError::InvalidSecret);
        assert_eq!(token.exit_code(), EXIT_RUNTIME_ERROR);
    }

    #[test]
    fn test_sanitize_redacts_keys() {
        let message = "connect failed: key=dGVzdGtleQ== token: abc123";
        let sanitized = sanitize_log_message(message);

        assert!(!sanitized.contains("dGVzdGtleQ=="));
        assert!(!sanitized.contains("abc123"));
        assert!(sanitized.contains("key=***"));
    }

    #[test]
    fn test_sanitize_redacts_sas_tokens() {
        let message = "password was SharedAccessSignature sr=hub%2Fdevices%2Fd&sig=AAAA&se=1";
        let sanitized = sanitize_log_message(message);

        assert!(!sanitized.contains("sig=AAAA"));
        assert!(sanitized.contains("SharedAccessSignature ***"));
    }

    #[test]
    fn test_sanitize_keeps_certificate_paths() {
        let message = "device certificate not found: /certs/123456789101112/device.cert.pem";
        let sanitized = sanitize_log_message(message);

        assert!(sanitized.contains("/certs/123456789101112/device.cert.pem"));
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let long = "x".repeat(600);
        let sanitized = sanitize_log_message(&long);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }
}
