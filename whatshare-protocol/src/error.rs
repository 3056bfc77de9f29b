//! Error handling for the Whatshare pairing core
//!
//! This module provides a single error type for all pairing, relay, registry
//! and message operations. Errors are converted from underlying library errors
//! using `thiserror`.
//!
//! ## Error Categories
//!
//! ### Validation Errors
//! Bad device names (empty, wrong characters, already in use). These are
//! recovered locally by re-prompting the user and never abort a handshake.
//!
//! ### Relay Errors
//! Transport or service failures of the URL-shortening relay:
//! - `RelayUnavailable`: transient (timeout, 5xx), retried with backoff
//! - `Relay`: permanent (4xx, malformed response), not retried
//! - `CodeNotFound`: the pairing code is unknown, expired or already used
//!
//! ### Message Errors
//! Failures while encrypting or decrypting a forwarded payload:
//! - `Encryption`: the shared secret is malformed
//! - `Decode`: the ciphertext is malformed (protocol mismatch)
//! - `Authentication`: the ciphertext was tampered with or sealed under another key
//!
//! ### Registry Errors
//! `DuplicateName`, `NotFound`, `NotPaired` and storage failures.
//!
//! ## Error Matching
//!
//! ```rust
//! use whatshare_protocol::ProtocolError;
//!
//! fn react(error: &ProtocolError) -> &'static str {
//!     match error {
//!         ProtocolError::Validation(_) => "re-prompt",
//!         ProtocolError::Authentication => "possible attack, drop message",
//!         ProtocolError::Decode(_) => "protocol mismatch, drop message",
//!         e if e.is_transient() => "retry",
//!         _ => "abort handshake",
//!     }
//! }
//!
//! assert_eq!(react(&ProtocolError::Authentication), "possible attack, drop message");
//! ```

use crate::DeviceRole;
use thiserror::Error;

/// Result type for pairing core operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Field-level problem with a device name chosen by the user
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The name is empty
    #[error("Name must contain at least one character")]
    Empty,

    /// The name contains a character outside the allowed set
    #[error("Name contains an invalid character: {0:?}")]
    InvalidCharacter(char),

    /// The name exceeds the maximum length
    #[error("Name is longer than {max} characters")]
    TooLong {
        /// Maximum accepted length
        max: usize,
    },

    /// Another inbound device already uses this name
    #[error("Name already in use: {0}")]
    NameInUse(String),
}

/// Errors that can occur in the pairing core
///
/// # Examples
///
/// ```rust
/// use whatshare_protocol::ProtocolError;
///
/// let error = ProtocolError::CodeNotFound("ab12".to_string());
/// assert_eq!(error.to_string(), "Pairing code not found: ab12");
/// assert!(!error.is_transient());
///
/// let error = ProtocolError::RelayUnavailable("HTTP 503".to_string());
/// assert!(error.is_transient());
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (registry file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid device name
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Permanent relay failure (4xx, malformed response)
    #[error("Relay error: {0}")]
    Relay(String),

    /// Transient relay failure (timeout, connection error, 5xx)
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Pairing code is invalid, expired or already consumed
    #[error("Pairing code not found: {0}")]
    CodeNotFound(String),

    /// Shared secret is malformed, payload cannot be sealed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Ciphertext or descriptor could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Ciphertext was not produced under the given secret
    #[error("Authentication failed")]
    Authentication,

    /// Random number generator failure
    #[error("Entropy source failure")]
    Entropy,

    /// An inbound device with this name already exists
    #[error("Duplicate device name: {0}")]
    DuplicateName(String),

    /// Device record not found in the registry
    #[error("Device not found: {0}")]
    NotFound(String),

    /// No outbound device has been paired
    #[error("Not paired")]
    NotPaired,

    /// A handshake for this role is already exchanging data with the relay
    #[error("Pairing already in progress for {0} role")]
    PairingInProgress(DeviceRole),

    /// Operation not valid in the current handshake state
    #[error("Invalid pairing state: expected {expected}, found {actual}")]
    InvalidState {
        /// State(s) the operation requires
        expected: String,
        /// State the handshake is in
        actual: String,
    },

    /// The handshake was aborted before completion
    #[error("Pairing aborted: {0}")]
    Aborted(String),

    /// Outer deadline elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Registry storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Check if this error is a transient relay failure worth retrying
    /// automatically
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::RelayUnavailable(_) | ProtocolError::Timeout(_)
        )
    }

    /// Check if the user can recover by retrying the whole handshake
    ///
    /// # Examples
    ///
    /// ```rust
    /// use whatshare_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::RelayUnavailable("timeout".into()).is_recoverable());
    /// assert!(!ProtocolError::Authentication.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::RelayUnavailable(_)
                | ProtocolError::Relay(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::Validation(_)
                | ProtocolError::Io(_)
        )
    }

    /// Check if this error terminates the current handshake
    ///
    /// Terminal errors may indicate a stale or malicious code and must never
    /// be retried silently.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolError::CodeNotFound(_)
                | ProtocolError::Authentication
                | ProtocolError::Aborted(_)
        )
    }

    /// Check if this error requires user action
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::Validation(_)
                | ProtocolError::DuplicateName(_)
                | ProtocolError::NotPaired
                | ProtocolError::CodeNotFound(_)
                | ProtocolError::Configuration(_)
        )
    }

    /// Get a user-friendly error message suitable for display in UI
    ///
    /// # Examples
    ///
    /// ```rust
    /// use whatshare_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::NotPaired;
    /// assert_eq!(
    ///     error.user_message(),
    ///     "No desktop paired. Pair a device first."
    /// );
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::Validation(e) => e.to_string(),
            ProtocolError::DuplicateName(name) => {
                format!("The name '{}' is already in use. Choose another one.", name)
            }
            ProtocolError::CodeNotFound(_) => {
                "Pairing failed: the code is invalid or expired. Start over.".to_string()
            }
            ProtocolError::RelayUnavailable(_) | ProtocolError::Timeout(_) => {
                "The pairing service could not be reached. Check the connection and retry."
                    .to_string()
            }
            ProtocolError::Relay(msg) => {
                format!("The pairing service rejected the request: {}", msg)
            }
            ProtocolError::Authentication => {
                "Verification failed: the data does not match the shared secret and was discarded.".to_string()
            }
            ProtocolError::Decode(_) => {
                "Message format not recognised. Both apps may need an update.".to_string()
            }
            ProtocolError::NotPaired => "No desktop paired. Pair a device first.".to_string(),
            ProtocolError::NotFound(name) => format!("Device '{}' is not paired.", name),
            ProtocolError::PairingInProgress(_) => {
                "A pairing is already in progress. Wait for it to finish.".to_string()
            }
            ProtocolError::Aborted(_) => "Pairing cancelled.".to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_conversion() {
        let error: ProtocolError = ValidationError::Empty.into();
        assert!(matches!(error, ProtocolError::Validation(ValidationError::Empty)));
        assert!(error.is_recoverable());
        assert!(error.requires_user_action());
    }

    #[test]
    fn test_error_classification() {
        assert!(ProtocolError::RelayUnavailable("503".into()).is_transient());
        assert!(!ProtocolError::Relay("400".into()).is_transient());
        assert!(ProtocolError::CodeNotFound("x".into()).is_terminal());
        assert!(ProtocolError::Authentication.is_terminal());
        assert!(!ProtocolError::Decode("short".into()).is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ProtocolError::PairingInProgress(DeviceRole::Inbound).to_string(),
            "Pairing already in progress for inbound role"
        );
        assert_eq!(
            ValidationError::TooLong { max: 32 }.to_string(),
            "Name is longer than 32 characters"
        );
    }
}
