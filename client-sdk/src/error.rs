//! Error types for the SyndraDB client driver core.
//!
//! This module defines the error envelope `{code, type, message, details, cause}`
//! used by every public entry point, plus the classification helpers the Pool
//! and Supervisor rely on to decide whether a failure is fatal to the current
//! connection.

use std::fmt;
use thiserror::Error;

/// Broad classification of an error, matching the wire-level error envelope's
/// `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Dial, handshake, TLS validation, or dead-socket failures.
    ConnectionError,
    /// Framing failure, empty frame, unexpected greeting, malformed response.
    ProtocolError,
    /// Operation invoked against an incompatible client/pool/hook state.
    StateError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::ProtocolError => "PROTOCOL_ERROR",
            ErrorKind::StateError => "STATE_ERROR",
        };
        f.write_str(s)
    }
}

/// The driver's single error type, returned from every public entry point.
///
/// Each variant corresponds to one of the error codes enumerated across
/// §4.2-§4.7 and §6-§7 of the driver core design: connection/dial/TLS
/// failures, protocol framing failures, server-reported errors, state-machine
/// violations, and deadline/cancellation errors.
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// Dialing the remote address failed (refused, unreachable, DNS failure).
    #[error("failed to connect to {addr}: {reason}")]
    ConnectionFailed {
        /// The address that was being dialed.
        addr: String,
        /// The underlying reason, as reported by the OS or TLS stack.
        reason: String,
    },

    /// The TLS handshake returned before completing.
    #[error("TLS handshake with {addr} did not complete")]
    TlsHandshakeIncomplete {
        /// The address the handshake was attempted against.
        addr: String,
    },

    /// The server's certificate failed validation, with a specific cause.
    #[error("TLS verification failed for {addr}: {reason}")]
    TlsVerificationFailed {
        /// The address the handshake was attempted against.
        addr: String,
        /// One of `expired`, `unknown_ca`, `hostname_mismatch`, `generic_verify`.
        reason: TlsFailureReason,
    },

    /// An operation was attempted on a Connection whose `alive` flag is false.
    #[error("connection is dead")]
    ConnectionDead,

    /// Writing the framed command to the socket failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// An I/O error occurred while reading a response frame.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The connection closed before any response bytes arrived.
    #[error("no response received before connection closed")]
    NoResponse,

    /// The server replied with a well-formed response whose success
    /// indicator was false.
    #[error("server error: {message}")]
    ServerError {
        /// The server-supplied error message, when present.
        message: String,
        /// The full structured response object, for caller inspection.
        details: serde_json::Value,
    },

    /// The handshake's first server frame did not contain the `S0001` token.
    #[error("unexpected greeting from server: {0:?}")]
    UnexpectedGreeting(String),

    /// A response frame could not be parsed as UTF-8/structured content in a
    /// way the protocol requires (e.g. an empty frame where one was expected).
    #[error("protocol error: {0}")]
    ProtocolViolation(String),

    /// An I/O deadline elapsed, or the caller's context was cancelled.
    #[error("deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded {
        /// Milliseconds elapsed before the deadline fired.
        elapsed_ms: u64,
    },

    /// A command was issued while the pool/connection is not connected.
    #[error("not connected (current state: {state})")]
    NotConnected {
        /// The state the client was in when the operation was rejected.
        state: String,
    },

    /// A requested state transition is not in the legal transition table.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// The state the client was in.
        from: String,
        /// The state that was requested.
        to: String,
    },

    /// A subscriber attempted to trigger a transition synchronously from
    /// within another transition's callback.
    #[error("reentrant state transition attempted")]
    ReentrantTransition,

    /// A public operation was invoked while the client is in an
    /// incompatible, non-transition-table state (e.g. `Disconnect` called
    /// twice in immediate succession from two tasks).
    #[error("illegal state for this operation: {0}")]
    IllegalState(String),

    /// A blocking `acquire` exceeded its deadline before a Connection freed up.
    #[error("timed out waiting for a pooled connection")]
    Timeout,

    /// `acquire` was called after `Pool::close()`.
    #[error("pool is closed")]
    PoolClosed,

    /// `RegisterHook` was called with a name already registered.
    #[error("a hook named {0:?} is already registered")]
    DuplicateHook(String),
}

/// The specific TLS verification failure, carried in `details.reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsFailureReason {
    /// The peer certificate's validity window has passed.
    Expired,
    /// The certificate chain does not terminate at a trusted root.
    UnknownCa,
    /// The certificate's subject/SAN does not match the dialed host.
    HostnameMismatch,
    /// Any other verification failure not otherwise classified.
    GenericVerify,
}

impl fmt::Display for TlsFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TlsFailureReason::Expired => "expired",
            TlsFailureReason::UnknownCa => "unknown_ca",
            TlsFailureReason::HostnameMismatch => "hostname_mismatch",
            TlsFailureReason::GenericVerify => "generic_verify",
        };
        f.write_str(s)
    }
}

impl DriverError {
    /// The stable, never-repurposed error code (§6's error envelope `code`).
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            DriverError::TlsHandshakeIncomplete { .. } => "TLS_HANDSHAKE_INCOMPLETE",
            DriverError::TlsVerificationFailed { .. } => "TLS_VERIFICATION_FAILED",
            DriverError::ConnectionDead => "CONNECTION_DEAD",
            DriverError::SendFailed(_) => "SEND_FAILED",
            DriverError::ReceiveFailed(_) => "RECEIVE_FAILED",
            DriverError::NoResponse => "NO_RESPONSE",
            DriverError::ServerError { .. } => "SERVER_ERROR",
            DriverError::UnexpectedGreeting(_) => "UNEXPECTED_GREETING",
            DriverError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            DriverError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            DriverError::NotConnected { .. } => "NOT_CONNECTED",
            DriverError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            DriverError::ReentrantTransition => "REENTRANT_TRANSITION",
            DriverError::IllegalState(_) => "ILLEGAL_STATE",
            DriverError::Timeout => "TIMEOUT",
            DriverError::PoolClosed => "POOL_CLOSED",
            DriverError::DuplicateHook(_) => "DUPLICATE_HOOK",
        }
    }

    /// The error envelope's `type` classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::ConnectionFailed { .. }
            | DriverError::TlsHandshakeIncomplete { .. }
            | DriverError::TlsVerificationFailed { .. }
            | DriverError::ConnectionDead
            | DriverError::SendFailed(_)
            | DriverError::ReceiveFailed(_)
            | DriverError::NoResponse => ErrorKind::ConnectionError,

            DriverError::UnexpectedGreeting(_) | DriverError::ProtocolViolation(_) => {
                ErrorKind::ProtocolError
            }

            DriverError::ServerError { .. }
            | DriverError::NotConnected { .. }
            | DriverError::IllegalTransition { .. }
            | DriverError::ReentrantTransition
            | DriverError::IllegalState(_)
            | DriverError::Timeout
            | DriverError::PoolClosed
            | DriverError::DuplicateHook(_)
            | DriverError::DeadlineExceeded { .. } => ErrorKind::StateError,
        }
    }

    /// True if this error means the socket that produced it must never be
    /// reused (§4.2's "fatal-to-this-socket" sense).
    ///
    /// Every code is fatal except `SERVER_ERROR` and `DEADLINE_EXCEEDED`,
    /// which only become fatal if the underlying I/O itself failed (callers
    /// that already know the socket is otherwise healthy should not mark it
    /// dead on these two alone).
    pub fn is_fatal_to_connection(&self) -> bool {
        !matches!(
            self,
            DriverError::ServerError { .. } | DriverError::DeadlineExceeded { .. }
        )
    }

    /// True if retrying the same operation on a fresh connection might
    /// succeed. Used by the Supervisor to decide whether a probe failure
    /// should escalate to a reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionFailed { .. }
                | DriverError::TlsHandshakeIncomplete { .. }
                | DriverError::ConnectionDead
                | DriverError::SendFailed(_)
                | DriverError::ReceiveFailed(_)
                | DriverError::NoResponse
        )
    }

    /// Builds the serializable envelope described in §6, optionally
    /// including a synthetic stack trace when `debug_mode` is set.
    pub fn to_envelope(&self, debug_mode: bool) -> ErrorEnvelope {
        let details = match self {
            DriverError::ServerError { details, .. } => Some(details.clone()),
            DriverError::TlsVerificationFailed { reason, .. } => {
                Some(serde_json::json!({ "reason": reason.to_string() }))
            }
            _ => None,
        };
        ErrorEnvelope {
            code: self.code().to_string(),
            kind: self.kind(),
            message: self.to_string(),
            details,
            cause: None,
            stack_trace: if debug_mode {
                Some(vec![self.to_string()])
            } else {
                None
            },
        }
    }
}

/// The wire-serializable error envelope from §6/§7.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    /// Stable error code, e.g. `"CONNECTION_DEAD"`.
    pub code: String,
    /// Broad classification.
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Structured extra detail, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// The underlying cause, when this error wraps another.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Present only when the client is constructed with `debugMode = true`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<Vec<String>>,
}

/// The driver's `Result` alias.
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_dead_display() {
        assert_eq!(DriverError::ConnectionDead.to_string(), "connection is dead");
    }

    #[test]
    fn code_is_stable_and_unique_per_variant() {
        assert_eq!(DriverError::ConnectionDead.code(), "CONNECTION_DEAD");
        assert_eq!(DriverError::Timeout.code(), "TIMEOUT");
        assert_eq!(DriverError::PoolClosed.code(), "POOL_CLOSED");
    }

    #[test]
    fn fatal_classification_excludes_server_and_deadline_errors() {
        let server_err = DriverError::ServerError {
            message: "bad cmd".into(),
            details: serde_json::json!({"success": false, "error": "bad cmd"}),
        };
        assert!(!server_err.is_fatal_to_connection());
        assert!(!DriverError::DeadlineExceeded { elapsed_ms: 10 }.is_fatal_to_connection());
        assert!(DriverError::ConnectionDead.is_fatal_to_connection());
        assert!(DriverError::SendFailed("broken pipe".into()).is_fatal_to_connection());
    }

    #[test]
    fn retryable_errors_are_socket_level_only() {
        assert!(DriverError::ConnectionDead.is_retryable());
        assert!(DriverError::NoResponse.is_retryable());
        assert!(!DriverError::PoolClosed.is_retryable());
        assert!(!DriverError::DuplicateHook("h".into()).is_retryable());
    }

    #[test]
    fn envelope_carries_server_error_details() {
        let err = DriverError::ServerError {
            message: "bad cmd".into(),
            details: serde_json::json!({"success": false, "error": "bad cmd"}),
        };
        let envelope = err.to_envelope(false);
        assert_eq!(envelope.code, "SERVER_ERROR");
        assert_eq!(envelope.kind, ErrorKind::StateError);
        assert!(envelope.details.is_some());
        assert!(envelope.stack_trace.is_none());
    }

    #[test]
    fn debug_mode_adds_stack_trace() {
        let envelope = DriverError::ConnectionDead.to_envelope(true);
        assert!(envelope.stack_trace.is_some());
    }

    #[test]
    fn tls_failure_reason_serializes_snake_case() {
        let err = DriverError::TlsVerificationFailed {
            addr: "wronghost:1776".into(),
            reason: TlsFailureReason::HostnameMismatch,
        };
        let envelope = err.to_envelope(false);
        let details = envelope.details.unwrap();
        assert_eq!(details["reason"], "hostname_mismatch");
    }
}
