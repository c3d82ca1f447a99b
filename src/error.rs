//! Error handling for homelink.
//!
//! Provides a unified error type combining a failure category with the
//! underlying error details.
//!
//! # Error Categories
//!
//! The categories mirror how device connections actually fail:
//! * Connection establishment ([`HandshakeFailed`](ErrorKind::HandshakeFailed))
//! * Connection loss ([`ConnectionLost`](ErrorKind::ConnectionLost))
//! * Request deadlines ([`Timeout`](ErrorKind::Timeout))
//! * Malformed device traffic ([`ProtocolViolation`](ErrorKind::ProtocolViolation))
//! * Use after disposal ([`Disposed`](ErrorKind::Disposed))
//!
//! Recoverable failures (handshake, connection loss) are retried by the
//! reconnect supervisor; the remaining categories are surfaced to the
//! calling driver.

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// Allows accessing the original error when its concrete type is known.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Whether the reconnect supervisor may recover from this error by
    /// establishing a new session.
    ///
    /// Handshake failures and connection loss are transient; everything
    /// else is surfaced to the caller as-is.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::HandshakeFailed | ErrorKind::ConnectionLost
        )
    }
}

/// Standard result type for homelink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for device-protocol failures.
///
/// Each variant represents a distinct failure category with a standard
/// error message.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// The transport or protocol handshake did not complete. Recoverable:
    /// the reconnect supervisor retries these without surfacing each
    /// attempt.
    #[error("handshake failed")]
    HandshakeFailed,

    /// The session died with the operation in flight, or no session was
    /// available to carry it.
    #[error("connection lost")]
    ConnectionLost,

    /// The caller's deadline elapsed before a reply arrived. Affects only
    /// the specific caller; other pending requests are untouched.
    #[error("operation timed out")]
    Timeout,

    /// The device sent a message this client cannot make sense of. The
    /// offending message is dropped; the session stays up.
    #[error("protocol violation")]
    ProtocolViolation,

    /// The device client has been disposed; no further operations are
    /// possible.
    #[error("client disposed")]
    Disposed,

    /// An argument did not meet validation requirements.
    #[error("invalid argument specified")]
    InvalidArgument,

    /// An internal error that should not occur during normal operation.
    #[error("internal error")]
    Internal,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Creates an error for a failed transport or protocol handshake.
    pub fn handshake_failed<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::HandshakeFailed,
            error: error.into(),
        }
    }

    /// Creates an error for a lost or absent connection.
    ///
    /// Surfaced to every pending request when a session tears down, and
    /// immediately to callers issuing requests against a disconnected
    /// device.
    pub fn connection_lost<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::ConnectionLost,
            error: error.into(),
        }
    }

    /// Creates an error for operations that exceeded their deadline.
    pub fn timeout<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::Timeout,
            error: error.into(),
        }
    }

    /// Creates an error for malformed or unexpected device messages.
    pub fn protocol_violation<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::ProtocolViolation,
            error: error.into(),
        }
    }

    /// Creates an error for operations invoked after disposal.
    pub fn disposed<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::Disposed,
            error: error.into(),
        }
    }

    /// Creates an error for invalid arguments.
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::InvalidArgument,
            error: error.into(),
        }
    }

    /// Creates an error for internal errors.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::Internal,
            error: error.into(),
        }
    }
}

/// Returns the underlying error source.
///
/// This allows error chains to be examined for root causes.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error for display, showing both kind and details.
///
/// Format: "{kind}: {details}"
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
///
/// Connection-shaped IO failures map to `ConnectionLost`; malformed input
/// maps to `InvalidArgument`; the rest is `Internal`.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            AddrNotAvailable | ConnectionRefused => Self::handshake_failed(err),
            BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected | UnexpectedEof => {
                Self::connection_lost(err)
            }
            TimedOut => Self::timeout(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            _ => Self::internal(err),
        }
    }
}

/// Converts WebSocket errors into appropriate error kinds.
///
/// Maps WebSocket errors based on their type:
/// * `ConnectionClosed` / `AlreadyClosed` / `Io` -> `ConnectionLost`
/// * `Protocol` / `Utf8` / `Capacity` -> `ProtocolViolation`
/// * etc.
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        match err {
            ConnectionClosed | AlreadyClosed => Self::connection_lost(err),
            Io(err) => err.into(),
            Http(_) | HttpFormat(_) | Tls(_) | Url(_) => Self::handshake_failed(err),
            Capacity(_) | Protocol(_) | Utf8 => Self::protocol_violation(err),
            WriteBufferFull(err) => Self::internal(err.to_string()),
            AttackAttempt => Self::protocol_violation(err),
        }
    }
}

/// Converts JSON errors to `ProtocolViolation`.
///
/// JSON only crosses this crate's boundary as device wire traffic, so a
/// decode failure is by definition a malformed message.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol_violation(err)
    }
}

/// Converts URL parsing errors to `InvalidArgument`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts formatting errors to `Internal`.
impl From<std::fmt::Error> for Error {
    fn from(e: std::fmt::Error) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts timeout errors to `Timeout`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::timeout(e.to_string())
    }
}

/// Converts UUID errors to `InvalidArgument`.
impl From<uuid::Error> for Error {
    fn from(e: uuid::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts mutex poisoning errors to `Internal`.
impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}
