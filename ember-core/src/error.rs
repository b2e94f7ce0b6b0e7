//! The error domain shared by every `ember-core` subsystem.
//!
//! `CoreError` carries a stable `code`, a human-readable `message`, an
//! optional boxed cause, and a structured [`ErrorKind`] that downstream
//! handlers can match on without parsing the message string.

use std::borrow::Cow;
use std::fmt;

/// The stable classification of an error, independent of its `code`/`message`.
///
/// Each variant drives a specific propagation rule further up the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The transport has been closed; further I/O is impossible.
    TransportClosed,
    /// An I/O error occurred at the transport layer.
    TransportIo,
    /// A codec reported malformed input.
    ProtocolCorrupt,
    /// A frame or aggregated message exceeded its configured maximum size.
    TooLongFrame,
    /// A buffer was retained/released more times than it was retained.
    ReferenceCountViolation,
    /// A buffer access fell outside `[readerIndex, writerIndex]`/`capacity`.
    IndexOutOfRange,
    /// A loop-only operation was invoked from a thread other than the
    /// channel's event loop without going through `execute`/`schedule`.
    NotOnEventLoop,
    /// The event loop (or group) is shutting down and refuses new work.
    ShutdownInProgress,
    /// A deadline (read/write/idle timeout) elapsed.
    Timeout,
    /// A handler received a message type it does not know how to process.
    UnsupportedMessageType,
}

impl ErrorKind {
    /// A short, stable, lowercase token for logging and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransportClosed => "transport_closed",
            ErrorKind::TransportIo => "transport_io",
            ErrorKind::ProtocolCorrupt => "protocol_corrupt",
            ErrorKind::TooLongFrame => "too_long_frame",
            ErrorKind::ReferenceCountViolation => "reference_count_violation",
            ErrorKind::IndexOutOfRange => "index_out_of_range",
            ErrorKind::NotOnEventLoop => "not_on_event_loop",
            ErrorKind::ShutdownInProgress => "shutdown_in_progress",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UnsupportedMessageType => "unsupported_message_type",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type returned by every fallible `ember-core` operation.
pub struct CoreError {
    kind: ErrorKind,
    message: Cow<'static, str>,
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    /// Construct a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the underlying cause and return the updated error.
    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Wrap a `std::io::Error` as [`ErrorKind::TransportIo`].
    pub fn from_io(message: impl Into<Cow<'static, str>>, err: std::io::Error) -> Self {
        Self::new(ErrorKind::TransportIo, message).with_cause(err)
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// The result alias used throughout `ember-core` and the transport crates.
pub type Result<T> = core::result::Result<T, CoreError>;
