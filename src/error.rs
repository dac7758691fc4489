//! Error and Result types for the crate.

use std::error::Error as StdError;
use std::fmt;

/// Result type returned from fallible methods in this crate.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// The error type for all fallible operations in this crate.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The connection is already closed.
    Closed,
    /// Error while connecting (TCP connect or HTTP/1 handshake).
    Connect,
    /// An `io::Error` occurred while reading or writing the connection.
    Io,
    /// A connect or read operation exceeded its deadline.
    Timeout,
    /// The server responded with a status other than 200.
    Status(http::StatusCode),
    /// The inbound XML did not conform to the expected shape.
    Protocol(Protocol),
    /// A server-assigned sequence number was a duplicate, or stale.
    Sequence { expected: u64, got: u64 },
    /// The registered message decoder failed.
    Decode,
    /// No decoder is registered for a given message-type character.
    UnknownMessageType(char),
}

#[derive(Debug)]
pub(crate) enum Protocol {
    /// The document's root element was not named `messages`.
    WrongRoot,
    /// A `message` element carried a child that was neither text nor absent.
    UnexpectedNode,
    /// A required attribute (`seq` or `type`) was missing or malformed.
    BadAttribute(&'static str),
    /// The XML could not be parsed at all.
    Malformed,
}

impl Error {
    /// Returns true if this connection was already closed when the operation was attempted.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns true if this was a connect-time failure (TCP connect or handshake).
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if this was an I/O error reading or writing the connection.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if this was caused by a connect or read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if the server responded with a non-200 status.
    pub fn is_status(&self) -> bool {
        matches!(self.inner.kind, Kind::Status(_))
    }

    /// Returns the offending status code, if this was a status error.
    pub fn status(&self) -> Option<http::StatusCode> {
        match self.inner.kind {
            Kind::Status(code) => Some(code),
            _ => None,
        }
    }

    /// Returns true if this was a protocol-shape error (bad XML).
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol(_))
    }

    /// Returns true if this was a duplicate or stale inbound sequence number.
    pub fn is_sequence(&self) -> bool {
        matches!(self.inner.kind, Kind::Sequence { .. })
    }

    /// Returns true if this came from a registered message decoder.
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Constructs the error a [`crate::Decoder`] implementation returns from
    /// [`crate::Decoder::decode`] to signal that a message payload could not be decoded.
    ///
    /// This is the only public way to produce an `Error` from outside the crate: every other
    /// `Kind` is raised internally by the engine itself.
    pub fn decode(cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Error {
        Error::new_decode(cause)
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(crate) fn new_connect<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_io<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn new_status(code: http::StatusCode) -> Error {
        Error::new(Kind::Status(code))
    }

    pub(crate) fn new_protocol(protocol: Protocol) -> Error {
        Error::new(Kind::Protocol(protocol))
    }

    pub(crate) fn new_sequence(expected: u64, got: u64) -> Error {
        Error::new(Kind::Sequence { expected, got })
    }

    pub(crate) fn new_decode<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Decode).with(cause)
    }

    pub(crate) fn new_unknown_message_type(ty: char) -> Error {
        Error::new(Kind::UnknownMessageType(ty))
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Closed => "connection is closed",
            Kind::Connect => "error connecting to endpoint",
            Kind::Io => "connection error",
            Kind::Timeout => "operation timed out",
            Kind::Status(_) => "server responded with a non-200 status",
            Kind::Protocol(Protocol::WrongRoot) => "response root element was not <messages>",
            Kind::Protocol(Protocol::UnexpectedNode) => {
                "message element contained an unexpected child node"
            }
            Kind::Protocol(Protocol::BadAttribute(_)) => "message element had a bad attribute",
            Kind::Protocol(Protocol::Malformed) => "response body was not well-formed XML",
            Kind::Sequence { .. } => "duplicate or stale inbound sequence number",
            Kind::Decode => "message decoder failed",
            Kind::UnknownMessageType(_) => "no decoder registered for message type",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("messaging_http::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Status(code) => write!(f, "{}: {}", self.description(), code),
            Kind::Sequence { expected, got } => {
                write!(f, "{} (expected {}, got {})", self.description(), expected, got)
            }
            Kind::UnknownMessageType(ty) => {
                write!(f, "{}: '{}'", self.description(), ty)
            }
            _ => {
                if let Some(ref cause) = self.inner.cause {
                    write!(f, "{}: {}", self.description(), cause)
                } else {
                    f.write_str(self.description())
                }
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_carries_code() {
        let err = Error::new_status(http::StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_status());
        assert_eq!(err.status(), Some(http::StatusCode::SERVICE_UNAVAILABLE));
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn sequence_error_message_contains_numbers() {
        let err = Error::new_sequence(3, 1);
        assert!(err.is_sequence());
        let msg = err.to_string();
        assert!(msg.contains('3') && msg.contains('1'));
    }

    #[test]
    fn io_error_preserves_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let err = Error::new_io(io_err);
        assert!(err.is_io());
        assert!(err.source().is_some());
    }

    #[test]
    fn public_decode_constructor_is_reachable_by_decoder_impls() {
        let err = Error::decode("malformed payload");
        assert!(err.is_decode());
        assert!(err.to_string().contains("message decoder failed"));
    }
}
