//! Error mapping between `std::io` / socket-option failures and
//! [`ember_core::CoreError`].

use ember_core::{CoreError, ErrorKind};

/// Failures specific to this transport's own socket-option handling,
/// distinct from the generic I/O failures `map_io_error` produces.
#[derive(Debug, thiserror::Error)]
pub enum TcpOptionError {
    #[error("SO_LINGER duration must fit in a platform timeval: {0:?}")]
    LingerOutOfRange(std::time::Duration),
}

impl From<TcpOptionError> for CoreError {
    fn from(err: TcpOptionError) -> Self {
        CoreError::new(ErrorKind::TransportIo, err.to_string())
    }
}

/// Wrap a `std::io::Error` observed during a TCP operation as a
/// [`CoreError`], tagging `ConnectionReset`/`BrokenPipe`/`UnexpectedEof` as
/// [`ErrorKind::TransportClosed`] rather than a generic I/O failure, since
/// those specifically mean "the peer is gone" rather than "the operation
/// failed and may be retried."
pub fn map_io_error(context: &'static str, err: std::io::Error) -> CoreError {
    use std::io::ErrorKind as IoKind;
    match err.kind() {
        IoKind::ConnectionReset | IoKind::BrokenPipe | IoKind::UnexpectedEof | IoKind::NotConnected => {
            CoreError::new(ErrorKind::TransportClosed, context).with_cause(err)
        }
        _ => CoreError::from_io(context, err),
    }
}
