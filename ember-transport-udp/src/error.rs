//! Error mapping between `std::io` and [`ember_core::CoreError`], mirroring
//! the stream-socket transport's mapping.

use ember_core::{CoreError, ErrorKind};

/// Wrap a `std::io::Error` observed during a UDP operation as a
/// [`CoreError`]. `ConnectionRefused` (an ICMP port-unreachable bounced back
/// to a connected socket) and the usual peer-gone kinds are tagged
/// [`ErrorKind::TransportClosed`] rather than a generic I/O failure.
pub fn map_io_error(context: &'static str, err: std::io::Error) -> CoreError {
    use std::io::ErrorKind as IoKind;
    match err.kind() {
        IoKind::ConnectionReset | IoKind::ConnectionRefused | IoKind::BrokenPipe | IoKind::UnexpectedEof | IoKind::NotConnected => {
            CoreError::new(ErrorKind::TransportClosed, context).with_cause(err)
        }
        _ => CoreError::from_io(context, err),
    }
}
