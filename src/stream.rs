//! Byte stream abstraction over the image transport.
//!
//! A transport hands the engine one [`ImageStream`] per update attempt. The
//! read contract is deliberately three way: data, a clean end of stream, or
//! a transport failure. A zero length read is never used to signal anything;
//! adapters must translate their transport's own close and error indications
//! into [`ReadOutcome::EndOfStream`] and [`ReadOutcome::TransportError`].

/// Transport failure reported by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The peer reset the connection.
    ConnectionReset,
    /// The transport is not connected.
    NotConnected,
    /// No data arrived within the transport's receive window.
    Timeout,
    /// The stream closed before the transport's own completion signal.
    Incomplete,
    /// Any other transport level failure.
    Protocol,
}

/// Result of a single [`ImageStream::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReadOutcome {
    /// `1..=buf.len()` bytes were placed at the front of the buffer. A short
    /// read is normal and not an error.
    Data(usize),
    /// The peer finished sending and closed the stream cleanly.
    EndOfStream,
    /// The transport failed. The stream must not be read again.
    TransportError(TransportError),
}

/// One inbound firmware image, read sequentially.
pub trait ImageStream {
    /// Pulls at most `buf.len()` bytes into the front of `buf`.
    ///
    /// `Data(0)` is not a valid outcome. After `EndOfStream` or
    /// `TransportError` the stream is spent.
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome;
}

/// Factory for image streams, one per update session.
pub trait ImageSource {
    type Stream: ImageStream;

    /// Opens a fresh stream for a single update attempt.
    fn open(&mut self) -> Result<Self::Stream, TransportError>;
}

/// Adapter for blocking [`std::io::Read`] transports.
///
/// `Ok(0)` from the reader maps to `EndOfStream`, interrupted reads are
/// retried, and error kinds map onto [`TransportError`].
#[cfg(any(test, feature = "std"))]
pub struct IoStream<R> {
    inner: R,
}

#[cfg(any(test, feature = "std"))]
impl<R: std::io::Read> IoStream<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[cfg(any(test, feature = "std"))]
impl<R: std::io::Read> ImageStream for IoStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        loop {
            match self.inner.read(buf) {
                Ok(0) => return ReadOutcome::EndOfStream,
                Ok(n) => return ReadOutcome::Data(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::TransportError(map_io_error(e.kind())),
            }
        }
    }
}

#[cfg(any(test, feature = "std"))]
fn map_io_error(kind: std::io::ErrorKind) -> TransportError {
    use std::io::ErrorKind;

    match kind {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            TransportError::ConnectionReset
        }
        ErrorKind::NotConnected => TransportError::NotConnected,
        ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
        ErrorKind::UnexpectedEof => TransportError::Incomplete,
        _ => TransportError::Protocol,
    }
}
