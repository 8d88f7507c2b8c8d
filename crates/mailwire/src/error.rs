use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed Out after {duration:?} waiting for the peer")]
    Timeout { duration: Duration },
    #[error("Maximum size exceeded ({limit})")]
    SizeExceeded { limit: usize },
    #[error("peer closed the connection")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("line is not UTF8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl TransportError {
    /// Returns true if the session cannot continue after this error.
    /// An oversized payload is drained from the stream before it is
    /// reported, so the session stays usable.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::SizeExceeded { .. } | Self::InvalidUtf8(_))
    }

    /// Returns true for the expected ways that a peer goes away:
    /// a clean disconnect or an idle timeout. These end the session
    /// quietly rather than being reported as failures.
    pub fn is_hangup(&self) -> bool {
        match self {
            Self::Disconnected | Self::Timeout { .. } => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
