use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for control plane operations
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to bind the client listener
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, io::Error),

    /// Failed to connect to a remote application
    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(String, io::Error),

    /// Malformed frame on the client channel
    #[error("Frame error: {0}")]
    Frame(String),

    /// A session did not authenticate within the allowed window
    #[error("Authentication timed out")]
    AuthenticationTimeout,

    /// The indexes disagree with the SIP engine's view of the world
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns true if the error means the peer is simply gone
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            Error::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_closed_categorization() {
        let reset = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_connection_closed());

        let frame = Error::Frame("bad length".to_string());
        assert!(!frame.is_connection_closed());

        let denied = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!denied.is_connection_closed());
    }
}
