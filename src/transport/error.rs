//! Transport errors

use std::io;

use thiserror::Error;

/// Connection and protocol failures. The Display text is what the user sees
/// when a session ends.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Connection to {host} failed: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("Host key verification failed")]
    HostKeyRejected,

    #[error("Host key for {0} has changed")]
    HostKeyChanged(String),

    #[error("Authentication failure")]
    AuthFailure,

    #[error("Channel failure: {0}")]
    Channel(String),

    #[error("Subsystem {0} request failed")]
    Subsystem(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),
}

impl TransportError {
    /// Map a connect-time io error, keeping timeouts distinct
    pub fn connect(host: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::TimedOut {
            TransportError::Timeout(host.to_string())
        } else {
            TransportError::Connect {
                host: host.to_string(),
                source,
            }
        }
    }
}

/// Would-block detection across io and libssh2 errors
pub trait WouldBlock {
    fn would_block(&self) -> bool;
}

/// libssh2's EAGAIN
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

impl WouldBlock for io::Error {
    fn would_block(&self) -> bool {
        self.kind() == io::ErrorKind::WouldBlock
    }
}

impl WouldBlock for ssh2::Error {
    fn would_block(&self) -> bool {
        self.code() == ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_timeout_maps_to_timeout() {
        let err = TransportError::connect("host", io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(err, TransportError::Timeout(_)));
        let err = TransportError::connect("host", io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(err.to_string().starts_with("Connection to host failed"));
    }

    #[test]
    fn test_would_block() {
        assert!(io::Error::from(io::ErrorKind::WouldBlock).would_block());
        assert!(!io::Error::from(io::ErrorKind::BrokenPipe).would_block());
        assert_eq!(TransportError::AuthFailure.to_string(), "Authentication failure");
    }
}
