use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("closing connection")]
    Close,
    #[error("session already hijacked")]
    AlreadyHijacked,
    #[error("session transport unavailable")]
    TransportUnavailable,
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),
    #[error("unsupported upstream proxy scheme: {0}")]
    UnsupportedProxyScheme(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn is_closeable(&self) -> bool {
        match self {
            Self::Close | Self::TlsHandshake(_) => true,
            Self::AlreadyHijacked
            | Self::TransportUnavailable
            | Self::UnsupportedProxyScheme(_) => false,
            Self::Io(error) => is_closeable_io(error),
        }
    }
}

pub fn is_closeable_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    ) || error.to_string().to_ascii_lowercase().contains("tls")
}

pub(crate) fn timeout_error(stage: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{stage} timed out"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_and_tls_errors_are_closeable() {
        assert!(ProxyError::Close.is_closeable());
        assert!(ProxyError::TlsHandshake("alert".to_string()).is_closeable());
        assert!(!ProxyError::AlreadyHijacked.is_closeable());
        assert!(!ProxyError::UnsupportedProxyScheme("ftp".to_string()).is_closeable());
    }

    #[test]
    fn io_classification_covers_timeouts_eof_and_dead_peers() {
        for kind in [
            io::ErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
        ] {
            assert!(ProxyError::Io(io::Error::new(kind, "x")).is_closeable());
        }
        assert!(!ProxyError::Io(io::Error::new(io::ErrorKind::InvalidData, "bad request")).is_closeable());
        assert!(ProxyError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "received corrupt TLS message"
        ))
        .is_closeable());
    }
}
