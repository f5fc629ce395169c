//! Error taxonomy for the proxy.
//!
//! Session-level failures carry one of these kinds to the termination
//! routine so the close path can log what killed the connection.

use std::io;

/// Proxy error kinds.
#[derive(Debug)]
pub enum ProxyError {
    /// Socket creation/bind/listen/accept failed.
    InvalidFd(io::Error),
    /// Upstream connect failed with a non-progress errno.
    ConnectionFailed(io::Error),
    /// Session observed a role flip or admission while quiescing.
    InvalidPool,
    /// Per-session readiness counter exceeded `loop_max`.
    OutOfLoop,
    /// Non-recoverable read errno.
    FailedRead(io::Error),
    /// Non-recoverable write errno.
    FailedWrite(io::Error),
    /// Peer gone on write.
    BrokenPipe,
    /// Buffer or session allocation failed.
    #[allow(dead_code)]
    OutOfMemory,
    /// Configuration problem at bootstrap.
    Config(String),
}

impl ProxyError {
    /// Expected during a failover switch; logged quietly.
    pub fn is_expected_on_switch(&self) -> bool {
        matches!(self, ProxyError::InvalidPool)
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::InvalidFd(e) => write!(f, "invalid fd: {e}"),
            ProxyError::ConnectionFailed(e) => write!(f, "upstream connection failed: {e}"),
            ProxyError::InvalidPool => write!(f, "connection pool invalidated by failover"),
            ProxyError::OutOfLoop => write!(f, "session exceeded loop limit"),
            ProxyError::FailedRead(e) => write!(f, "read failed: {e}"),
            ProxyError::FailedWrite(e) => write!(f, "write failed: {e}"),
            ProxyError::BrokenPipe => write!(f, "broken pipe"),
            ProxyError::OutOfMemory => write!(f, "out of memory"),
            ProxyError::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::InvalidFd(e)
            | ProxyError::ConnectionFailed(e)
            | ProxyError::FailedRead(e)
            | ProxyError::FailedWrite(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ProxyError::InvalidPool.to_string(),
            "connection pool invalidated by failover"
        );
        assert_eq!(ProxyError::BrokenPipe.to_string(), "broken pipe");
    }

    #[test]
    fn test_switch_expectation() {
        assert!(ProxyError::InvalidPool.is_expected_on_switch());
        assert!(!ProxyError::BrokenPipe.is_expected_on_switch());
    }
}
