use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

/// Coarse classification of a failed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The host could not be resolved to an address of the requested family.
    Resolution,
    /// Connect, dial or handshake did not complete.
    Transport,
    /// A response arrived but failed protocol validation.
    Protocol,
    /// A correlated ICMP error came back (unreachable, time exceeded).
    Diagnostic,
    /// The round's deadline elapsed or the round was cancelled.
    Timeout,
}

/// Error carried by a failed round.
#[derive(Debug, Error)]
pub enum PingError {
    #[error("lookup {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("dial {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Transport(String),

    #[error("handshake: {0}")]
    Handshake(String),

    #[error("{0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Protocol(String),

    #[error("{from}: destination unreachable ({reason})")]
    DestinationUnreachable { from: IpAddr, reason: &'static str },

    #[error("{from}: time exceeded")]
    TimeExceeded { from: IpAddr },

    #[error("request timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

impl PingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PingError::Resolve { .. } => ErrorKind::Resolution,
            PingError::Io(e) if e.kind() == io::ErrorKind::TimedOut => ErrorKind::Timeout,
            PingError::Connect { .. }
            | PingError::Io(_)
            | PingError::Transport(_)
            | PingError::Handshake(_)
            | PingError::Unsupported(_) => ErrorKind::Transport,
            PingError::Protocol(_) => ErrorKind::Protocol,
            PingError::DestinationUnreachable { .. } | PingError::TimeExceeded { .. } => {
                ErrorKind::Diagnostic
            }
            PingError::Timeout | PingError::Cancelled => ErrorKind::Timeout,
        }
    }

    pub(crate) fn protocol(msg: impl ToString) -> Self {
        PingError::Protocol(msg.to_string())
    }

    pub(crate) fn handshake(msg: impl ToString) -> Self {
        PingError::Handshake(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let refused = PingError::Connect {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(refused.kind(), ErrorKind::Transport);
        assert_eq!(
            PingError::Io(io::Error::from(io::ErrorKind::TimedOut)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(PingError::Cancelled.kind(), ErrorKind::Timeout);
        assert_eq!(
            PingError::TimeExceeded { from: "10.0.0.1".parse().unwrap() }.kind(),
            ErrorKind::Diagnostic
        );
    }

    #[test]
    fn unreachable_message_names_the_sender() {
        let err = PingError::DestinationUnreachable {
            from: "192.0.2.1".parse().unwrap(),
            reason: "host unreachable",
        };
        assert_eq!(err.to_string(), "192.0.2.1: destination unreachable (host unreachable)");
    }
}
