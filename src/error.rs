use std::fmt;
use std::io;

#[derive(Debug)]
pub enum PaxosError {
    /// A client submission did not reach `Chosen` within its configured timeout.
    CommitTimeout,
    /// The group's event loop has shut down; the submission was never delivered.
    GroupClosed,
    /// A connection-level I/O failure (dial, accept, read, write).
    Io(io::Error),
    /// A framing or handshake violation; fatal to the connection that caused it.
    Protocol(String),
}

impl fmt::Display for PaxosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaxosError::CommitTimeout => write!(f, "commit timed out waiting for the value to be chosen"),
            PaxosError::GroupClosed => write!(f, "instance group's event loop is no longer running"),
            PaxosError::Io(e) => write!(f, "transport I/O error: {}", e),
            PaxosError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for PaxosError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PaxosError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PaxosError {
    fn from(e: io::Error) -> PaxosError {
        PaxosError::Io(e)
    }
}
