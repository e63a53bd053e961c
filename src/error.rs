use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::Tick;

/// This enum contains all errors this library can return. Most API functions return a [`Result<(), NetplayError>`].
///
/// [`Result<(), NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetplayError {
    /// The UDP socket could not be bound to the requested port.
    Bind {
        /// The port that was requested (0 for an ephemeral port).
        port: u16,
        /// The underlying OS error.
        context: String,
    },
    /// The peer address could not be resolved.
    Resolve {
        /// The address as given by the caller.
        address: String,
        /// Why resolution failed.
        context: String,
    },
    /// No handshake reply arrived in time.
    HandshakeTimeout {
        /// How long the handshake waited, in milliseconds.
        waited_ms: u64,
    },
    /// The handshake was cancelled through a [`HandshakeAbort`](crate::HandshakeAbort).
    HandshakeAborted,
    /// The peer answered the handshake with something other than an acknowledgment.
    HandshakeRejected {
        /// What was received instead.
        context: String,
    },
    /// You made an invalid request, usually by calling a role-specific operation on the wrong role.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A network socket operation failed.
    Socket {
        /// A description of the socket error.
        context: String,
    },
    /// A tick was read or written outside the window an input ring still holds.
    TickOutOfWindow {
        /// The tick that was requested.
        tick: Tick,
        /// The tick the slot actually holds.
        held: Tick,
    },
    /// A packet could not be encoded or decoded.
    Codec(CodecError),
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::Bind { port, context } => {
                write!(f, "Failed to bind UDP socket on port {}: {}", port, context)
            },
            NetplayError::Resolve { address, context } => {
                write!(f, "Failed to resolve peer address {}: {}", address, context)
            },
            NetplayError::HandshakeTimeout { waited_ms } => {
                write!(f, "Handshake timed out after {} ms", waited_ms)
            },
            NetplayError::HandshakeAborted => write!(f, "Handshake was aborted"),
            NetplayError::HandshakeRejected { context } => {
                write!(f, "Handshake rejected: {}", context)
            },
            NetplayError::InvalidRequest { info } => write!(f, "Invalid Request: {}", info),
            NetplayError::Socket { context } => write!(f, "Socket error: {}", context),
            NetplayError::TickOutOfWindow { tick, held } => {
                if held < tick {
                    write!(f, "Tick {} has not been written yet (slot holds {})", tick, held)
                } else {
                    write!(f, "Tick {} was overwritten by tick {}", tick, held)
                }
            },
            NetplayError::Codec(err) => write!(f, "Codec error: {}", err),
        }
    }
}

impl Error for NetplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NetplayError::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        NetplayError::Codec(err)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn tick_out_of_window_distinguishes_direction() {
        let stale = NetplayError::TickOutOfWindow {
            tick: Tick::new(5),
            held: Tick::new(65),
        };
        assert!(stale.to_string().contains("overwritten"));

        let future = NetplayError::TickOutOfWindow {
            tick: Tick::new(70),
            held: Tick::new(10),
        };
        assert!(future.to_string().contains("not been written"));
    }

    #[test]
    fn codec_errors_keep_their_source() {
        let err: NetplayError = CodecError::UnknownTag { tag: b'z' }.into();
        assert!(err.source().is_some());
        assert!(err.to_string().contains("Codec error"));
    }
}
