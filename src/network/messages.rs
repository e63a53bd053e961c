use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Checksum, Input, Tick, MAX_BUFFER_SIZE};

/// First byte of a handshake acknowledgment.
pub const TAG_HANDSHAKE_ACK: u8 = b'a';
/// First byte of a connect request.
pub const TAG_CONNECT: u8 = b'c';
/// First byte of a frame packet.
pub const TAG_FRAME: u8 = b'f';
/// First byte of a retransmit request.
pub const TAG_RETRANSMIT: u8 = b'r';
/// First byte of a wait notice.
pub const TAG_WAIT: u8 = b'w';
/// First byte of a ping response.
pub const TAG_PING_RESPONSE: u8 = b'o';
/// First byte of a disconnect notice.
pub const TAG_DISCONNECT: u8 = b'd';
/// First byte of a hole-punch datagram from a matchmaking relay. Only
/// recognized while a host waits for its client.
pub const TAG_HOLE_PUNCH: u8 = b'p';

/// Which end of the connection a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The side that bound a port and waited for the connect request.
    Host,
    /// The side that sent the connect request.
    Client,
}

impl Role {
    /// The role byte carried on the wire.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Role::Host => b's',
            Role::Client => b'c',
        }
    }

    /// Parses a wire role byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Role> {
        match byte {
            b's' => Some(Role::Host),
            b'c' => Some(Role::Client),
            _ => None,
        }
    }

    /// Returns `true` for [`Role::Host`].
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Role::Host)
    }
}

/// Inputs carried by one frame packet; never more than [`MAX_BUFFER_SIZE`].
pub type FrameInputs = SmallVec<[Input; MAX_BUFFER_SIZE]>;

/// The per-tick input packet. Doubles as a ping probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePacket {
    /// Sender's role; a peer ignores frames carrying its own role.
    pub role: Role,
    /// Sender's tick when the packet was built.
    pub tick: Tick,
    /// Sender's local inputs for ticks `tick + delay - len + 1 ..= tick + delay`.
    pub inputs: FrameInputs,
    /// Sender's checksum for `tick - MAX_ROLLBACK`.
    pub checksum: Checksum,
    /// Strictly increasing per sender.
    pub packet_id: u32,
    /// Sender's wall clock in milliseconds, truncated to 32 bits.
    pub timestamp: u32,
    /// Sender's `local_tick - remote_tick` at its last accepted frame.
    pub tick_delta: i32,
}

/// Every datagram the engine sends or understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Host's answer to [`Packet::Connect`], carrying the input delay to use.
    HandshakeAck {
        /// Negotiated input delay.
        delay: u8,
    },
    /// Client's request to join.
    Connect,
    /// Inputs, checksum and ping probe for one tick.
    Frame(FramePacket),
    /// Asks the peer to resend its frame for `tick`.
    RetransmitRequest {
        /// Sender's role.
        role: Role,
        /// The tick whose frame is wanted.
        tick: Tick,
    },
    /// Tells the peer that the sender is holding at a resync point.
    Wait {
        /// Sender's role.
        role: Role,
        /// Sender's local tick.
        tick: Tick,
    },
    /// Echo of a frame packet's timestamp, used for round-trip time.
    PingResponse {
        /// Sender's role.
        role: Role,
        /// The timestamp copied from the frame being answered.
        timestamp: u32,
    },
    /// Best-effort notice that the sender is leaving.
    Disconnect,
}

impl Packet {
    /// Tag byte at offset 0.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Packet::HandshakeAck { .. } => TAG_HANDSHAKE_ACK,
            Packet::Connect => TAG_CONNECT,
            Packet::Frame(_) => TAG_FRAME,
            Packet::RetransmitRequest { .. } => TAG_RETRANSMIT,
            Packet::Wait { .. } => TAG_WAIT,
            Packet::PingResponse { .. } => TAG_PING_RESPONSE,
            Packet::Disconnect => TAG_DISCONNECT,
        }
    }

    /// Whether the loss and latency simulator applies to this packet.
    ///
    /// Only gameplay traffic is simulated; handshake and control packets
    /// always go out directly.
    #[must_use]
    pub const fn is_simulated(&self) -> bool {
        matches!(self, Packet::Frame(_) | Packet::PingResponse { .. })
    }

    /// Whether this packet is sent [`SEND_REPEATS`](crate::SEND_REPEATS) times.
    #[must_use]
    pub const fn is_redundant(&self) -> bool {
        matches!(
            self,
            Packet::Frame(_) | Packet::PingResponse { .. } | Packet::HandshakeAck { .. }
        )
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Packet::HandshakeAck { .. } => "handshake-ack",
            Packet::Connect => "connect",
            Packet::Frame(_) => "frame",
            Packet::RetransmitRequest { .. } => "retransmit-request",
            Packet::Wait { .. } => "wait",
            Packet::PingResponse { .. } => "ping-response",
            Packet::Disconnect => "disconnect",
        }
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
    fn role_bytes_roundtrip() {
        for role in [Role::Host, Role::Client] {
            assert_eq!(Role::from_byte(role.as_byte()), Some(role));
        }
        assert_eq!(Role::from_byte(b'x'), None);
        assert!(Role::Host.is_host());
        assert!(!Role::Client.is_host());
    }

    #[test]
    fn tags_are_distinct() {
        let packets = [
            Packet::HandshakeAck { delay: 2 },
            Packet::Connect,
            Packet::Frame(FramePacket {
                role: Role::Host,
                tick: Tick::new(0),
                inputs: FrameInputs::new(),
                checksum: 0,
                packet_id: 1,
                timestamp: 0,
                tick_delta: 0,
            }),
            Packet::RetransmitRequest {
                role: Role::Client,
                tick: Tick::new(3),
            },
            Packet::Wait {
                role: Role::Host,
                tick: Tick::new(3),
            },
            Packet::PingResponse {
                role: Role::Host,
                timestamp: 9,
            },
            Packet::Disconnect,
        ];
        let mut tags: Vec<u8> = packets.iter().map(Packet::tag).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), 7);
        assert!(!tags.contains(&TAG_HOLE_PUNCH));
    }

    #[test]
    fn only_gameplay_traffic_is_simulated() {
        assert!(Packet::PingResponse {
            role: Role::Host,
            timestamp: 0
        }
        .is_simulated());
        assert!(!Packet::Disconnect.is_simulated());
        assert!(!Packet::HandshakeAck { delay: 1 }.is_simulated());
        assert!(Packet::HandshakeAck { delay: 1 }.is_redundant());
        assert!(!Packet::Wait {
            role: Role::Client,
            tick: Tick::new(0)
        }
        .is_redundant());
    }
}
