//! Binary layout of every wire packet.
//!
//! Packets are identified by their first byte and use fixed, little-endian
//! field offsets. Layout version [`FRAME_LAYOUT_VERSION`]:
//!
//! | Packet | Size | Layout |
//! |--------|------|--------|
//! | connect | 1 | `[0]='c'` |
//! | handshake ack | 2 | `[0]='a'` `[1]=delay:u8` |
//! | frame | 128 | `[0]='f'` `[1]=role` `[2]=tick:i32` `[6+4i]=input:i32` then checksum:i32, packet id:u32, timestamp:u32, tick delta:i32 |
//! | retransmit request | 64 | `[0]='r'` `[1]=role` `[2]=tick:i32` |
//! | wait | 64 | `[0]='w'` `[1]=role` `[2]=tick:i32` |
//! | ping response | 32 | `[0]='o'` `[1]=role` `[2]=timestamp:u32` |
//! | disconnect | 1 | `[0]='d'` |
//!
//! The number of inputs in a frame is not on the wire. Both peers derive it
//! from the input delay agreed during the handshake, so the receiver decodes
//! with its own [`FrameLayout`].
//!
//! Each fixed group of fields is a serde struct written with bincode at a
//! known offset; [`FrameLayout`] owns the offset arithmetic for both
//! directions.
//!
//! ```
//! use shobu_rollback::network::codec::{decode, encode};
//! use shobu_rollback::{Packet, Role, Tick};
//!
//! let packet = Packet::RetransmitRequest { role: Role::Client, tick: Tick::new(12) };
//! let bytes = encode(&packet).expect("encoding should succeed");
//! assert_eq!(bytes.len(), 64);
//! assert_eq!(&bytes[..6], &[b'r', b'c', 12, 0, 0, 0]);
//! assert_eq!(decode(&bytes, 9).expect("decoding should succeed"), packet);
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

use crate::network::messages::{
    FrameInputs, FramePacket, Packet, Role, TAG_CONNECT, TAG_DISCONNECT, TAG_FRAME,
    TAG_HANDSHAKE_ACK, TAG_PING_RESPONSE, TAG_RETRANSMIT, TAG_WAIT,
};
use crate::{Input, Tick, MAX_BUFFER_SIZE};

/// Version of the layout documented above.
pub const FRAME_LAYOUT_VERSION: u8 = 1;

/// Datagram size of a frame packet.
pub const FRAME_PACKET_SIZE: usize = 128;
/// Datagram size of retransmit requests and wait notices.
pub const CONTROL_PACKET_SIZE: usize = 64;
/// Datagram size of a ping response.
pub const PING_PACKET_SIZE: usize = 32;
/// Datagram size of a handshake acknowledgment.
pub const HANDSHAKE_ACK_SIZE: usize = 2;
/// Largest datagram the engine ever sends or expects.
pub const MAX_PACKET_SIZE: usize = FRAME_PACKET_SIZE;

const INPUT_WIDTH: usize = 4;
const TICK_HEADER_LEN: usize = 6;
const FRAME_TRAILER_LEN: usize = 16;

// Fixed-width little-endian integers so every field has a known width.
fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// `tag`, `role`, `tick`: the first six bytes of frames, retransmit
/// requests and wait notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct TickHeader {
    tag: u8,
    role: u8,
    tick: i32,
}

/// The four fields following a frame's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FrameTrailer {
    checksum: i32,
    packet_id: u32,
    timestamp: u32,
    tick_delta: i32,
}

/// `tag`, `role`, echoed timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PingHeader {
    tag: u8,
    role: u8,
    timestamp: u32,
}

/// Represents what operation was being performed when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Writing one group of fields.
    EncodeField,
    /// Reading one group of fields.
    DecodeField,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeField => write!(f, "encoding packet field"),
            Self::DecodeField => write!(f, "decoding packet field"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode's own errors are opaque, so they are kept as strings in
/// [`CodecError::EncodeError`] and [`CodecError::DecodeError`]. Everything the
/// codec checks itself gets a structured variant.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// Bincode failed to write a field group.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// Bincode failed to read a field group.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The output buffer cannot hold the packet.
    BufferTooSmall {
        /// Bytes needed.
        required: usize,
        /// Bytes available.
        provided: usize,
    },
    /// The datagram is shorter than its kind requires.
    Truncated {
        /// The tag byte.
        tag: u8,
        /// Minimum length for this kind.
        required: usize,
        /// Length actually received.
        received: usize,
    },
    /// The datagram was empty.
    Empty,
    /// The first byte is not a known packet tag.
    UnknownTag {
        /// The unrecognized byte.
        tag: u8,
    },
    /// The role byte is neither host nor client.
    InvalidRole {
        /// The unrecognized byte.
        byte: u8,
    },
    /// A frame carries more inputs than any input delay allows.
    TooManyInputs {
        /// Inputs requested.
        count: usize,
        /// [`MAX_BUFFER_SIZE`].
        max: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::BufferTooSmall { required, provided } => write!(
                f,
                "buffer too small: needed {required} bytes, but only {provided} provided"
            ),
            Self::Truncated {
                tag,
                required,
                received,
            } => write!(
                f,
                "packet '{}' truncated: needed {required} bytes, received {received}",
                char::from(*tag)
            ),
            Self::Empty => write!(f, "empty datagram"),
            Self::UnknownTag { tag } => write!(f, "unknown packet tag 0x{tag:02x}"),
            Self::InvalidRole { byte } => write!(f, "invalid role byte 0x{byte:02x}"),
            Self::TooManyInputs { count, max } => {
                write!(f, "frame carries {count} inputs, at most {max} allowed")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Field offsets of a frame packet carrying `inputs` inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    inputs: usize,
}

impl FrameLayout {
    /// Layout for `inputs` inputs.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooManyInputs`] above [`MAX_BUFFER_SIZE`].
    pub fn new(inputs: usize) -> CodecResult<Self> {
        if inputs > MAX_BUFFER_SIZE {
            return Err(CodecError::TooManyInputs {
                count: inputs,
                max: MAX_BUFFER_SIZE,
            });
        }
        Ok(Self { inputs })
    }

    /// Number of inputs.
    #[must_use]
    pub const fn inputs(&self) -> usize {
        self.inputs
    }

    /// Offset of input `index`.
    #[must_use]
    pub const fn input_offset(&self, index: usize) -> usize {
        TICK_HEADER_LEN + index * INPUT_WIDTH
    }

    /// Offset of the checksum, the first trailer field.
    #[must_use]
    pub const fn checksum_offset(&self) -> usize {
        self.input_offset(self.inputs)
    }

    /// Offset of the packet id.
    #[must_use]
    pub const fn packet_id_offset(&self) -> usize {
        self.checksum_offset() + 4
    }

    /// Offset of the timestamp.
    #[must_use]
    pub const fn timestamp_offset(&self) -> usize {
        self.checksum_offset() + 8
    }

    /// Offset of the tick delta.
    #[must_use]
    pub const fn tick_delta_offset(&self) -> usize {
        self.checksum_offset() + 12
    }

    /// Bytes actually used before padding.
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        self.checksum_offset() + FRAME_TRAILER_LEN
    }
}

fn put<T: Serialize>(buffer: &mut [u8], offset: usize, value: &T) -> CodecResult<usize> {
    let provided = buffer.len();
    let target = buffer
        .get_mut(offset..)
        .ok_or(CodecError::BufferTooSmall {
            required: offset,
            provided,
        })?;
    bincode::serde::encode_into_slice(value, target, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeField))
}

fn take<T: DeserializeOwned>(bytes: &[u8], offset: usize) -> CodecResult<T> {
    let source = bytes.get(offset..).unwrap_or_default();
    bincode::serde::decode_from_slice(source, config())
        .map(|(value, _)| value)
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeField))
}

/// Datagram size of `packet` on the wire.
#[must_use]
pub fn wire_size(packet: &Packet) -> usize {
    match packet {
        Packet::Connect | Packet::Disconnect => 1,
        Packet::HandshakeAck { .. } => HANDSHAKE_ACK_SIZE,
        Packet::Frame(_) => FRAME_PACKET_SIZE,
        Packet::RetransmitRequest { .. } | Packet::Wait { .. } => CONTROL_PACKET_SIZE,
        Packet::PingResponse { .. } => PING_PACKET_SIZE,
    }
}

/// Encodes `packet` into a new, correctly sized and zero-padded buffer.
pub fn encode(packet: &Packet) -> CodecResult<Vec<u8>> {
    let mut buffer = vec![0u8; wire_size(packet)];
    encode_into(packet, &mut buffer)?;
    Ok(buffer)
}

/// Encodes `packet` into the start of `buffer`, returning the datagram size.
///
/// Bytes between the payload and the datagram size are zeroed.
///
/// # Errors
///
/// Returns [`CodecError::BufferTooSmall`] if `buffer` is shorter than the
/// packet's datagram size.
pub fn encode_into(packet: &Packet, buffer: &mut [u8]) -> CodecResult<usize> {
    let size = wire_size(packet);
    let provided = buffer.len();
    let out = buffer.get_mut(..size).ok_or(CodecError::BufferTooSmall {
        required: size,
        provided,
    })?;
    out.fill(0);
    out[0] = packet.tag();

    match packet {
        Packet::Connect | Packet::Disconnect => {},
        Packet::HandshakeAck { delay } => {
            put(out, 1, delay)?;
        },
        Packet::Frame(frame) => encode_frame(frame, out)?,
        Packet::RetransmitRequest { role, tick } | Packet::Wait { role, tick } => {
            let header = TickHeader {
                tag: packet.tag(),
                role: role.as_byte(),
                tick: tick.as_i32(),
            };
            put(out, 0, &header)?;
        },
        Packet::PingResponse { role, timestamp } => {
            let header = PingHeader {
                tag: packet.tag(),
                role: role.as_byte(),
                timestamp: *timestamp,
            };
            put(out, 0, &header)?;
        },
    }
    Ok(size)
}

fn encode_frame(frame: &FramePacket, out: &mut [u8]) -> CodecResult<()> {
    let layout = FrameLayout::new(frame.inputs.len())?;
    let header = TickHeader {
        tag: TAG_FRAME,
        role: frame.role.as_byte(),
        tick: frame.tick.as_i32(),
    };
    put(out, 0, &header)?;
    for (i, input) in frame.inputs.iter().enumerate() {
        put(out, layout.input_offset(i), input)?;
    }
    let trailer = FrameTrailer {
        checksum: frame.checksum,
        packet_id: frame.packet_id,
        timestamp: frame.timestamp,
        tick_delta: frame.tick_delta,
    };
    put(out, layout.checksum_offset(), &trailer)?;
    Ok(())
}

fn require(bytes: &[u8], tag: u8, required: usize) -> CodecResult<()> {
    if bytes.len() < required {
        return Err(CodecError::Truncated {
            tag,
            required,
            received: bytes.len(),
        });
    }
    Ok(())
}

fn role(byte: u8) -> CodecResult<Role> {
    Role::from_byte(byte).ok_or(CodecError::InvalidRole { byte })
}

/// Decodes one datagram.
///
/// `frame_inputs` is the receiver's own buffer size; it only matters for
/// frame packets.
pub fn decode(bytes: &[u8], frame_inputs: usize) -> CodecResult<Packet> {
    let tag = *bytes.first().ok_or(CodecError::Empty)?;
    match tag {
        TAG_CONNECT => Ok(Packet::Connect),
        TAG_DISCONNECT => Ok(Packet::Disconnect),
        TAG_HANDSHAKE_ACK => {
            require(bytes, tag, HANDSHAKE_ACK_SIZE)?;
            Ok(Packet::HandshakeAck {
                delay: take(bytes, 1)?,
            })
        },
        TAG_FRAME => decode_frame(bytes, FrameLayout::new(frame_inputs)?).map(Packet::Frame),
        TAG_RETRANSMIT | TAG_WAIT => {
            require(bytes, tag, TICK_HEADER_LEN)?;
            let header: TickHeader = take(bytes, 0)?;
            let role = role(header.role)?;
            let tick = Tick::new(header.tick);
            if tag == TAG_WAIT {
                Ok(Packet::Wait { role, tick })
            } else {
                Ok(Packet::RetransmitRequest { role, tick })
            }
        },
        TAG_PING_RESPONSE => {
            require(bytes, tag, TICK_HEADER_LEN)?;
            let header: PingHeader = take(bytes, 0)?;
            Ok(Packet::PingResponse {
                role: role(header.role)?,
                timestamp: header.timestamp,
            })
        },
        other => Err(CodecError::UnknownTag { tag: other }),
    }
}

fn decode_frame(bytes: &[u8], layout: FrameLayout) -> CodecResult<FramePacket> {
    require(bytes, TAG_FRAME, layout.payload_len())?;
    let header: TickHeader = take(bytes, 0)?;
    let mut inputs = FrameInputs::with_capacity(layout.inputs());
    for i in 0..layout.inputs() {
        inputs.push(take::<Input>(bytes, layout.input_offset(i))?);
    }
    let trailer: FrameTrailer = take(bytes, layout.checksum_offset())?;
    Ok(FramePacket {
        role: role(header.role)?,
        tick: Tick::new(header.tick),
        inputs,
        checksum: trailer.checksum,
        packet_id: trailer.packet_id,
        timestamp: trailer.timestamp,
        tick_delta: trailer.tick_delta,
    })
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
    use proptest::prelude::*;

    fn frame(inputs: &[Input]) -> FramePacket {
        FramePacket {
            role: Role::Host,
            tick: Tick::new(0x0102_0304),
            inputs: inputs.iter().copied().collect(),
            checksum: -2,
            packet_id: 7,
            timestamp: 0xAABB_CCDD,
            tick_delta: -1,
        }
    }

    fn le(bytes: &[u8], offset: usize) -> [u8; 4] {
        bytes[offset..offset + 4].try_into().unwrap()
    }

    #[test]
    fn frame_fields_land_at_documented_offsets() {
        let inputs = [10, 20, 30, 40, 50, 60, 70, 80, 90];
        let bytes = encode(&Packet::Frame(frame(&inputs))).unwrap();
        assert_eq!(bytes.len(), FRAME_PACKET_SIZE);
        assert_eq!(bytes[0], b'f');
        assert_eq!(bytes[1], b's');
        assert_eq!(le(&bytes, 2), 0x0102_0304i32.to_le_bytes());
        for (i, input) in inputs.iter().enumerate() {
            assert_eq!(le(&bytes, 6 + 4 * i), input.to_le_bytes());
        }
        assert_eq!(le(&bytes, 42), (-2i32).to_le_bytes());
        assert_eq!(le(&bytes, 46), 7u32.to_le_bytes());
        assert_eq!(le(&bytes, 50), 0xAABB_CCDDu32.to_le_bytes());
        assert_eq!(le(&bytes, 54), (-1i32).to_le_bytes());
        assert!(bytes[58..].iter().all(|&b| b == 0));
    }

    #[test]
    fn layout_offsets_follow_input_count() {
        let layout = FrameLayout::new(19).unwrap();
        assert_eq!(layout.checksum_offset(), 82);
        assert_eq!(layout.packet_id_offset(), 86);
        assert_eq!(layout.timestamp_offset(), 90);
        assert_eq!(layout.tick_delta_offset(), 94);
        assert_eq!(layout.payload_len(), 98);
        assert!(layout.payload_len() <= FRAME_PACKET_SIZE);
        assert!(matches!(
            FrameLayout::new(20),
            Err(CodecError::TooManyInputs { count: 20, .. })
        ));
    }

    #[test]
    fn fixed_size_packets() {
        let cases = [
            (Packet::Connect, 1),
            (Packet::Disconnect, 1),
            (Packet::HandshakeAck { delay: 3 }, 2),
            (
                Packet::Wait {
                    role: Role::Client,
                    tick: Tick::new(5),
                },
                64,
            ),
            (
                Packet::PingResponse {
                    role: Role::Host,
                    timestamp: 1,
                },
                32,
            ),
        ];
        for (packet, size) in cases {
            let bytes = encode(&packet).unwrap();
            assert_eq!(bytes.len(), size, "{}", packet.kind());
            assert_eq!(decode(&bytes, 9).unwrap(), packet);
        }
    }

    #[test]
    fn handshake_ack_carries_delay_byte() {
        assert_eq!(
            encode(&Packet::HandshakeAck { delay: 3 }).unwrap(),
            vec![b'a', 3]
        );
    }

    #[test]
    fn ping_response_echoes_timestamp() {
        let bytes = encode(&Packet::PingResponse {
            role: Role::Client,
            timestamp: 0x1122_3344,
        })
        .unwrap();
        assert_eq!(&bytes[..6], &[b'o', b'c', 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn decode_rejects_malformed_datagrams() {
        assert_eq!(decode(&[], 9), Err(CodecError::Empty));
        assert_eq!(decode(&[b'z'], 9), Err(CodecError::UnknownTag { tag: b'z' }));
        assert!(matches!(
            decode(&[b'a'], 9),
            Err(CodecError::Truncated { tag: b'a', .. })
        ));
        assert!(matches!(
            decode(&[b'r', b'c', 1], 9),
            Err(CodecError::Truncated { tag: b'r', .. })
        ));
        assert_eq!(
            decode(&[b'w', b'x', 0, 0, 0, 0], 9),
            Err(CodecError::InvalidRole { byte: b'x' })
        );

        let bytes = encode(&Packet::Frame(frame(&[1; 9]))).unwrap();
        assert!(matches!(
            decode(&bytes[..40], 9),
            Err(CodecError::Truncated { tag: b'f', .. })
        ));
    }

    #[test]
    fn encode_into_reports_short_buffer() {
        let mut buffer = [0u8; 10];
        assert_eq!(
            encode_into(&Packet::Frame(frame(&[1, 2])), &mut buffer),
            Err(CodecError::BufferTooSmall {
                required: 128,
                provided: 10
            })
        );
    }

    #[test]
    fn encode_into_clears_stale_bytes() {
        let mut buffer = [0xEEu8; MAX_PACKET_SIZE];
        let len = encode_into(
            &Packet::RetransmitRequest {
                role: Role::Host,
                tick: Tick::new(1),
            },
            &mut buffer,
        )
        .unwrap();
        assert_eq!(len, 64);
        assert!(buffer[6..64].iter().all(|&b| b == 0));
    }

    #[test]
    fn frames_decode_with_receiver_layout() {
        let bytes = encode(&Packet::Frame(frame(&[4; 11]))).unwrap();
        match decode(&bytes, 11).unwrap() {
            Packet::Frame(decoded) => assert_eq!(decoded, frame(&[4; 11])),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn frame_encode_decode_agree(
            inputs in proptest::collection::vec(any::<i32>(), 0..=MAX_BUFFER_SIZE),
            tick in -1i32..100_000,
            checksum in any::<i32>(),
            packet_id in any::<u32>(),
            timestamp in any::<u32>(),
            tick_delta in -100i32..100,
            host in any::<bool>(),
        ) {
            let packet = FramePacket {
                role: if host { Role::Host } else { Role::Client },
                tick: Tick::new(tick),
                inputs: inputs.iter().copied().collect(),
                checksum,
                packet_id,
                timestamp,
                tick_delta,
            };
            let bytes = encode(&Packet::Frame(packet.clone())).unwrap();
            let layout = FrameLayout::new(inputs.len()).unwrap();
            prop_assert_eq!(le(&bytes, layout.packet_id_offset()), packet_id.to_le_bytes());
            prop_assert_eq!(decode(&bytes, inputs.len()).unwrap(), Packet::Frame(packet));
        }
    }
}
