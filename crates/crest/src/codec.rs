//! WebSocket frame codec: the lowest layer of the stack, turning raw bytes
//! into [`Frame`]s and back according to RFC 6455 §5.
//!
//! The codec handles header parsing (FIN, RSV, opcode, mask bit), the
//! 7/16/64-bit payload length encodings, masking, and the protocol checks
//! that can be decided frame-locally:
//!
//! - unknown opcode nibbles are rejected;
//! - control frames must be final and must not declare an extended length;
//! - client-to-server frames must be masked;
//! - the declared payload length is capped before any payload byte is read.
//!
//! Fragment assembly, liveness, and connection state belong to the session
//! layer; the codec only sees one frame at a time.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    WsError,
    frame::{Frame, MAX_HEAD_SIZE, OpCode},
    mask::apply_mask,
};

/// Upper bound on one read of payload bytes.
pub const MAX_CHUNK_LENGTH: usize = 1024;

/// Upper bound on the number of payload chunks per frame.
pub const MAX_CHUNKS: usize = 8;

/// Maximum accepted inbound frame payload, in bytes.
pub const MAX_TOTAL_LENGTH: usize = MAX_CHUNK_LENGTH * MAX_CHUNKS;

/// The role the codec is decoding for.
///
/// A server requires inbound frames to be masked and never masks outbound
/// frames; a client does the opposite. The crate only ever acts as a server
/// on live connections — the client role exists so tests can speak the
/// client side of the wire.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Role {
    Server,
    Client,
}

/// Header fields held across `decode` calls while the payload is still in
/// flight.
struct ReadState {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Encoder/decoder for WebSocket frames, usable with
/// [`tokio_util::codec::Framed`].
///
/// The decoder keeps partial-frame state between calls: it returns
/// `Ok(None)` until a complete header and payload are buffered, so short
/// reads never corrupt the stream position.
pub struct FrameCodec {
    role: Role,
    state: Option<ReadState>,
    max_payload_len: usize,
}

impl FrameCodec {
    /// Creates a codec for the given role with a payload cap.
    pub fn new(role: Role, max_payload_len: usize) -> Self {
        Self {
            role,
            state: None,
            max_payload_len,
        }
    }

    /// Server-side codec with the default payload cap.
    pub fn server() -> Self {
        Self::new(Role::Server, MAX_TOTAL_LENGTH)
    }

    /// Client-side codec with the default payload cap.
    pub fn client() -> Self {
        Self::new(Role::Client, MAX_TOTAL_LENGTH)
    }

    /// Unmasks (if needed) and materialises a frame whose payload is fully
    /// buffered at the front of `src`.
    fn take_frame(&self, state: ReadState, src: &mut BytesMut) -> Result<Frame, WsError> {
        if self.role == Role::Server {
            // RFC 6455 §5.1: clients MUST mask every frame.
            let Some(mask) = state.mask else {
                return Err(WsError::UnmaskedFrame);
            };
            apply_mask(&mut src[..state.payload_len], mask);
        } else if let Some(mask) = state.mask {
            apply_mask(&mut src[..state.payload_len], mask);
        }

        let payload = src.split_to(state.payload_len).freeze();
        Ok(Frame::new(state.fin, state.opcode, state.mask, payload))
    }
}

impl codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Complete a frame whose header was already parsed.
        if let Some(state) = self.state.take() {
            if src.remaining() < state.payload_len {
                self.state = Some(state);
                return Ok(None);
            }
            return self.take_frame(state, src).map(Some);
        }

        if src.remaining() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0x80 != 0;
        if src[0] & 0x70 != 0 {
            // No extension is ever negotiated, so RSV1-3 must be zero.
            return Err(WsError::ReservedBitsNotZero);
        }
        let opcode = OpCode::try_from(src[0] & 0x0F)?;
        let masked = src[1] & 0x80 != 0;
        let length_code = src[1] & 0x7F;

        if opcode.is_control() && !fin {
            return Err(WsError::ControlFrameFragmented);
        }
        // Extended lengths are forbidden on control frames, which also caps
        // their payload at 125 bytes.
        if opcode.is_control() && length_code > 125 {
            return Err(WsError::ControlFrameTooLarge);
        }

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + extra + (masked as usize * 4);
        if src.remaining() < header_size {
            return Ok(None);
        }

        src.advance(2);

        let payload_len: usize = match extra {
            0 => usize::from(length_code),
            2 => src.get_u16() as usize,
            8 => match usize::try_from(src.get_u64()) {
                Ok(length) => length,
                Err(_) => return Err(WsError::FrameTooLarge),
            },
            _ => unreachable!(),
        };

        let mask = if masked {
            Some(src.get_u32().to_be_bytes())
        } else {
            None
        };

        // The length cap is enforced before a single payload byte is read,
        // so an oversize declaration tears the connection down immediately.
        if payload_len > self.max_payload_len {
            return Err(WsError::FrameTooLarge);
        }

        if src.remaining() < payload_len {
            src.reserve(payload_len - src.remaining());
            self.state = Some(ReadState {
                fin,
                opcode,
                mask,
                payload_len,
            });
            return Ok(None);
        }

        self.take_frame(ReadState {
            fin,
            opcode,
            mask,
            payload_len,
        }, src)
        .map(Some)
    }
}

impl codec::Encoder<Frame> for FrameCodec {
    type Error = WsError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.role {
            Role::Client => frame.set_random_mask_if_not_set(),
            // Server-to-client frames are never masked (RFC 6455 §5.1).
            Role::Server => frame.mask = None,
        }

        dst.reserve(MAX_HEAD_SIZE + frame.payload.len());
        frame.write_head(dst);

        let index = dst.len();
        dst.extend_from_slice(&frame.payload);

        if let Some(mask) = frame.mask {
            apply_mask(&mut dst[index..], mask);
        }

        Ok(())
    }
}
