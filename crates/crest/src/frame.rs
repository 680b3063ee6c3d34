//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! A frame is the smallest wire unit the protocol moves: a header carrying
//! FIN, the opcode and the payload length, an optional 4-byte masking key
//! (mandatory client-to-server, forbidden server-to-client), and the payload.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data frames** ([`OpCode::Text`], [`OpCode::Binary`],
//!   [`OpCode::Continuation`]) carry application payload and may be
//!   fragmented across several frames sharing one message.
//! - **Control frames** ([`OpCode::Close`], [`OpCode::Ping`],
//!   [`OpCode::Pong`]) manage the connection. They must not be fragmented
//!   and their payload must not exceed 125 bytes.

use bytes::Bytes;

use crate::WsError;

/// WebSocket operation code (OpCode) determining the semantic meaning and
/// handling of a frame.
///
/// The numeric values are defined in
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved; frames carrying them are
/// rejected as protocol errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`,
    /// `Ping`, or `Pong`).
    ///
    /// Control frames have special constraints:
    /// - Cannot be fragmented (the FIN bit must be set)
    /// - Payload must not exceed 125 bytes
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WsError;

    /// Attempts to convert a byte value into an `OpCode`, returning an error
    /// for the reserved nibbles (0x3-0x7 and 0xB-0xF).
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WsError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Largest possible frame header: 2 fixed bytes, 8 extended-length bytes and
/// a 4-byte masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// A single WebSocket frame.
///
/// # Fields
/// - `fin`: Final fragment flag. When `true`, this frame completes a message.
/// - `opcode`: Frame type (text, binary, control, continuation).
/// - `mask`: Optional 32-bit XOR masking key. The server never masks what it
///   sends; the codec consumes the client's mask on receive.
/// - `payload`: Frame payload data.
///
/// # Creating frames
///
/// ```rust
/// use crest::frame::Frame;
///
/// let text = Frame::text("Hello");
/// let binary = Frame::binary(vec![1, 2, 3]);
/// let ping = Frame::ping(&b"nonce"[..]);
///
/// // A fragmented message: a non-final first frame, then continuations.
/// let first = Frame::text("Hello, ").with_fin(false);
/// let last = Frame::continuation("World!");
/// ```
#[derive(Clone)]
pub struct Frame {
    pub(crate) fin: bool,
    pub(crate) opcode: OpCode,
    pub(crate) mask: Option<[u8; 4]>,
    pub(crate) payload: Bytes,
}

impl Frame {
    /// Low-level constructor for frames with full control over the flags.
    pub(crate) fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame with the given payload.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Creates a final binary frame with the given payload.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Creates a ping frame with the given payload.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// Creates a pong frame with the given payload.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Creates a close frame with an empty payload.
    pub fn close() -> Self {
        Self::new(true, OpCode::Close, None, Bytes::new())
    }

    /// Creates a continuation frame with the given payload.
    ///
    /// Continuation frames extend a fragmented message started by a non-final
    /// text or binary frame; the last continuation carries `fin = true`.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload)
    }

    /// Sets the fin flag and returns self for method chaining.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets a masking key and returns self for method chaining.
    ///
    /// Only meaningful when acting as the client side of the codec, which
    /// this crate does in tests only.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Returns the frame's opcode.
    #[inline(always)]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Returns a reference to the frame's payload.
    #[inline(always)]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame and returns its payload.
    #[inline(always)]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Returns whether this is the final frame in a message.
    #[inline(always)]
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Generates and sets a random mask if none is already set.
    #[inline]
    pub(crate) fn set_random_mask_if_not_set(&mut self) {
        if self.mask.is_none() {
            let mask: [u8; 4] = rand::random();
            self.mask = Some(mask);
        }
    }

    /// Writes the frame header directly into `dst`.
    ///
    /// The length field follows the RFC encoding: 7-bit lengths up to 125,
    /// `126` plus a big-endian u16 up to 65535, `127` plus a big-endian u64
    /// beyond. The mask bit mirrors whether a key is set.
    pub(crate) fn write_head(&self, dst: &mut bytes::BytesMut) {
        use bytes::BufMut;

        let first_byte = ((self.fin as u8) << 7) | u8::from(self.opcode);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();

        dst.put_u8(first_byte);
        if len < 126 {
            dst.put_u8(len as u8 | mask_bit);
        } else if len < 65536 {
            dst.put_u8(126 | mask_bit);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("fin", &self.fin)
            .field("opcode", &self.opcode)
            .field("masked", &self.mask.is_some())
            .field("len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn test_is_control() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());

        assert!(!OpCode::Continuation.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    #[test]
    fn test_try_from_u8_valid() {
        assert_eq!(OpCode::try_from(0x0).unwrap(), OpCode::Continuation);
        assert_eq!(OpCode::try_from(0x1).unwrap(), OpCode::Text);
        assert_eq!(OpCode::try_from(0x2).unwrap(), OpCode::Binary);
        assert_eq!(OpCode::try_from(0x8).unwrap(), OpCode::Close);
        assert_eq!(OpCode::try_from(0x9).unwrap(), OpCode::Ping);
        assert_eq!(OpCode::try_from(0xA).unwrap(), OpCode::Pong);
    }

    #[test]
    fn test_try_from_u8_invalid() {
        for &code in &[0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(OpCode::try_from(code).is_err());
        }
    }

    #[test]
    fn test_frame_text() {
        let frame = Frame::text("Hello, WebSocket!");

        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.payload().as_ref(), b"Hello, WebSocket!");
        assert!(frame.is_fin());
    }

    #[test]
    fn test_frame_fragmentation_flags() {
        let first = Frame::text("Hello, ").with_fin(false);
        let middle = Frame::continuation("World").with_fin(false);
        let last = Frame::continuation("!");

        assert!(!first.is_fin());
        assert_eq!(first.opcode(), OpCode::Text);

        assert!(!middle.is_fin());
        assert_eq!(middle.opcode(), OpCode::Continuation);

        assert!(last.is_fin());
        assert_eq!(last.opcode(), OpCode::Continuation);
    }

    /// Header byte sequences at the 7/16/64-bit length encoding boundaries.
    #[test]
    fn test_head_length_boundaries() {
        let cases: &[(usize, &[u8])] = &[
            (0, &[0x81, 0x00]),
            (125, &[0x81, 125]),
            (126, &[0x81, 126, 0x00, 0x7E]),
            (65535, &[0x81, 126, 0xFF, 0xFF]),
            (65536, &[0x81, 127, 0, 0, 0, 0, 0, 1, 0, 0]),
        ];

        for (len, expected) in cases {
            let frame = Frame::text(vec![0u8; *len]);
            let mut head = BytesMut::new();
            frame.write_head(&mut head);
            assert_eq!(&head[..], *expected, "header mismatch for len={len}");
        }
    }

    #[test]
    fn test_head_mask_bit() {
        let frame = Frame::text("hi").with_mask([1, 2, 3, 4]);
        let mut head = BytesMut::new();
        frame.write_head(&mut head);
        assert_eq!(&head[..], &[0x81, 0x82, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unmasked_head_never_sets_mask_bit() {
        for frame in [Frame::text("x"), Frame::binary(vec![0; 300]), Frame::pong("")] {
            let mut head = BytesMut::new();
            frame.write_head(&mut head);
            assert_eq!(head[1] & 0x80, 0);
        }
    }
}
