//! Wire-format definitions for handshake envelopes.
//!
//! Every message exchanged between client and server, on UDP or TCP, is one
//! envelope.  This module is responsible for:
//! - Defining the on-wire binary layout (header fields, payload, padding).
//! - Encoding an envelope into a byte buffer ready for transmission.
//! - Decoding a raw byte slice back into an [`Envelope`], returning errors
//!   for malformed or truncated input.
//! - Building the stage-specific payloads and frames both sides recompute.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload Length                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Secret                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             Step              |          Session Tag          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Payload ...  (zero-padded to 4)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `Payload Length` is the unpadded length; the frame itself is always a
//! multiple of four bytes.

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 12;

// Byte offsets of each header field.
const OFF_PAYLOAD_LEN: usize = 0;
const OFF_SECRET: usize = 4;
const OFF_STEP: usize = 8;
const OFF_TAG: usize = 10;

/// Offsets of the 32-bit payload fields read by the client.
pub const OFF_FIELD_0: usize = HEADER_LEN;
pub const OFF_FIELD_1: usize = HEADER_LEN + 4;
pub const OFF_FIELD_2: usize = HEADER_LEN + 8;
pub const OFF_FIELD_3: usize = HEADER_LEN + 12;

/// Session tag used when none is configured.
pub const DEFAULT_SESSION_TAG: u16 = 345;

/// Stage-A request payload: `"hello world"` followed by a terminating zero.
pub const HELLO: &[u8; 12] = b"hello world\0";

/// Values of the `step` header field.
pub mod step {
    /// Sent by the client.
    pub const REQUEST: u16 = 1;
    /// Sent by the server.
    pub const RESPONSE: u16 = 2;
}

/// One decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub secret: u32,
    pub step: u16,
    pub session_tag: u16,
    /// Unpadded payload; its length is the `payload_length` field.
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(secret: u32, step: u16, session_tag: u16, payload: Vec<u8>) -> Self {
        Self {
            secret,
            step,
            session_tag,
            payload,
        }
    }

    /// Serialise this envelope into a newly allocated, zero-padded frame.
    pub fn encode(&self) -> Vec<u8> {
        encode(self.secret, self.step, self.session_tag, &self.payload)
    }

    /// Parse an [`Envelope`] from a complete frame.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - `buf.len()` is not the padded size implied by the length field, or
    /// - any padding byte is non-zero.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::TooShort {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        }

        let payload_len = read_u32_at(buf, OFF_PAYLOAD_LEN)? as usize;
        let secret = read_u32_at(buf, OFF_SECRET)?;
        let step = u16::from_be_bytes([buf[OFF_STEP], buf[OFF_STEP + 1]]);
        let session_tag = u16::from_be_bytes([buf[OFF_TAG], buf[OFF_TAG + 1]]);

        let expected = padded_len(payload_len);
        if buf.len() != expected {
            return Err(PacketError::LengthMismatch {
                expected,
                got: buf.len(),
            });
        }

        let payload_end = HEADER_LEN + payload_len;
        if buf[payload_end..].iter().any(|&b| b != 0) {
            return Err(PacketError::BadPadding);
        }

        Ok(Self {
            secret,
            step,
            session_tag,
            payload: buf[HEADER_LEN..payload_end].to_vec(),
        })
    }
}

/// Errors that can arise when parsing a raw frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("frame too short: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },
    #[error("frame length {got} does not match padded length {expected}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("non-zero padding after payload")]
    BadPadding,
}

/// On-wire size of a frame carrying `payload_len` payload bytes.
pub fn padded_len(payload_len: usize) -> usize {
    (HEADER_LEN + payload_len + 3) & !3
}

/// Build a frame from its fields.
///
/// The payload length must fit in a `u32`; callers are responsible for that.
pub fn encode(secret: u32, step: u16, session_tag: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; padded_len(payload.len())];

    buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 4]
        .copy_from_slice(&(payload.len() as u32).to_be_bytes());
    buf[OFF_SECRET..OFF_SECRET + 4].copy_from_slice(&secret.to_be_bytes());
    buf[OFF_STEP..OFF_STEP + 2].copy_from_slice(&step.to_be_bytes());
    buf[OFF_TAG..OFF_TAG + 2].copy_from_slice(&session_tag.to_be_bytes());
    buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);

    buf
}

/// Exact byte comparison over the full padded frame.
///
/// A length difference is a mismatch like any other; there is no partial
/// matching.
pub fn matches(expected: &[u8], received: &[u8]) -> bool {
    expected == received
}

/// Read a big-endian `u32` at `offset`.
pub fn read_u32_at(frame: &[u8], offset: usize) -> Result<u32, PacketError> {
    frame
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or(PacketError::TooShort {
            needed: offset + 4,
            got: frame.len(),
        })
}

/// Read a single byte at `offset`.
pub fn read_u8_at(frame: &[u8], offset: usize) -> Result<u8, PacketError> {
    frame.get(offset).copied().ok_or(PacketError::TooShort {
        needed: offset + 1,
        got: frame.len(),
    })
}

/// Session tag carried in bytes 10..12 of `frame`, if the frame is long enough.
pub fn session_tag_of(frame: &[u8]) -> Option<u16> {
    frame
        .get(OFF_TAG..OFF_TAG + 2)
        .map(|s| u16::from_be_bytes([s[0], s[1]]))
}

fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

// ---------------------------------------------------------------------------
// Stage frames
// ---------------------------------------------------------------------------

/// Stage A request: `secret = 0`, fixed hello payload.
pub fn hello_frame(tag: u16) -> Vec<u8> {
    encode(0, step::REQUEST, tag, HELLO)
}

/// Stage A response: `{packet_count, payload_size, udp_port, secret_a}`.
pub fn stage_a_response(
    tag: u16,
    packet_count: u32,
    payload_size: u32,
    udp_port: u16,
    secret_a: u32,
) -> Vec<u8> {
    let payload = u32s(&[packet_count, payload_size, u32::from(udp_port), secret_a]);
    encode(0, step::RESPONSE, tag, &payload)
}

/// Stage B request for `packet_id`: the id followed by `payload_size` zero bytes.
pub fn stage_b_request(tag: u16, secret_a: u32, packet_id: u32, payload_size: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 4 + payload_size as usize];
    payload[..4].copy_from_slice(&packet_id.to_be_bytes());
    encode(secret_a, step::REQUEST, tag, &payload)
}

/// Stage B acknowledgement of `packet_id`.
pub fn stage_b_ack(tag: u16, secret_a: u32, packet_id: u32) -> Vec<u8> {
    encode(secret_a, step::REQUEST, tag, &packet_id.to_be_bytes())
}

/// Stage B completion: `{tcp_port, secret_b}`.
pub fn stage_b_complete(tag: u16, secret_a: u32, tcp_port: u16, secret_b: u32) -> Vec<u8> {
    encode(secret_a, step::RESPONSE, tag, &u32s(&[u32::from(tcp_port), secret_b]))
}

/// Stage C handoff: `{packet_count2, payload_size2, secret_c, fill_byte}` (13 bytes).
pub fn stage_c_handoff(
    tag: u16,
    secret_b: u32,
    packet_count2: u32,
    payload_size2: u32,
    secret_c: u32,
    fill_byte: u8,
) -> Vec<u8> {
    let mut payload = u32s(&[packet_count2, payload_size2, secret_c]);
    payload.push(fill_byte);
    encode(secret_b, step::RESPONSE, tag, &payload)
}

/// Stage D request: `payload_size2` bytes all equal to `fill_byte`.
pub fn stage_d_request(tag: u16, secret_c: u32, payload_size2: u32, fill_byte: u8) -> Vec<u8> {
    encode(secret_c, step::REQUEST, tag, &vec![fill_byte; payload_size2 as usize])
}

/// Stage D result: `{secret_d}`.
pub fn stage_d_result(tag: u16, secret_c: u32, secret_d: u32) -> Vec<u8> {
    encode(secret_c, step::RESPONSE, tag, &secret_d.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip_random_envelopes() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for i in 0..500 {
            let secret: u32 = rng.random();
            let step: u16 = rng.random();
            let tag: u16 = rng.random();
            // Cover empty payloads and every residue mod 4.
            let len = match i {
                0..=7 => i,
                _ => rng.random_range(0..300),
            };
            let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();

            let frame = encode(secret, step, tag, &payload);
            assert_eq!(frame.len() % 4, 0, "len={len}");
            assert_eq!(frame.len(), padded_len(len));
            assert_eq!(read_u32_at(&frame, OFF_PAYLOAD_LEN).unwrap() as usize, len);

            let env = Envelope::decode(&frame).unwrap();
            assert_eq!(env, Envelope::new(secret, step, tag, payload));
        }
    }

    #[test]
    fn frame_is_padded_to_four_bytes() {
        for len in 0..=17 {
            let frame = encode(1, 1, 1, &vec![0xaa; len]);
            assert_eq!(frame.len() % 4, 0, "len={len}");
            assert_eq!(frame.len(), (HEADER_LEN + len).div_ceil(4) * 4);
        }
    }

    #[test]
    fn payload_length_field_is_unpadded() {
        let frame = encode(0, 1, 0, b"abcde");
        assert_eq!(frame.len(), 20);
        assert_eq!(read_u32_at(&frame, OFF_PAYLOAD_LEN).unwrap(), 5);
        assert_eq!(Envelope::decode(&frame).unwrap().payload.len(), 5);
    }

    #[test]
    fn header_fields_big_endian_on_wire() {
        let frame = encode(0x0102_0304, 0x0506, 0x0708, b"");
        assert_eq!(&frame[..], &[0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn hello_frame_layout() {
        let frame = hello_frame(DEFAULT_SESSION_TAG);
        assert_eq!(frame.len(), 24);
        assert_eq!(&frame[..12], &[0, 0, 0, 12, 0, 0, 0, 0, 0, 1, 0x01, 0x59]);
        assert_eq!(&frame[12..], HELLO);
    }

    #[test]
    fn decode_short_buffer_returns_error() {
        assert_eq!(
            Envelope::decode(&[0u8; 11]),
            Err(PacketError::TooShort { needed: 12, got: 11 })
        );
    }

    #[test]
    fn decode_unpadded_frame_returns_error() {
        let mut frame = encode(0, 1, 0, b"abc");
        frame.pop();
        assert_eq!(
            Envelope::decode(&frame),
            Err(PacketError::LengthMismatch { expected: 16, got: 15 })
        );
    }

    #[test]
    fn decode_dirty_padding_returns_error() {
        let mut frame = encode(0, 1, 0, b"abc");
        frame[15] = 1;
        assert_eq!(Envelope::decode(&frame), Err(PacketError::BadPadding));
    }

    #[test]
    fn matches_is_exact() {
        let a = hello_frame(1);
        assert!(matches(&a, &hello_frame(1)));
        assert!(!matches(&a, &hello_frame(2)));
        assert!(!matches(&a, &a[..a.len() - 4]));
    }

    #[test]
    fn stage_b_request_carries_id_and_filler() {
        let frame = stage_b_request(7, 99, 3, 10);
        let env = Envelope::decode(&frame).unwrap();
        assert_eq!(env.secret, 99);
        assert_eq!(env.payload.len(), 14);
        assert_eq!(read_u32_at(&frame, OFF_FIELD_0).unwrap(), 3);
        assert!(env.payload[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stage_c_handoff_fields_at_fixed_offsets() {
        let frame = stage_c_handoff(0, 5, 12, 40, 321, 0x41);
        assert_eq!(frame.len(), 28);
        assert_eq!(read_u32_at(&frame, OFF_FIELD_0).unwrap(), 12);
        assert_eq!(read_u32_at(&frame, OFF_FIELD_1).unwrap(), 40);
        assert_eq!(read_u32_at(&frame, OFF_FIELD_2).unwrap(), 321);
        assert_eq!(read_u8_at(&frame, OFF_FIELD_3).unwrap(), 0x41);
    }

    #[test]
    fn read_past_end_returns_error() {
        assert!(read_u32_at(&[0u8; 14], OFF_FIELD_0).is_err());
        assert_eq!(session_tag_of(&[0u8; 11]), None);
    }
}
