//! UBX frames: `B5 62 | class | id | length (LE) | payload | ck_a ck_b`.
//!
//! The checksum is an 8-bit Fletcher sum over class, id, length and payload.
//! For decoding a continuous stream see [`crate::codecs::ubx::UbxCodec`].

use crate::error::Error;

/// First sync character.
pub const SYNC_CHAR_1: u8 = 0xB5;

/// Second sync character.
pub const SYNC_CHAR_2: u8 = 0x62;

/// Bytes a frame adds around its payload.
pub const PROTOCOL_OVERHEAD: usize = 8;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

const HEADER_LEN: usize = 6;

/// A decoded frame, borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UbxFrame<'a> {
    /// Message class.
    pub class: u8,

    /// Message id within the class.
    pub id: u8,

    /// The message body.
    pub payload: &'a [u8],
}

impl UbxFrame<'_> {
    /// Size of the frame on wire.
    pub fn frame_len(&self) -> usize {
        self.payload.len() + PROTOCOL_OVERHEAD
    }
}

/// The two checksum bytes over `bytes`.
pub fn checksum(bytes: &[u8]) -> [u8; 2] {
    let mut ck_a = 0u8;
    let mut ck_b = 0u8;

    for byte in bytes {
        ck_a = ck_a.wrapping_add(*byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }

    [ck_a, ck_b]
}

/// Encode a frame into `out`, returning how many bytes were written.
///
/// `out` must have room for `payload.len() + PROTOCOL_OVERHEAD` bytes.
pub fn encode(class: u8, id: u8, payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::InvalidParameter(format!(
            "UBX payloads are at most {MAX_PAYLOAD} bytes, got {}",
            payload.len()
        )));
    }

    let frame_len = payload.len() + PROTOCOL_OVERHEAD;

    if out.len() < frame_len {
        return Err(Error::InvalidParameter(format!(
            "need {frame_len} bytes to encode frame, buffer has {}",
            out.len()
        )));
    }

    out[0] = SYNC_CHAR_1;
    out[1] = SYNC_CHAR_2;
    out[2] = class;
    out[3] = id;
    out[4..HEADER_LEN].copy_from_slice(&uint16_encode(payload.len() as u16));
    out[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);

    let ck = checksum(&out[2..HEADER_LEN + payload.len()]);
    out[HEADER_LEN + payload.len()..frame_len].copy_from_slice(&ck);

    Ok(frame_len)
}

/// Encode a frame into a new vector.
pub fn encode_to_vec(class: u8, id: u8, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = vec![0; payload.len() + PROTOCOL_OVERHEAD];
    encode(class, id, payload, &mut out)?;

    Ok(out)
}

/// Decode the frame at the start of `buffer`.
///
/// Bytes after the frame are ignored.
pub fn decode(buffer: &[u8]) -> Result<UbxFrame<'_>, Error> {
    match buffer {
        [] => return Err(Error::Incomplete { needed: 2 }),
        [SYNC_CHAR_1] => return Err(Error::Incomplete { needed: 1 }),
        [SYNC_CHAR_1, SYNC_CHAR_2, ..] => {}
        _ => return Err(Error::NoSync),
    }

    if buffer.len() < HEADER_LEN {
        return Err(Error::Incomplete {
            needed: PROTOCOL_OVERHEAD - buffer.len(),
        });
    }

    let payload_len = uint16_decode(&buffer[4..HEADER_LEN]) as usize;
    let frame_len = payload_len + PROTOCOL_OVERHEAD;

    if buffer.len() < frame_len {
        return Err(Error::Incomplete {
            needed: frame_len - buffer.len(),
        });
    }

    let ck = checksum(&buffer[2..HEADER_LEN + payload_len]);

    if ck != buffer[HEADER_LEN + payload_len..frame_len] {
        return Err(Error::Checksum);
    }

    Ok(UbxFrame {
        class: buffer[2],
        id: buffer[3],
        payload: &buffer[HEADER_LEN..HEADER_LEN + payload_len],
    })
}

/// Little-endian `u16` from the first two bytes.
///
/// Panics if fewer than two bytes are given.
pub fn uint16_decode(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Little-endian `u32` from the first four bytes.
///
/// Panics if fewer than four bytes are given.
pub fn uint32_decode(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Little-endian `i32` from the first four bytes.
///
/// Panics if fewer than four bytes are given.
pub fn int32_decode(bytes: &[u8]) -> i32 {
    uint32_decode(bytes) as i32
}

/// Little-endian bytes of a `u16`.
pub fn uint16_encode(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

/// Little-endian bytes of a `u32`.
pub fn uint32_encode(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Little-endian bytes of an `i32`.
pub fn int32_encode(value: i32) -> [u8; 4] {
    value.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_poll_frame() {
        // MON-VER poll.
        let frame = encode_to_vec(0x0a, 0x04, &[]).unwrap();

        assert_eq!(frame, [0xB5, 0x62, 0x0A, 0x04, 0x00, 0x00, 0x0E, 0x34]);
    }

    #[test]
    fn frame_with_payload() {
        // CFG-MSG enabling NAV-PVT on the current port.
        let frame = encode_to_vec(0x06, 0x01, &[0x01, 0x07, 0x01]).unwrap();

        assert_eq!(
            frame,
            [0xB5, 0x62, 0x06, 0x01, 0x03, 0x00, 0x01, 0x07, 0x01, 0x13, 0x51]
        );

        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.class, 0x06);
        assert_eq!(decoded.id, 0x01);
        assert_eq!(decoded.payload, &[0x01, 0x07, 0x01]);
        assert_eq!(decoded.frame_len(), frame.len());
    }

    #[test]
    fn encode_needs_room() {
        let mut out = [0u8; 9];

        assert!(matches!(
            encode(1, 2, &[0, 0], &mut out),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(encode(1, 2, &[0], &mut out), Ok(9));
    }

    #[test]
    fn partial_frames_are_incomplete() {
        let frame = encode_to_vec(0x01, 0x07, &[1, 2, 3, 4]).unwrap();

        for cut in 0..frame.len() {
            assert!(
                matches!(decode(&frame[..cut]), Err(Error::Incomplete { .. })),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn missing_bytes_are_counted() {
        let frame = encode_to_vec(0x01, 0x07, &[1, 2, 3, 4]).unwrap();

        assert_eq!(
            decode(&frame[..7]),
            Err(Error::Incomplete {
                needed: frame.len() - 7
            })
        );
    }

    #[test]
    fn bad_sync_is_reported() {
        let mut frame = encode_to_vec(0x01, 0x07, &[]).unwrap();
        frame[1] = 0x63;

        assert_eq!(decode(&frame), Err(Error::NoSync));
        assert_eq!(decode(b"$GNGGA"), Err(Error::NoSync));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut frame = encode_to_vec(0x05, 0x01, &[0x06, 0x8a]).unwrap();
        frame.extend_from_slice(&[0xB5, 0x62, 0x00]);

        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.payload, &[0x06, 0x8a]);
    }

    #[test]
    fn little_endian_helpers() {
        assert_eq!(uint16_decode(&[0x34, 0x12]), 0x1234);
        assert_eq!(uint32_decode(&[0x78, 0x56, 0x34, 0x12, 0xff]), 0x1234_5678);
        assert_eq!(int32_decode(&[0xff, 0xff, 0xff, 0xff]), -1);
        assert_eq!(uint16_encode(0x1234), [0x34, 0x12]);
        assert_eq!(uint32_encode(0x1234_5678), [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(int32_decode(&int32_encode(-123_456)), -123_456);
    }
}
