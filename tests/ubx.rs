use color_eyre::Result;
use pretty_assertions::assert_eq;
use ubxlib::{error::Error, ubx};

#[test]
fn nav_pvt_sized_frame() -> Result<()> {
    let payload: Vec<u8> = (0..92).collect();
    let frame = ubx::encode_to_vec(0x01, 0x07, &payload)?;

    assert_eq!(frame.len(), payload.len() + ubx::PROTOCOL_OVERHEAD);

    // Trailing bytes belong to whatever comes next.
    let mut stream = frame.clone();
    stream.extend_from_slice(&[ubx::SYNC_CHAR_1, ubx::SYNC_CHAR_2]);

    let decoded = ubx::decode(&stream)?;
    assert_eq!((decoded.class, decoded.id), (0x01, 0x07));
    assert_eq!(decoded.payload, &payload[..]);
    assert_eq!(decoded.frame_len(), frame.len());

    Ok(())
}

#[test]
fn corrupted_frames_are_rejected() -> Result<()> {
    let frame = ubx::encode_to_vec(0x06, 0x8a, b"\x00\x01\x00\x00\x21\x00\x11\x20\x08")?;

    for index in 0..frame.len() {
        // A different length makes for an incomplete or misaligned frame,
        // that is covered elsewhere.
        if index == 4 || index == 5 {
            continue;
        }

        for bit in 0..8 {
            let mut corrupted = frame.clone();
            corrupted[index] ^= 1 << bit;

            let expected = if index < 2 {
                Error::NoSync
            } else {
                Error::Checksum
            };

            assert_eq!(ubx::decode(&corrupted).err(), Some(expected), "byte {index} bit {bit}");
        }
    }

    Ok(())
}

#[test]
fn short_buffers_ask_for_more() -> Result<()> {
    let frame = ubx::encode_to_vec(0x0a, 0x04, &[])?;

    for len in 0..frame.len() {
        assert!(
            matches!(ubx::decode(&frame[..len]), Err(Error::Incomplete { .. })),
            "{len} byte(s)"
        );
    }
    assert!(ubx::decode(&frame).is_ok());

    Ok(())
}
