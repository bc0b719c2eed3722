use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::{
    error::Error,
    ubx::{self, SYNC_CHAR_1, SYNC_CHAR_2},
};

/// An owned UBX message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UbxMessage {
    /// Message class.
    pub class: u8,

    /// Message id within the class.
    pub id: u8,

    /// The message body.
    pub payload: Bytes,
}

impl UbxMessage {
    /// A new message.
    pub fn new<B: Into<Bytes>>(class: u8, id: u8, payload: B) -> Self {
        Self {
            class,
            id,
            payload: payload.into(),
        }
    }
}

/// Finds UBX frames in a byte stream which may carry other things too
/// (NMEA sentences, for example).
///
/// Bytes before a sync pair are skipped.
/// A frame which fails its checksum is dropped by skipping its first sync
/// character, and the search starts over from there.
#[derive(Debug, Default)]
pub struct UbxCodec {
    /// Bytes thrown away so far, for diagnostics.
    discarded: usize,
}

impl UbxCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many bytes were skipped because they were not part of a valid frame.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn skip(&mut self, src: &mut BytesMut, count: usize) {
        if count > 0 {
            trace!("Skipping {count} byte(s) looking for UBX sync");
            src.advance(count);
            self.discarded += count;
        }
    }
}

fn find_sync(src: &[u8]) -> Option<usize> {
    src.windows(2)
        .position(|pair| pair == [SYNC_CHAR_1, SYNC_CHAR_2])
}

impl Decoder for UbxCodec {
    type Item = UbxMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match find_sync(src) {
                Some(start) => self.skip(src, start),
                None => {
                    // Keep a trailing first sync character, its partner may be next.
                    let keep = usize::from(src.last() == Some(&SYNC_CHAR_1));
                    let drop = src.len() - keep;
                    self.skip(src, drop);

                    return Ok(None);
                }
            }

            match ubx::decode(src) {
                Ok(frame) => {
                    let message = UbxMessage {
                        class: frame.class,
                        id: frame.id,
                        payload: Bytes::copy_from_slice(frame.payload),
                    };

                    let frame_len = frame.frame_len();
                    src.advance(frame_len);

                    return Ok(Some(message));
                }
                Err(Error::Incomplete { needed }) => {
                    src.reserve(needed);
                    return Ok(None);
                }
                Err(e) => {
                    warn!("Dropping UBX frame: {e}");
                    self.skip(src, 1);
                }
            }
        }
    }
}

impl Encoder<UbxMessage> for UbxCodec {
    type Error = Error;

    fn encode(&mut self, item: UbxMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.resize(start + item.payload.len() + ubx::PROTOCOL_OVERHEAD, 0);

        if let Err(e) = ubx::encode(item.class, item.id, &item.payload, &mut dst[start..]) {
            dst.truncate(start);
            return Err(e);
        }

        Ok(())
    }
}
