use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::Error;

/// A line split off a byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// The bytes of the line.
    /// Includes the delimiter, unless the line was truncated.
    pub bytes: Bytes,

    /// The line hit the maximum length before a delimiter was seen.
    /// The rest of it will arrive as the next line.
    pub truncated: bool,
}

impl Line {
    /// The line without its delimiter and any carriage returns
    /// or whitespace around it.
    pub fn trimmed(&self) -> &[u8] {
        trim(&self.bytes)
    }
}

/// `bytes` without leading or trailing ASCII whitespace.
pub fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |last| last + 1);

    &bytes[start..end]
}

/// This codec has a configurable delimiter character for reading,
/// and optionally adds a character to each line it encodes.
///
/// Unlike most line codecs the delimiter is kept in the yielded lines,
/// so the exact bytes on wire can be reconstructed.
#[derive(Debug, Clone)]
pub struct LinesCodec {
    /// How far we have looked for a delimiter into the buffer
    cursor: usize,

    /// How to delimit incoming byte streams.
    read_delimiter: u8,

    /// If provided, which byte to append when writing (encoding) messages.
    /// If `None`, forwards the data as-is.
    write_delimiter: Option<u8>,

    /// Longest line yielded, delimiter included.
    max_length: usize,
}

impl LinesCodec {
    /// Create a new codec.
    pub fn new(read_delimiter: u8, write_delimiter: Option<u8>) -> Self {
        Self {
            cursor: 0,
            read_delimiter,
            write_delimiter,
            max_length: usize::MAX,
        }
    }

    /// Cut lines which grow beyond `max_length` bytes.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length.max(1);
        self
    }

    /// Forget how far the buffer has been searched.
    ///
    /// Must be called if bytes are taken out of the buffer by something else
    /// than this codec.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

impl Default for LinesCodec {
    fn default() -> Self {
        Self::new(b'\n', None)
    }
}

impl Decoder for LinesCodec {
    type Item = Line;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Never look further than a full line.
        let read_to = src.len().min(self.max_length);
        let start = self.cursor.min(read_to);

        let look_at = &src[start..read_to];

        if let Some(position) = look_at.iter().position(|&byte| byte == self.read_delimiter) {
            // Since we might "start late" in the buffer (from the cursor),
            // the "global" position within the buffer has to be calculated.
            let actual_position = start + position;

            // Next time we need to start over.
            self.cursor = 0;

            let line = src.split_to(actual_position + 1).freeze();

            Ok(Some(Line {
                bytes: line,
                truncated: false,
            }))
        } else if read_to == self.max_length {
            self.cursor = 0;

            warn!(
                "Line exceeds {} bytes without a delimiter, cutting it",
                self.max_length
            );

            Ok(Some(Line {
                bytes: src.split_to(read_to).freeze(),
                truncated: true,
            }))
        } else {
            // We did not find a full frame.
            // The next time we are called the same buffer `src` will be provided to us (same starting point),
            // but possibly with more data.
            // Since our job is to find the delimiter, we don't need to re-read the bytes we have already looked at.
            self.cursor = read_to;

            // Indicate that we need more bytes to look at.
            Ok(None)
        }
    }
}

impl Encoder<Vec<u8>> for LinesCodec {
    type Error = Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&[u8]>::encode(self, item.as_slice(), dst)
    }
}

impl<'a> Encoder<&'a [u8]> for LinesCodec {
    type Error = Error;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item);

        if let Some(character) = self.write_delimiter {
            dst.extend_from_slice(&[character]);
        }
        Ok(())
    }
}
