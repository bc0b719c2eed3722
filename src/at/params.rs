use bytes::Bytes;

use crate::error::Error;

/// The parameters of one response or URC line, read in order.
///
/// `+CGDCONT: 1,"IP","internet"` yields `1`, then `IP`, then `internet`.
/// Quoted parameters may contain the delimiter.
#[derive(Debug, Clone)]
pub struct Params {
    data: Bytes,
    pos: usize,
    end: usize,
    delimiter: u8,
}

struct Token {
    start: usize,
    end: usize,
}

impl Params {
    pub(crate) fn new(data: Bytes, delimiter: u8) -> Self {
        let end = data
            .iter()
            .rposition(|byte| !matches!(byte, b'\r' | b'\n'))
            .map_or(0, |last| last + 1);

        Self {
            data,
            pos: 0,
            end,
            delimiter,
        }
    }

    /// Whether all parameters have been read.
    pub fn is_empty(&self) -> bool {
        self.data[self.pos.min(self.end)..self.end]
            .iter()
            .all(|byte| *byte == b' ')
    }

    /// What has not been read yet, without the line terminator.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos.min(self.end)..self.end]
    }

    /// Like [`Self::remaining`], as text with leading spaces removed.
    pub fn remaining_lossy(&self) -> String {
        String::from_utf8_lossy(self.remaining())
            .trim_start()
            .to_string()
    }

    pub(crate) fn skip_to_end(&mut self) {
        self.pos = self.end;
    }

    fn skip_spaces(&mut self) {
        while self.pos < self.end && self.data[self.pos] == b' ' {
            self.pos += 1;
        }
    }

    fn next_token(&mut self) -> Result<Token, Error> {
        self.skip_spaces();

        if self.pos >= self.end {
            return Err(Error::NotFound("no more parameters".into()));
        }

        let token = if self.data[self.pos] == b'"' {
            let start = self.pos + 1;
            let end = self.data[start..self.end]
                .iter()
                .position(|byte| *byte == b'"')
                .map_or(self.end, |close| start + close);

            // Past the closing quote, then up to the delimiter.
            self.pos = (end + 1).min(self.end);
            self.skip_spaces();

            Token { start, end }
        } else {
            let start = self.pos;
            let stop = self.data[start..self.end]
                .iter()
                .position(|byte| *byte == self.delimiter)
                .map_or(self.end, |delimiter| start + delimiter);

            let end = self.data[start..stop]
                .iter()
                .rposition(|byte| *byte != b' ')
                .map_or(start, |last| start + last + 1);

            self.pos = stop;
            Token { start, end }
        };

        if self.pos < self.end && self.data[self.pos] == self.delimiter {
            self.pos += 1;
        }

        Ok(token)
    }

    fn token_text(&mut self) -> Result<&str, Error> {
        let token = self.next_token()?;

        std::str::from_utf8(&self.data[token.start..token.end])
            .map_err(|_| Error::BadResponse("parameter is not text".into()))
    }

    /// Read a signed integer parameter.
    pub fn read_int(&mut self) -> Result<i32, Error> {
        let text = self.token_text()?;

        text.parse()
            .map_err(|_| Error::BadResponse(format!("{text:?} is not an integer")))
    }

    /// Read an unsigned 64 bit parameter.
    pub fn read_uint64(&mut self) -> Result<u64, Error> {
        let text = self.token_text()?;

        text.parse()
            .map_err(|_| Error::BadResponse(format!("{text:?} is not an unsigned integer")))
    }

    /// Read a string parameter. Quotes, if present, are removed.
    pub fn read_string(&mut self) -> Result<String, Error> {
        let token = self.next_token()?;

        Ok(String::from_utf8_lossy(&self.data[token.start..token.end]).into_owned())
    }

    /// Skip `count` parameters.
    pub fn skip(&mut self, count: usize) -> Result<(), Error> {
        for _ in 0..count {
            self.next_token()?;
        }
        Ok(())
    }

    /// Take up to `len` bytes as they are, line terminator included.
    pub(crate) fn take_raw(&mut self, len: usize) -> Bytes {
        let start = self.pos.min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());

        self.pos = end;
        self.data.slice(start..end)
    }
}
