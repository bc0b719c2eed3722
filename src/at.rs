use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

mod callback;
mod client;
mod exchange;
mod params;
mod receiver;
mod stop_tag;
mod urc;

pub use client::AtClient;
pub use exchange::AtExchange;
pub use params::Params;
pub use urc::Urc;

/// Longest time a single AT exchange may take by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(8000);

/// Default minimum time between the end of one exchange and the next command.
pub const DEFAULT_COMMAND_DELAY: Duration = Duration::from_millis(25);

/// Default maximum length of a received line.
pub const DEFAULT_LINE_CAPACITY: usize = 1024;

/// Options for an [`AtClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtOptions {
    /// How long an exchange may take, in milliseconds.
    pub timeout_ms: u64,

    /// Separator between command and response parameters.
    pub delimiter: char,

    /// Throw away the module's echo of each command.
    pub echo_suppression: bool,

    /// What terminates a command.
    pub command_terminator: String,

    /// Least time between the end of an exchange and the next command,
    /// in milliseconds.
    pub command_delay_ms: u64,

    /// Received lines longer than this are cut.
    pub line_capacity: usize,

    /// How many callbacks can be waiting to run.
    pub callback_queue_depth: usize,

    /// Log AT traffic at info level.
    pub print_at: bool,
}

impl Default for AtOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            delimiter: ',',
            echo_suppression: true,
            command_terminator: "\r".into(),
            command_delay_ms: DEFAULT_COMMAND_DELAY.as_millis() as u64,
            line_capacity: DEFAULT_LINE_CAPACITY,
            callback_queue_depth: 10,
            print_at: false,
        }
    }
}

/// The subset of [`AtOptions`] which can change while a client runs.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) timeout: Duration,
    pub(crate) delimiter: u8,
    pub(crate) echo_suppression: bool,
    pub(crate) terminator: Vec<u8>,
    pub(crate) command_delay: Duration,
    pub(crate) print_at: bool,
}

impl TryFrom<&AtOptions> for Settings {
    type Error = Error;

    fn try_from(options: &AtOptions) -> Result<Self, Self::Error> {
        if options.command_terminator.is_empty() {
            return Err(Error::InvalidParameter(
                "the command terminator can not be empty".into(),
            ));
        }
        if options.line_capacity < 2 {
            return Err(Error::InvalidParameter(format!(
                "line capacity {} is too small",
                options.line_capacity
            )));
        }
        if options.callback_queue_depth == 0 {
            return Err(Error::InvalidParameter(
                "the callback queue needs room for at least one callback".into(),
            ));
        }

        Ok(Self {
            timeout: Duration::from_millis(options.timeout_ms),
            delimiter: delimiter_byte(options.delimiter)?,
            echo_suppression: options.echo_suppression,
            terminator: options.command_terminator.as_bytes().to_vec(),
            command_delay: Duration::from_millis(options.command_delay_ms),
            print_at: options.print_at,
        })
    }
}

pub(crate) fn delimiter_byte(delimiter: char) -> Result<u8, Error> {
    match u8::try_from(delimiter) {
        Ok(byte) if byte.is_ascii_punctuation() && byte != b'"' => Ok(byte),
        _ => Err(Error::InvalidParameter(format!(
            "{delimiter:?} can not be used as a delimiter"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::try_from(&AtOptions::default()).unwrap();

        assert_eq!(settings.delimiter, b',');
        assert_eq!(settings.terminator, b"\r");
        assert_eq!(settings.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn bad_delimiters() {
        for delimiter in ['"', 'a', ' ', 'é'] {
            assert!(
                matches!(delimiter_byte(delimiter), Err(Error::InvalidParameter(_))),
                "{delimiter:?}"
            );
        }
        assert_eq!(delimiter_byte(';').unwrap(), b';');
    }

    #[test]
    fn empty_terminator() {
        let options = AtOptions {
            command_terminator: String::new(),
            ..Default::default()
        };

        assert!(Settings::try_from(&options).is_err());
    }
}
