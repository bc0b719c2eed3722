use std::{path::Path, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::{at::AtOptions, error::Error};

/// The serial port a module is connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// The path to the port.
    /// Likely "/dev/ttyACMx" or "COMx".
    pub path: String,

    /// Baud rate.
    #[serde(default = "SerialConfig::default_baud")]
    pub baud: u32,

    /// Flow control.
    #[serde(default = "SerialConfig::default_flow_control")]
    pub flow_control: serialport::FlowControl,

    /// How many times to try opening the port before giving up.
    /// Useful if the module is still booting.
    #[serde(default = "SerialConfig::default_open_attempts")]
    pub open_attempts: u32,
}

impl SerialConfig {
    fn default_baud() -> u32 {
        115_200
    }

    fn default_flow_control() -> serialport::FlowControl {
        serialport::FlowControl::None
    }

    fn default_open_attempts() -> u32 {
        1
    }

    /// A port at `path` with default settings.
    pub fn new(path: &str) -> Self {
        Self {
            path: path.into(),
            baud: Self::default_baud(),
            flow_control: Self::default_flow_control(),
            open_attempts: Self::default_open_attempts(),
        }
    }
}

/// Logging to a directory of daily rolling files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLogging {
    /// Least severe level written, such as "debug".
    pub level: String,

    /// Where the files go.
    pub directory: PathBuf,
}

/// How to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Least severe level printed to stdout, such as "info".
    /// `RUST_LOG` takes precedence if set.
    pub stdout_level: String,

    /// Also log to files.
    pub file: Option<FileLogging>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            stdout_level: "info".into(),
            file: None,
        }
    }
}

fn parse_level(level: &str) -> Result<Level, Error> {
    Level::from_str(level).map_err(|_| Error::InvalidParameter(format!("unknown log level {level:?}")))
}

impl LogOptions {
    /// The stdout level, and the file level with its directory.
    pub fn levels(&self) -> Result<(Level, Option<(Level, PathBuf)>), Error> {
        let stdout = parse_level(&self.stdout_level)?;

        let file = match &self.file {
            Some(file) => Some((parse_level(&file.level)?, file.directory.clone())),
            None => None,
        };

        Ok((stdout, file))
    }
}

/// The configuration used for running the command line tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// How the AT client behaves.
    pub at: AtOptions,

    /// The port the module is on.
    pub serial: Option<SerialConfig>,

    /// The module is in extended data mode:
    /// AT traffic is wrapped in EDM packets.
    pub edm: bool,

    /// Logging.
    pub logging: LogOptions,
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        let config = Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::InvalidParameter(format!("bad configuration: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            at: AtOptions {
                print_at: true,
                ..Default::default()
            },
            serial: Some(SerialConfig::new("/dev/ttyACM0")),
            edm: false,
            logging: LogOptions {
                stdout_level: "info".into(),
                file: Some(FileLogging {
                    level: "debug".into(),
                    directory: "logs".into(),
                }),
            },
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::InvalidParameter(format!("could not serialize configuration: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidParameter(format!("could not read configuration {path:?}: {e}"))
        })?;

        Self::deserialize(&s)
    }

    fn validate(&self) -> Result<(), Error> {
        crate::at::delimiter_byte(self.at.delimiter)?;
        self.logging.levels()?;

        if let Some(serial) = &self.serial {
            if serial.path.is_empty() {
                return Err(Error::InvalidParameter("empty serial port path".into()));
            }
            if serial.open_attempts == 0 {
                return Err(Error::InvalidParameter(
                    "the serial port must be opened at least once".into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn serialize() {
        let c = Config::example();

        println!("{}", c.serialize_pretty().unwrap());
    }

    #[test]
    fn example_survives_a_trip() {
        let c = Config::example();

        let back = Config::deserialize(&c.serialize_pretty().unwrap()).unwrap();

        assert_eq!(c, back);
    }

    #[test]
    fn deserialize_partial() {
        let input = r#"
(
    serial: (
        path: "/dev/ttyUSB1",
        baud: 921600,
    ),
    at: (
        timeout_ms: 2000,
        print_at: true,
    ),
)
"#;
        let config = Config::deserialize(input).unwrap();

        let serial = config.serial.unwrap();
        assert_eq!(serial.baud, 921_600);
        assert_eq!(serial.flow_control, serialport::FlowControl::None);
        assert_eq!(config.at.timeout_ms, 2000);
        assert_eq!(config.at.delimiter, ',');
        assert!(!config.edm);
        assert_eq!(config.logging, LogOptions::default());
    }

    #[test]
    fn bad_level() {
        let input = r#"(logging: (stdout_level: "loud"))"#;

        let err = Config::deserialize(input).unwrap_err();

        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn bad_delimiter() {
        let input = r#"(at: (delimiter: 'x'))"#;

        assert!(matches!(
            Config::deserialize(input),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn not_ron() {
        assert!(Config::deserialize("{ \"json\": true }").is_err());
    }
}
