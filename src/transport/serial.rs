//! A serial port transport.

use std::time::Duration;

use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{error, info};

use crate::{config::SerialConfig, error::Error};

/// Builder for a serial port [`SerialStream`], usable as an AT transport.
#[derive(Debug, Default)]
pub struct SerialTransportBuilder {
    baud: Option<u32>,
    flow_control: Option<serialport::FlowControl>,
    path: String,
}

impl SerialTransportBuilder {
    /// Start a new builder.
    /// The tty should likely be along the lines of `/dev/ttyACMx` on unix, and `COMx` on Windows.
    pub fn new(tty: &str) -> Self {
        Self {
            path: tty.to_string(),
            ..Default::default()
        }
    }

    /// A builder with the settings of a configuration file.
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(&config.path)
            .set_baud(config.baud)
            .set_flow_control(config.flow_control)
    }

    /// Set the serial port builder's baud.
    /// Will use 115_200 if not set.
    pub fn set_baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    /// Set the flow control.
    /// Will use no flow control if not set.
    pub fn set_flow_control(mut self, flow_control: serialport::FlowControl) -> Self {
        self.flow_control = Some(flow_control);
        self
    }

    /// Open the port.
    pub fn open(&self) -> Result<SerialStream, Error> {
        let baud = self.baud.unwrap_or(115_200);
        let flow_control = self.flow_control.unwrap_or(serialport::FlowControl::None);

        info!(%self.path, %baud, ?flow_control, "Opening serial port");

        tokio_serial::new(&self.path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| {
                Error::Transport(format!("Could not open port at {}, problem: {e}", self.path))
            })
    }

    /// Open the port, trying again every `interval` if it is not there (yet).
    ///
    /// Gives up after `attempts` tries, returning the last error.
    pub async fn open_with_retries(
        &self,
        attempts: u32,
        interval: Duration,
    ) -> Result<SerialStream, Error> {
        let mut attempt = 1;

        loop {
            match self.open() {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    error!(?e, attempt, "Serial port connection error. Retrying in {interval:?}...");
                    tokio::time::sleep(interval).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_port_is_a_transport_error() {
        let result = SerialTransportBuilder::new("/dev/this-port-does-not-exist").open();

        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn retries_give_up() {
        let result = SerialTransportBuilder::new("/dev/this-port-does-not-exist")
            .set_baud(9600)
            .open_with_retries(2, Duration::from_millis(1))
            .await;

        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
