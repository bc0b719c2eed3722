use std::{fmt::Debug, time::Duration};

use bytes::BytesMut;
use tokio::{
    io::AsyncWriteExt,
    sync::{oneshot, OwnedMutexGuard},
    time::Instant,
};
use tracing::{debug, info, trace, warn};

use crate::{
    at::{
        client::{AtClient, Writer},
        delimiter_byte,
        params::Params,
        receiver::{Ingress, Response},
        stop_tag::StopTag,
        Settings,
    },
    codecs::lines::trim,
    error::Error,
};

/// Exclusive use of an [`AtClient`], for one or more commands and their
/// responses.
///
/// The first error in an exchange sticks: every later operation returns it
/// without doing anything, and so does [`AtExchange::unlock`].
/// A failed exchange makes the receive task drop what it has buffered.
///
/// ```no_run
/// # async fn f(client: ubxlib::at::AtClient) -> Result<(), ubxlib::error::Error> {
/// let mut exchange = client.lock().await?;
/// exchange.command_start("AT+CGDCONT=")?;
/// exchange.write_int(1)?;
/// exchange.write_string("IP", true)?;
/// exchange.command_stop().await?;
/// exchange.response_stop().await?;
/// exchange.unlock()
/// # }
/// ```
///
/// Dropping an exchange unlocks it too.
pub struct AtExchange {
    client: AtClient,
    writer: OwnedMutexGuard<Writer>,
    settings: Settings,
    deadline: Instant,

    /// The command being built.
    command: Vec<u8>,
    parameters: usize,

    /// The response line being read.
    params: Option<Params>,

    /// The stop tag of the current response has been seen.
    stopped: bool,
    ignore_stop_tag: bool,
    truncated: bool,

    error: Option<Error>,
    finished: bool,
}

impl Debug for AtExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtExchange")
            .field("client", &self.client)
            .field("command", &String::from_utf8_lossy(&self.command))
            .field("error", &self.error)
            .finish()
    }
}

impl AtExchange {
    pub(crate) fn new(client: AtClient, writer: OwnedMutexGuard<Writer>, settings: Settings) -> Self {
        trace!(client = client.id(), "Exchange started");

        Self {
            deadline: Instant::now() + settings.timeout,
            client,
            writer,
            settings,
            command: vec![],
            parameters: 0,
            params: None,
            stopped: false,
            ignore_stop_tag: false,
            truncated: false,
            error: None,
            finished: false,
        }
    }

    fn check(&self) -> Result<(), Error> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Remember the first error of the exchange.
    fn fail(&mut self, e: Error) -> Error {
        if self.error.is_none() {
            debug!(%e, "Exchange failed");
            self.error = Some(e.clone());
        }
        e
    }

    /// The first error so far, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Give the rest of the exchange `timeout`, counting from now.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }

    /// Use another parameter delimiter for the rest of this exchange.
    pub fn set_delimiter(&mut self, delimiter: char) -> Result<(), Error> {
        self.check()?;
        self.settings.delimiter = delimiter_byte(delimiter).map_err(|e| self.fail(e))?;
        Ok(())
    }

    /// Start a command, such as `AT+CGMI` or `AT+CGDCONT=`.
    pub fn command_start(&mut self, command: &str) -> Result<(), Error> {
        self.check()?;

        if command.is_empty() || command.contains(['\r', '\n']) {
            return Err(self.fail(Error::InvalidParameter(format!(
                "{command:?} is not a command"
            ))));
        }

        self.command.clear();
        self.command.extend_from_slice(command.as_bytes());
        self.parameters = 0;
        Ok(())
    }

    fn ensure_command(&mut self) -> Result<(), Error> {
        self.check()?;

        if self.command.is_empty() {
            return Err(self.fail(Error::InvalidParameter("no command started".into())));
        }
        Ok(())
    }

    fn separate(&mut self) {
        if self.parameters > 0 {
            self.command.push(self.settings.delimiter);
        }
        self.parameters += 1;
    }

    /// Append an integer parameter.
    pub fn write_int(&mut self, value: i32) -> Result<(), Error> {
        self.ensure_command()?;

        self.separate();
        self.command.extend_from_slice(value.to_string().as_bytes());
        Ok(())
    }

    /// Append an unsigned 64 bit parameter.
    pub fn write_uint64(&mut self, value: u64) -> Result<(), Error> {
        self.ensure_command()?;

        self.separate();
        self.command.extend_from_slice(value.to_string().as_bytes());
        Ok(())
    }

    /// Append a string parameter, in quotes if `quoted`.
    pub fn write_string(&mut self, value: &str, quoted: bool) -> Result<(), Error> {
        self.ensure_command()?;

        if value.contains(['\r', '\n']) || (quoted && value.contains('"')) {
            return Err(self.fail(Error::InvalidParameter(format!(
                "{value:?} can not be sent as a parameter"
            ))));
        }

        self.separate();
        if quoted {
            self.command.push(b'"');
        }
        self.command.extend_from_slice(value.as_bytes());
        if quoted {
            self.command.push(b'"');
        }
        Ok(())
    }

    /// Append bytes as they are.
    ///
    /// If `standalone` they are glued to what came before,
    /// otherwise they are a new parameter.
    pub fn write_bytes(&mut self, bytes: &[u8], standalone: bool) -> Result<(), Error> {
        self.ensure_command()?;

        if !standalone {
            self.separate();
        }
        self.command.extend_from_slice(bytes);
        Ok(())
    }

    /// Send the command.
    pub async fn command_stop(&mut self) -> Result<(), Error> {
        self.ensure_command()?;

        // Pace commands, some modules drop characters otherwise.
        let delay = self.settings.command_delay;
        self.client.wait_command_delay(delay).await;

        let echo = self
            .settings
            .echo_suppression
            .then(|| trim(&self.command).to_vec());
        self.client
            .send(Ingress::Sent { echo })
            .map_err(|e| self.fail(e))?;

        let mut command = std::mem::take(&mut self.command);
        if self.settings.print_at {
            info!("-> {}", String::from_utf8_lossy(&command));
        } else {
            trace!("-> {}", String::from_utf8_lossy(&command));
        }
        command.extend_from_slice(&self.settings.terminator);

        self.write(&command).await?;

        self.params = None;
        self.stopped = false;
        self.truncated = false;
        Ok(())
    }

    /// Write bytes without any formatting, such as data after a prompt.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.check()?;

        trace!("-> {} raw byte(s)", bytes.len());
        self.write(bytes).await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let written = tokio::time::timeout_at(self.deadline, async {
            self.writer.write_all(bytes).await?;
            self.writer.flush().await
        })
        .await;

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(e.into())),
            Err(_) => Err(self.fail(Error::Timeout)),
        }
    }

    /// Ask the receive task for something, waiting until the deadline.
    async fn request<T>(
        &mut self,
        make: impl FnOnce(oneshot::Sender<T>) -> Ingress,
    ) -> Result<T, Error> {
        self.check()?;

        let (reply, response) = oneshot::channel();
        self.client.send(make(reply)).map_err(|e| self.fail(e))?;

        match tokio::time::timeout_at(self.deadline, response).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(self.fail(Error::Closed)),
            Err(_) => {
                warn!("Timed out waiting for the module");
                Err(self.fail(Error::Timeout))
            }
        }
    }

    /// Wait for a prompt character, such as `>` or `@`.
    pub async fn wait_character(&mut self, character: u8) -> Result<(), Error> {
        self.request(|reply| Ingress::Prompt { character, reply })
            .await
    }

    /// Wait for the next response line.
    ///
    /// With a prefix, lines which do not start with it are skipped and
    /// reading starts after the prefix. Without, any line will do.
    ///
    /// Returns `false` if the stop tag came first: there are no
    /// (more) lines in the response.
    pub async fn response_start(&mut self, prefix: Option<&str>) -> Result<bool, Error> {
        self.check()?;
        self.params = None;

        if self.stopped {
            return Ok(false);
        }

        let prefix = prefix.map(|prefix| prefix.as_bytes().to_vec());
        let ignore_stop_tag = self.ignore_stop_tag;

        let response = self
            .request(|reply| Ingress::Line {
                prefix,
                ignore_stop_tag,
                reply,
            })
            .await?;

        match response {
            Response::Line(line) => {
                if line.truncated {
                    self.truncated = true;
                }
                self.params = Some(Params::new(line.bytes, self.settings.delimiter));
                Ok(true)
            }
            Response::Stop(tag) => {
                self.stop_tag(tag)?;
                Ok(false)
            }
        }
    }

    fn stop_tag(&mut self, tag: StopTag) -> Result<(), Error> {
        self.stopped = true;

        match tag {
            StopTag::Ok => Ok(()),
            StopTag::Error(device_error) => {
                self.client.record_device_error(device_error.clone());
                Err(self.fail(Error::Device(device_error)))
            }
        }
    }

    fn params(&mut self) -> Result<&mut Params, Error> {
        self.check()?;

        match self.params {
            Some(ref mut params) => Ok(params),
            None => Err(self.fail(Error::NotFound("no response line to read from".into()))),
        }
    }

    fn read<T>(&mut self, read: impl FnOnce(&mut Params) -> Result<T, Error>) -> Result<T, Error> {
        let result = read(self.params()?);
        result.map_err(|e| self.fail(e))
    }

    /// Read an integer parameter.
    pub fn read_int(&mut self) -> Result<i32, Error> {
        self.read(Params::read_int)
    }

    /// Read an unsigned 64 bit parameter.
    pub fn read_uint64(&mut self) -> Result<u64, Error> {
        self.read(Params::read_uint64)
    }

    /// Read a string parameter, without its quotes.
    pub fn read_string(&mut self) -> Result<String, Error> {
        self.read(Params::read_string)
    }

    /// The unread rest of the response line, as text.
    pub fn read_remaining(&mut self) -> Result<String, Error> {
        self.read(|params| {
            let rest = params.remaining_lossy();
            params.skip_to_end();
            Ok(rest)
        })
    }

    /// Skip parameters.
    pub fn skip_parameters(&mut self, count: usize) -> Result<(), Error> {
        self.read(|params| params.skip(count))
    }

    /// Read exactly `len` bytes, whatever they are, line breaks included.
    ///
    /// Reading starts where the response line was left and may continue
    /// past its end.
    pub async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        self.check()?;

        let mut bytes = BytesMut::with_capacity(len);
        if let Some(params) = self.params.as_mut() {
            bytes.extend_from_slice(&params.take_raw(len));
        }

        if bytes.len() < len {
            let rest = bytes.len();
            let more = self
                .request(|reply| Ingress::Raw {
                    len: len - rest,
                    reply,
                })
                .await?;
            bytes.extend_from_slice(&more);
        }

        Ok(bytes.to_vec())
    }

    /// Skip `len` bytes, see [`AtExchange::read_bytes`].
    pub async fn skip_bytes(&mut self, len: usize) -> Result<(), Error> {
        self.read_bytes(len).await.map(|_| ())
    }

    /// Treat stop tags as ordinary lines, for responses whose data may
    /// contain one. [`AtExchange::response_stop`] turns this off again.
    pub fn ignore_stop_tag(&mut self) {
        self.ignore_stop_tag = true;
    }

    /// Finish the response: skip any lines left and wait for the stop tag.
    ///
    /// Fails with [`Error::Device`] on an error stop tag, and with
    /// [`Error::Truncated`] if a response line did not fit.
    pub async fn response_stop(&mut self) -> Result<(), Error> {
        self.check()?;
        self.params = None;
        self.ignore_stop_tag = false;

        while !self.stopped {
            let response = self
                .request(|reply| Ingress::Line {
                    prefix: None,
                    ignore_stop_tag: false,
                    reply,
                })
                .await?;

            match response {
                Response::Line(line) => {
                    if line.truncated {
                        self.truncated = true;
                    }
                    debug!(
                        "Skipping response line {:?}",
                        String::from_utf8_lossy(line.trimmed())
                    );
                }
                Response::Stop(tag) => self.stop_tag(tag)?,
            }
        }

        // Ready for another command.
        self.stopped = false;

        if self.truncated {
            self.truncated = false;
            let capacity = self.client.line_capacity();
            return Err(self.fail(Error::Truncated(capacity)));
        }
        Ok(())
    }

    /// End the exchange, returning its first error.
    pub fn unlock(mut self) -> Result<(), Error> {
        self.finish();

        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let flush = self.error.is_some();
        let _ = self.client.send(Ingress::End { flush });
        self.client.exchange_ended(self.error.as_ref());

        trace!(client = self.client.id(), "Exchange over");
    }
}

impl Drop for AtExchange {
    fn drop(&mut self) {
        self.finish();
    }
}
