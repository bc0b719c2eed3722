//! The receive task of an AT client.
//!
//! The task owns the read half of the transport and everything buffered from
//! it. The exchange in flight asks it for what it expects next (a line, some
//! raw bytes, a prompt character) and it serves those requests from the
//! buffer. Lines nobody asked for are checked against the registered URC
//! prefixes.
//!
//! Bytes are only split into lines when someone wants a line, so binary data
//! read with [`AtExchange::read_bytes`](crate::at::AtExchange::read_bytes)
//! is never mistaken for line breaks.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{mpsc, oneshot},
};
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use crate::{
    at::{
        client::Shared,
        stop_tag::StopTag,
        urc::{self, after_prefix},
    },
    codecs::lines::{Line, LinesCodec},
};

/// What an exchange tells the receive task.
#[derive(Debug)]
pub(crate) enum Ingress {
    /// An exchange started: hold on to unrequested lines.
    Begin,

    /// A command went out. Drop its echo, if given.
    Sent { echo: Option<Vec<u8>> },

    /// The next response line, or the stop tag.
    Line {
        /// Only lines starting with this. `None` means any line.
        prefix: Option<Vec<u8>>,
        ignore_stop_tag: bool,
        reply: oneshot::Sender<Response>,
    },

    /// Exactly `len` bytes, whatever they are.
    Raw {
        len: usize,
        reply: oneshot::Sender<Bytes>,
    },

    /// Wait for a single character, such as the `@` or `>` prompt.
    Prompt {
        character: u8,
        reply: oneshot::Sender<()>,
    },

    /// The exchange is over. If `flush`, drop everything buffered.
    End { flush: bool },

    /// Drop everything buffered.
    Flush,
}

/// What the receive task answers a line request with.
#[derive(Debug)]
pub(crate) enum Response {
    /// The line, from just past the prefix if one was requested.
    Line(Line),

    /// The response ended.
    Stop(StopTag),
}

enum Pending {
    Line {
        prefix: Option<Vec<u8>>,
        ignore_stop_tag: bool,
        reply: oneshot::Sender<Response>,
    },
    Raw {
        len: usize,
        reply: oneshot::Sender<Bytes>,
    },
    Prompt {
        character: u8,
        reply: oneshot::Sender<()>,
    },
}

impl Pending {
    /// The requester stopped waiting (it timed out).
    fn is_abandoned(&self) -> bool {
        match self {
            Pending::Line { reply, .. } => reply.is_closed(),
            Pending::Raw { reply, .. } => reply.is_closed(),
            Pending::Prompt { reply, .. } => reply.is_closed(),
        }
    }
}

pub(crate) struct Receiver<R> {
    reader: R,
    buffer: BytesMut,
    codec: LinesCodec,
    ingress: mpsc::UnboundedReceiver<Ingress>,
    shared: Arc<Shared>,

    /// An exchange holds the client.
    in_exchange: bool,

    /// The command echo still to be dropped.
    echo: Option<Vec<u8>>,

    pending: Option<Pending>,
}

impl<R> Receiver<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub(crate) fn new(
        reader: R,
        ingress: mpsc::UnboundedReceiver<Ingress>,
        shared: Arc<Shared>,
        line_capacity: usize,
    ) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(line_capacity),
            codec: LinesCodec::default().with_max_length(line_capacity),
            ingress,
            shared,
            in_exchange: false,
            echo: None,
            pending: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Running");

        loop {
            self.process();

            tokio::select! {
                ingress = self.ingress.recv() => match ingress {
                    Some(ingress) => self.handle(ingress),
                    None => {
                        debug!("Client gone, exiting");
                        break;
                    }
                },

                read = self.reader.read_buf(&mut self.buffer) => match read {
                    Ok(0) => {
                        warn!("Stream closed, exiting");
                        break;
                    }
                    Ok(n) => trace!("Read {n} byte(s), {} buffered", self.buffer.len()),
                    Err(e) => {
                        warn!(?e, "Read error, exiting");
                        break;
                    }
                },
            }
        }
    }

    fn handle(&mut self, ingress: Ingress) {
        trace!(?ingress, "Ingress");

        match ingress {
            Ingress::Begin => {
                self.in_exchange = true;
                self.echo = None;
            }
            Ingress::Sent { echo } => self.echo = echo,
            Ingress::Line {
                prefix,
                ignore_stop_tag,
                reply,
            } => self.wait_for(Pending::Line {
                prefix,
                ignore_stop_tag,
                reply,
            }),
            Ingress::Raw { len, reply } => self.wait_for(Pending::Raw { len, reply }),
            Ingress::Prompt { character, reply } => {
                self.wait_for(Pending::Prompt { character, reply })
            }
            Ingress::End { flush } => {
                self.in_exchange = false;
                self.echo = None;
                self.pending = None;
                if flush {
                    self.flush();
                }
            }
            Ingress::Flush => self.flush(),
        }
    }

    fn wait_for(&mut self, pending: Pending) {
        if self.pending.replace(pending).is_some() {
            debug!("Replaced an earlier request");
        }
    }

    fn flush(&mut self) {
        if !self.buffer.is_empty() {
            debug!("Discarding {} buffered byte(s)", self.buffer.len());
        }
        self.buffer.clear();
        self.codec.reset();
    }

    /// Serve the pending request (or URCs, when idle) from what is buffered,
    /// for as long as that makes progress.
    fn process(&mut self) {
        loop {
            if self.pending.as_ref().is_some_and(Pending::is_abandoned) {
                debug!("Request abandoned");
                self.pending = None;
            }

            let progressed = match self.pending.take() {
                Some(Pending::Raw { len, reply }) => {
                    if self.buffer.len() >= len {
                        let bytes = self.buffer.split_to(len).freeze();
                        self.codec.reset();
                        let _ = reply.send(bytes);
                        true
                    } else {
                        self.pending = Some(Pending::Raw { len, reply });
                        false
                    }
                }

                Some(Pending::Prompt { character, reply }) => {
                    let prompt = self.buffer.iter().position(|byte| *byte == character);
                    let newline = self.buffer.iter().position(|byte| *byte == b'\n');

                    match prompt {
                        Some(prompt) if newline.map_or(true, |newline| prompt < newline) => {
                            self.buffer.advance(prompt + 1);
                            self.codec.reset();
                            let _ = reply.send(());
                            true
                        }
                        _ => {
                            self.pending = Some(Pending::Prompt { character, reply });

                            // Lines before the prompt.
                            let buffered = self.buffer.len();
                            match self.next_line() {
                                Some(line) => {
                                    if !self.swallow_echo(&line) {
                                        self.unsolicited(&line);
                                    }
                                    true
                                }
                                // Empty lines may have gone, uncovering the prompt.
                                None => self.buffer.len() != buffered,
                            }
                        }
                    }
                }

                Some(Pending::Line {
                    prefix,
                    ignore_stop_tag,
                    reply,
                }) => match self.next_line() {
                    Some(line) => {
                        match self.classify(line, prefix.as_deref(), ignore_stop_tag) {
                            Some(response) => {
                                let _ = reply.send(response);
                            }
                            None => {
                                self.pending = Some(Pending::Line {
                                    prefix,
                                    ignore_stop_tag,
                                    reply,
                                })
                            }
                        }
                        true
                    }
                    None => {
                        self.pending = Some(Pending::Line {
                            prefix,
                            ignore_stop_tag,
                            reply,
                        });
                        false
                    }
                },

                // Inside an exchange, unrequested bytes may be binary data
                // the exchange has yet to ask for, so they stay put.
                None if self.in_exchange => false,

                None => match self.next_line() {
                    Some(line) => {
                        self.unsolicited(&line);
                        true
                    }
                    None => false,
                },
            };

            if !progressed {
                break;
            }
        }
    }

    /// The next non-empty line in the buffer, if there is a full one.
    fn next_line(&mut self) -> Option<Line> {
        loop {
            let line = match self.codec.decode(&mut self.buffer) {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!(?e, "Could not split line");
                    return None;
                }
            };

            if line.trimmed().is_empty() {
                continue;
            }

            if self.shared.settings().print_at {
                info!("<- {}", String::from_utf8_lossy(line.trimmed()));
            } else {
                trace!("<- {}", String::from_utf8_lossy(line.trimmed()));
            }

            return Some(line);
        }
    }

    fn swallow_echo(&mut self, line: &Line) -> bool {
        if self.echo.as_deref() == Some(line.trimmed()) {
            trace!("Dropping echo");
            self.echo = None;
            true
        } else {
            false
        }
    }

    /// What a line means to the pending line request.
    /// `None` if the request is still waiting.
    fn classify(
        &mut self,
        line: Line,
        prefix: Option<&[u8]>,
        ignore_stop_tag: bool,
    ) -> Option<Response> {
        if self.swallow_echo(&line) {
            return None;
        }

        let text = line.trimmed();

        if !ignore_stop_tag {
            if let Some(tag) = StopTag::parse(text) {
                return Some(Response::Stop(tag));
            }
        }

        if let Some(prefix) = prefix {
            if text.starts_with(prefix) {
                return Some(Response::Line(after_prefix(&line, prefix.len())));
            }
        }

        if self.dispatch_urc(&line) {
            return None;
        }

        match prefix {
            None => Some(Response::Line(line)),
            Some(prefix) => {
                debug!(
                    "Skipping {:?} while waiting for {:?}",
                    String::from_utf8_lossy(text),
                    String::from_utf8_lossy(prefix)
                );
                None
            }
        }
    }

    fn unsolicited(&mut self, line: &Line) {
        if !self.dispatch_urc(line) {
            debug!(
                "Discarding unexpected line {:?}",
                String::from_utf8_lossy(line.trimmed())
            );
        }
    }

    /// Hand the line to the first matching URC handler, if any.
    fn dispatch_urc(&self, line: &Line) -> bool {
        // The registry lock is released before the handler runs,
        // handlers may (de)register URCs.
        let found = self.shared.urcs().matching(line.trimmed());

        let Some((prefix, handler)) = found else {
            return false;
        };

        let delimiter = self.shared.settings().delimiter;
        urc::run_handler(&handler, &prefix, line, delimiter);
        true
    }
}
