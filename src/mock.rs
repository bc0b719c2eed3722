//! A mock module, useful to test AT functionality without an actual module.
//!
//! The mock reads commands off its end of an in-memory pipe, optionally
//! echoes them, and answers with whatever reply was scripted for the command.
//! Unsolicited text can be injected at any time.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures::{channel::mpsc, StreamExt};
use tokio::{
    io::{AsyncWriteExt, DuplexStream, WriteHalf},
    sync::broadcast,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    codecs::lines::{trim, LinesCodec},
    transport::WireEvent,
};

type Replies = Arc<Mutex<HashMap<Vec<u8>, Vec<Bytes>>>>;

/// Builder for a [`MockModule`].
#[derive(Debug)]
pub struct MockModuleBuilder {
    name: String,
    echo: bool,
    replies: HashMap<Vec<u8>, Vec<Bytes>>,
    reply_delay: Duration,
    part_gap: Duration,
    pipe_size: usize,
}

impl MockModuleBuilder {
    /// Start a new builder.
    /// The name is only used in logs.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            echo: false,
            replies: HashMap::new(),
            reply_delay: Duration::ZERO,
            part_gap: Duration::from_millis(10),
            pipe_size: 4096,
        }
    }

    /// Echo each command back before replying, like a module with `ATE1`.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Reply to `command` with `reply`.
    pub fn reply<R: Into<Bytes>>(self, command: &str, reply: R) -> Self {
        self.reply_in_parts(command, [reply])
    }

    /// Reply to `command` with several writes, [`Self::part_gap`] apart.
    pub fn reply_in_parts<I, R>(mut self, command: &str, parts: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Bytes>,
    {
        self.replies.insert(
            command.as_bytes().to_vec(),
            parts.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Wait this long after a command before replying.
    pub fn reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Time between the parts of a reply.
    pub fn part_gap(mut self, gap: Duration) -> Self {
        self.part_gap = gap;
        self
    }

    /// Start the mock.
    ///
    /// Returns the handle for scripting and observing it,
    /// and the host side of the pipe to add an AT client on.
    #[must_use]
    pub fn build(self) -> (MockModule, DuplexStream) {
        info!(%self.name, "Running mock module");

        let (host_side, module_side) = tokio::io::duplex(self.pipe_size);

        // Listen to this internally.
        // If anything appears, put it on the wire.
        let (inject_sender, mut inject_receiver) = mpsc::unbounded::<Bytes>();

        // Outsiders will be observing the wire from this broadcast.
        let (events, _) = broadcast::channel(1024);

        let replies: Replies = Arc::new(Mutex::new(self.replies));

        let (read, write) = tokio::io::split(module_side);
        let mut wire = Wire {
            write,
            events: events.clone(),
        };
        let mut commands = FramedRead::new(read, LinesCodec::new(b'\r', None));

        let task_replies = replies.clone();
        let echo = self.echo;
        let reply_delay = self.reply_delay;
        let part_gap = self.part_gap;

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        command = commands.next() => {
                            let command = match command {
                                Some(Ok(line)) => Bytes::copy_from_slice(trim(&line.bytes)),
                                Some(Err(e)) => {
                                    warn!(?e, "Read error");
                                    break;
                                }
                                None => break,
                            };

                            if command.is_empty() {
                                continue;
                            }

                            let _ = wire.events.send(WireEvent::ToWire(command.clone()));

                            if echo {
                                let mut echoed = command.to_vec();
                                echoed.extend_from_slice(b"\r\n");
                                if wire.put(echoed.into()).await.is_err() {
                                    break;
                                }
                            }

                            let reply = task_replies
                                .lock()
                                .map(|replies| replies.get(&command[..]).cloned())
                                .unwrap_or_default();

                            let Some(parts) = reply else {
                                debug!("No reply for {:?}", String::from_utf8_lossy(&command));
                                continue;
                            };

                            tokio::time::sleep(reply_delay).await;

                            for (index, part) in parts.into_iter().enumerate() {
                                if index > 0 {
                                    tokio::time::sleep(part_gap).await;
                                }
                                if wire.put(part).await.is_err() {
                                    return;
                                }
                            }
                        }

                        Some(bytes) = inject_receiver.next() => {
                            if wire.put(bytes).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                warn!("Mock module stopped");
            }
            .instrument(info_span!("mock", name = %self.name)),
        );

        (
            MockModule {
                inject_sender,
                events,
                replies,
            },
            host_side,
        )
    }
}

struct Wire {
    write: WriteHalf<DuplexStream>,
    events: broadcast::Sender<WireEvent>,
}

impl Wire {
    async fn put(&mut self, bytes: Bytes) -> std::io::Result<()> {
        trace!("Putting {} byte(s) on wire", bytes.len());

        if let Err(e) = self.write.write_all(&bytes).await {
            debug!(?e, "Host side gone");
            return Err(e);
        }

        let _ = self.events.send(WireEvent::FromWire(bytes));
        Ok(())
    }
}

/// A running mock module.
#[derive(Debug)]
pub struct MockModule {
    inject_sender: mpsc::UnboundedSender<Bytes>,
    events: broadcast::Sender<WireEvent>,
    replies: Replies,
}

impl MockModule {
    /// Put bytes on the wire unprompted, for example a URC.
    pub fn inject(&self, bytes: impl Into<Bytes>) {
        if self.inject_sender.unbounded_send(bytes.into()).is_err() {
            warn!("Mock module is gone, nothing injected");
        }
    }

    /// Change or add the reply to a command while the mock runs.
    pub fn set_reply(&self, command: &str, reply: impl Into<Bytes>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert(command.as_bytes().to_vec(), vec![reply.into()]);
        }
    }

    /// Observe traffic.
    ///
    /// Commands show up as [`WireEvent::ToWire`] without their terminator,
    /// everything the mock writes shows up as [`WireEvent::FromWire`].
    pub fn events(&self) -> broadcast::Receiver<WireEvent> {
        self.events.subscribe()
    }
}
