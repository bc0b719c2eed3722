//! Extended data mode.
//!
//! Once a short range module is in extended data mode, AT traffic and data
//! for connected peers share the wire as [`EdmPacket`]s.
//! [`EdmMux`] unpacks the AT part into a plain byte stream an
//! [`AtClient`](crate::at::AtClient) can run on, and hands everything else
//! out as events.

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    codecs::edm::{EdmCodec, EdmPacket, MAX_AT_BODY, MAX_DATA_BODY},
    error::Error,
    transport::Transport,
};

/// Size of the in-memory pipe between the multiplexer and the AT client.
const AT_PIPE_SIZE: usize = 4096;

/// Splits an extended data mode transport into an AT stream and data events.
#[derive(Debug)]
pub struct EdmMux {
    requests: mpsc::UnboundedSender<EdmPacket>,
    events: broadcast::Sender<EdmPacket>,
    task: JoinHandle<()>,
}

impl EdmMux {
    /// Take over `transport`.
    ///
    /// The returned stream carries the AT text inside the packets:
    /// whatever is written to it is sent as AT requests, and the bodies of
    /// AT confirmations and events can be read from it.
    pub fn new<T: Transport>(transport: T) -> (Self, DuplexStream) {
        let (at_client_side, at_mux_side) = tokio::io::duplex(AT_PIPE_SIZE);
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);

        let task = tokio::spawn(
            run(
                Framed::new(transport, EdmCodec),
                at_mux_side,
                requests_rx,
                events.clone(),
            )
            .instrument(info_span!("edm")),
        );

        (
            Self {
                requests,
                events,
                task,
            },
            at_client_side,
        )
    }

    /// Packets from the module which are not AT traffic:
    /// connects, disconnects, data and so on.
    pub fn events(&self) -> broadcast::Receiver<EdmPacket> {
        self.events.subscribe()
    }

    /// Like [`EdmMux::events`], as a stream.
    /// Events missed by a slow reader show up as errors.
    pub fn event_stream(&self) -> BroadcastStream<EdmPacket> {
        self.events().into()
    }

    /// Send data to a connected peer.
    ///
    /// At most [`MAX_DATA_BODY`] bytes fit in one packet, more fails with
    /// [`Error::InvalidParameter`].
    pub fn send_data(&self, channel: u8, data: impl Into<Bytes>) -> Result<(), Error> {
        let data = data.into();

        if data.len() > MAX_DATA_BODY {
            return Err(Error::InvalidParameter(format!(
                "{} byte(s) of data do not fit in an EDM packet, the limit is {MAX_DATA_BODY}",
                data.len()
            )));
        }

        self.send(EdmPacket::DataCommand { channel, data })
    }

    /// Ask the module to repeat connect events for the channels it has open.
    pub fn resend_connect_events(&self) -> Result<(), Error> {
        self.send(EdmPacket::ResendConnectEvents)
    }

    fn send(&self, packet: EdmPacket) -> Result<(), Error> {
        self.requests.send(packet).map_err(|_| Error::Closed)
    }
}

impl Drop for EdmMux {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<T: Transport>(
    framed: Framed<T, EdmCodec>,
    at: DuplexStream,
    mut requests: mpsc::UnboundedReceiver<EdmPacket>,
    events: broadcast::Sender<EdmPacket>,
) {
    let (mut sink, mut stream) = framed.split();
    let (mut at_read, mut at_write) = tokio::io::split(at);
    let mut at_buffer = BytesMut::with_capacity(AT_PIPE_SIZE);

    info!("Running");

    loop {
        tokio::select! {
            packet = stream.next() => {
                let packet = match packet {
                    Some(Ok(packet)) => packet,
                    Some(Err(e)) => {
                        error!(?e, "Transport error, exiting");
                        break;
                    }
                    None => {
                        warn!("Transport closed, exiting");
                        break;
                    }
                };

                match packet {
                    EdmPacket::AtConfirmation(text) | EdmPacket::AtEvent(text) => {
                        trace!("AT text: {:?}", String::from_utf8_lossy(&text));
                        if let Err(e) = at_write.write_all(&text).await {
                            debug!(?e, "AT stream gone, exiting");
                            break;
                        }
                    }
                    other => {
                        debug!(?other, "Event");
                        // Nobody listening is fine.
                        let _ = events.send(other);
                    }
                }
            }

            read = at_read.read_buf(&mut at_buffer) => {
                match read {
                    Ok(0) => {
                        debug!("AT stream closed, exiting");
                        break;
                    }
                    Ok(_) => {
                        let mut sent = Ok(());
                        while !at_buffer.is_empty() && sent.is_ok() {
                            let len = at_buffer.len().min(MAX_AT_BODY);
                            let text = at_buffer.split_to(len).freeze();
                            sent = send(&mut sink, EdmPacket::AtRequest(text)).await;
                        }
                        if sent.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(?e, "AT stream error, exiting");
                        break;
                    }
                }
            }

            Some(packet) = requests.recv() => {
                if send(&mut sink, packet).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Send a packet.
///
/// A packet which can not be encoded is dropped, only transport problems
/// are errors.
async fn send<S>(sink: &mut S, packet: EdmPacket) -> Result<(), Error>
where
    S: Sink<EdmPacket, Error = Error> + Unpin,
{
    match sink.send(packet).await {
        Ok(()) => Ok(()),
        Err(Error::InvalidParameter(e)) => {
            warn!(%e, "Dropping packet which can not be encoded");
            Ok(())
        }
        Err(e) => {
            error!(?e, "Could not send packet, exiting");
            Err(e)
        }
    }
}
