use std::time::Duration;

use bytes::{Bytes, BytesMut};
use color_eyre::Result;
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::codec::Framed;
use tracing::Level;
use ubxlib::{
    at::AtClient,
    codecs::edm::{EdmCodec, EdmPacket},
    error::Error,
    logging,
    queue::QueueContext,
    transport::edm::EdmMux,
};

mod common;

#[tokio::test]
async fn at_client_over_edm() -> Result<()> {
    logging::init(Level::INFO, None).await;

    let (module, host) = tokio::io::duplex(4096);
    let (mux, at) = EdmMux::new(host);
    let mut events = mux.events();

    let ctx = QueueContext::new();
    let client = AtClient::add(&ctx, at, common::options())?;

    let (tx, mut urcs) = mpsc::unbounded_channel();
    client.set_urc_handler("+UUBTACLC:", move |urc| {
        let _ = tx.send(urc.read_int().unwrap());
    })?;

    let module = tokio::spawn(async move {
        let mut module = Framed::new(module, EdmCodec);
        let mut command = BytesMut::new();

        while let Some(packet) = module.next().await {
            let EdmPacket::AtRequest(text) = packet? else {
                continue;
            };

            // A command may come in pieces.
            command.extend_from_slice(&text);
            if !command.ends_with(b"\r") {
                continue;
            }
            assert_eq!(&command[..], b"AT+UBTLN?\r");

            module
                .send(EdmPacket::AtConfirmation(Bytes::from_static(
                    b"\r\n+UBTLN:\"ubxlib\"\r\nOK\r\n",
                )))
                .await?;
            module
                .send(EdmPacket::AtEvent(Bytes::from_static(
                    b"\r\n+UUBTACLC:1,0,D4CA6EFFFFFF\r\n",
                )))
                .await?;
            module
                .send(EdmPacket::DataEvent {
                    channel: 1,
                    data: Bytes::from_static(b"hi"),
                })
                .await?;

            // Hand the module back, dropping it would end the session.
            return Ok::<_, Error>(module);
        }

        Err(Error::Closed)
    });

    let mut exchange = client.lock().await?;
    exchange.command_start("AT+UBTLN?")?;
    exchange.command_stop().await?;
    assert!(exchange.response_start(Some("+UBTLN:")).await?);
    assert_eq!(exchange.read_string()?, "ubxlib");
    exchange.response_stop().await?;
    exchange.unlock()?;

    let _module = module.await??;

    assert_eq!(timeout(Duration::from_secs(5), urcs.recv()).await?, Some(1));
    assert_eq!(
        timeout(Duration::from_secs(5), events.recv()).await??,
        EdmPacket::DataEvent {
            channel: 1,
            data: Bytes::from_static(b"hi")
        }
    );

    Ok(())
}
