#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use color_eyre::Result;
use tokio::{sync::broadcast, time::timeout};
use tracing::Level;
use ubxlib::{
    at::{AtClient, AtOptions},
    logging,
    mock::{MockModule, MockModuleBuilder},
    queue::QueueContext,
    transport::WireEvent,
};

/// Options suited for talking to a mock: no pacing, short timeouts.
pub fn options() -> AtOptions {
    AtOptions {
        timeout_ms: 1000,
        command_delay_ms: 0,
        ..Default::default()
    }
}

pub struct Setup {
    pub client: AtClient,
    pub mock: MockModule,
    pub ctx: QueueContext,
}

pub async fn setup(builder: MockModuleBuilder) -> Result<Setup> {
    setup_with(builder, options()).await
}

pub async fn setup_with(builder: MockModuleBuilder, options: AtOptions) -> Result<Setup> {
    logging::init(Level::INFO, None).await;

    let (mock, host) = builder.build();
    let ctx = QueueContext::new();
    let client = AtClient::add(&ctx, host, options)?;

    Ok(Setup { client, mock, ctx })
}

pub async fn next_event(events: &mut broadcast::Receiver<WireEvent>) -> Result<WireEvent> {
    Ok(timeout(Duration::from_secs(5), events.recv()).await??)
}

/// The next command the mock received, skipping what it wrote.
pub async fn next_command(events: &mut broadcast::Receiver<WireEvent>) -> Result<Bytes> {
    loop {
        if let WireEvent::ToWire(command) = next_event(events).await? {
            return Ok(command);
        }
    }
}
