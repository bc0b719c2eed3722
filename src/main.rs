use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use ubxlib::{
    at::AtClient, cli, config::Config, logging, queue::QueueContext,
    transport::edm::EdmMux, transport::serial::SerialTransportBuilder,
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command)?;

        return Ok(());
    }

    let config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)?
    } else {
        Config::default()
    };

    let (stdout_level, file_logging) = config.logging.levels()?;
    logging::init(stdout_level, file_logging).await;

    if let Some(config_path) = &cli.config {
        debug!(?config_path, "Config from path");
    } else {
        debug!("Default config");
    }

    let serial = config
        .serial
        .clone()
        .ok_or_else(|| eyre!("No serial port configured, see `ubxlib examples config`"))?;

    let port = SerialTransportBuilder::from_config(&serial)
        .open_with_retries(serial.open_attempts, Duration::from_secs(3))
        .await?;

    let ctx = QueueContext::new();

    let (client, mux) = if config.edm {
        let (mux, at) = EdmMux::new(port);
        (AtClient::add(&ctx, at, config.at.clone())?, Some(mux))
    } else {
        (AtClient::add(&ctx, port, config.at.clone())?, None)
    };

    for command in &cli.commands {
        match client.command_lines(command).await {
            Ok(lines) => {
                for line in lines {
                    println!("{line}");
                }
                println!("OK");
            }
            Err(e) => {
                error!(%command, %e, "Command failed");
                println!("{e}");
            }
        }
    }

    if cli.monitor {
        // Registered only now, or response lines with the same prefix
        // would be taken for URCs.
        for prefix in &cli.urcs {
            client.set_urc_handler(prefix, |urc| {
                println!("{}{}", urc.prefix(), urc.remaining_lossy());
            })?;
        }

        info!("Monitoring, Ctrl-C to quit");

        let mut events = match &mux {
            Some(mux) => mux.event_stream().boxed(),
            None => futures::stream::pending().boxed(),
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C, quitting");
                    break;
                }
                Some(event) = events.next() => match event {
                    Ok(event) => println!("{event:?}"),
                    Err(e) => warn!(?e, "Missed EDM events"),
                }
            }
        }
    }

    client.remove().await?;
    ctx.deinit();

    Ok(())
}
