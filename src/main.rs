use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::time::{self, Duration};
use tracing::{error, info};

use ecoflow_smartmeter::{
    Config, EcoflowFeed, MeterEncoder, RegisterTable, auth, feed, server,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    config.validate()?;

    let table = Arc::new(RegisterTable::new(&config.identity(), config.device_offset)?);
    let encoder = Arc::new(MeterEncoder::new(
        table.clone(),
        config.encoder_settings(),
        config.initial_energy(),
    ));

    let listener = TcpListener::bind((config.listen, config.port)).await?;
    info!("Serving smart meter registers on {}", listener.local_addr()?);
    let mut server_handle = tokio::spawn(server::serve(listener, table.clone()));

    let certificate = auth::fetch_certificate(&config.api_credentials()?).await?;
    let (samples_tx, samples_rx) = feed::sample_channel();
    let ecoflow = EcoflowFeed::connect(&certificate, &config.serial_number()?, samples_tx).await?;
    let mut forward_handle = tokio::spawn(feed::forward_samples(samples_rx, encoder.clone()));

    if let Some(secs) = config.heartbeat_secs.filter(|secs| *secs > 0) {
        let encoder = encoder.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(secs));
            loop {
                interval.tick().await;
                encoder.refresh(Instant::now());
            }
        });
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Shutdown signal received");
        }
        result = &mut server_handle => {
            match result {
                Ok(Err(e)) => error!("Modbus server stopped: {:?}", e),
                Err(e) => error!("Modbus server task failed: {}", e),
                Ok(Ok(())) => info!("Modbus server stopped"),
            }
        }
        _ = &mut forward_handle => {
            error!("Telemetry feed closed");
        }
    }

    ecoflow.shutdown().await;
    server_handle.abort();
    forward_handle.abort();
    info!("Shutdown complete");
    Ok(())
}
