use pedalers::{BikeConfig, BikeEvent, ConnectionState, DomyosBike, Result};
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("📊 Pedalers Telemetry Monitor");
    let config = BikeConfig::from_file_or_default("pedalers.toml");
    let (bike, handle) = DomyosBike::discover(config).await?;
    let mut events = handle.subscribe();
    let session = tokio::spawn(bike.run());

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BikeEvent::Connected { name, dialect } => {
                    info!("✅ Connected to {} ({})", name, dialect);
                }
                BikeEvent::Started => info!("▶️  Session started"),
                BikeEvent::Stopped => info!("⏹️  Session stopped"),
                BikeEvent::Disconnected => error!("❌ Link lost, reconnecting..."),
                _ => {}
            }
        }
    });

    info!("Press Ctrl+C to stop monitoring");
    let mut report = interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = report.tick() => {
                if *handle.connection_state().borrow() != ConnectionState::Running {
                    continue;
                }
                let sample = handle.latest();
                let secs = sample.elapsed.as_secs();
                println!(
                    "{:02}:{:02} | {:5.1} km/h | {:3.0} rpm | lvl {:2} ({:3}%) | {:4} W | {:3} bpm | {:6.2} km | {:5.0} kcal",
                    secs / 60,
                    secs % 60,
                    sample.speed_kmh,
                    sample.cadence_rpm,
                    sample.resistance,
                    sample.resistance_percent,
                    sample.power_watts,
                    sample.heart_rate_bpm,
                    sample.distance_km,
                    sample.calories_kcal,
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Stopping monitor");
    handle.shutdown()?;
    if let Ok(result) = session.await {
        result?;
    }
    Ok(())
}
