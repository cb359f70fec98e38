use pedalers::{BikeConfig, BikeEvent, DomyosBike, Result};
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

/// Target power and how long to hold it
const INTERVALS: [(u16, u64); 4] = [(120, 120), (200, 60), (140, 90), (220, 60)];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("🚴 Pedalers ERG Ride");
    let config = BikeConfig {
        start_on_connect: true,
        erg_filter_upper: 5.0,
        erg_filter_lower: 5.0,
        ..BikeConfig::from_file_or_default("pedalers.toml")
    };
    let (bike, handle) = DomyosBike::discover(config).await?;
    let mut events = handle.subscribe();
    let session = tokio::spawn(bike.run());

    info!("Waiting for the bike...");
    while let Ok(event) = events.recv().await {
        if event == BikeEvent::Running {
            break;
        }
    }

    for (watts, secs) in INTERVALS {
        info!("⚡ Holding {} W for {} s", watts, secs);
        let steps = secs / 5;
        for _ in 0..steps {
            // the controller only reacts once a cadence is known
            handle.set_target_power(watts)?;
            sleep(Duration::from_secs(5)).await;
            let sample = handle.latest();
            info!(
                "{:4} W at {:3.0} rpm, level {}",
                sample.power_watts, sample.cadence_rpm, sample.resistance
            );
        }
        handle.lap()?;
    }

    info!("🏁 Done");
    handle.stop()?;
    sleep(Duration::from_secs(1)).await;
    handle.shutdown()?;
    if let Ok(result) = session.await {
        result?;
    }
    Ok(())
}
