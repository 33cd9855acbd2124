use std::{sync::Arc, time::Duration};
use tokio::time::interval;
use tracing::{error, info, warn};
use cablelift::{mocks::InMemoryRepository, Result, TrainerDevice};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Cablelift Telemetry Monitor Example");
    info!("Searching for trainers...");

    let trainer = match TrainerDevice::connect_first(Arc::new(InMemoryRepository::new())).await {
        Ok(device) => {
            info!("✅ Connected to: {}", device.device_info().name);
            device
        }
        Err(e) => {
            error!("❌ Failed to connect to trainer: {}", e);
            return Err(e);
        }
    };

    info!("🔍 Streaming telemetry, press Ctrl+C to stop");

    let coordinator = trainer.coordinator().clone();
    let mut ticker = interval(Duration::from_millis(250));
    let mut peak_load: f32 = 0.0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let Some(sample) = coordinator.latest_sample.get() else {
            continue;
        };
        peak_load = peak_load.max(sample.total_load_kg());

        let a = sample.cable_a();
        let b = sample.cable_b();
        println!(
            "t={:>8} ms │ A {:6.1} mm {:7.1} mm/s {:5.1} kg │ B {:6.1} mm {:7.1} mm/s {:5.1} kg │ {:<10} │ peak {:5.1} kg",
            sample.timestamp_ms(),
            a.position_mm,
            a.velocity_mm_s,
            a.load_kg,
            b.position_mm,
            b.velocity_mm_s,
            b.load_kg,
            coordinator.rep_phase.get(),
            peak_load
        );

        if let Some(reps) = coordinator.machine_reps.get() {
            println!(
                "  machine reps: {} up / {} down, range {:.0}-{:.0} mm",
                reps.up_counter, reps.down_counter, reps.range_bottom_mm, reps.range_top_mm
            );
        }

        if !trainer.is_connected().await {
            warn!("❌ Trainer disconnected");
            break;
        }
    }

    info!("🔌 Disconnecting...");
    if let Err(e) = trainer.disconnect().await {
        error!("❌ Failed to disconnect: {}", e);
    } else {
        info!("✅ Disconnected successfully");
    }

    Ok(())
}
