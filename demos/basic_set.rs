use std::sync::Arc;
use tracing::{error, info, warn};
use cablelift::{
    mocks::InMemoryRepository, Result, TrainerConfig, TrainerDevice, WorkoutMode,
    WorkoutParameters, WorkoutState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏋️ Cablelift Basic Set Example");

    // Optional TOML config as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => TrainerConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => TrainerConfig::default(),
    };

    info!("Searching for trainers...");
    let repository = Arc::new(InMemoryRepository::new());
    let trainer = match TrainerDevice::connect_first_with_config(repository.clone(), config).await {
        Ok(device) => {
            info!("✅ Connected to: {}", device.device_info().name);
            device
        }
        Err(e) => {
            error!("❌ Failed to connect to trainer: {}", e);
            return Err(e);
        }
    };

    let params = WorkoutParameters {
        mode: WorkoutMode::OldSchool,
        target_reps: 8,
        warmup_reps: 2,
        weight_per_cable_kg: 10.0,
        ..Default::default()
    };

    info!("⏱️  Starting set: {} reps of {} kg per cable", params.target_reps, params.weight_per_cable_kg);
    trainer.session().start_workout(params, false).await?;
    info!("💪 Go!");

    let coordinator = trainer.coordinator();
    let mut state = coordinator.workout_state.subscribe();
    let mut reps = coordinator.rep_count.subscribe();

    loop {
        tokio::select! {
            changed = reps.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = *reps.borrow_and_update();
                if count.is_warmup_complete {
                    info!("Rep {}/{}", count.working_reps, params.target_reps);
                } else {
                    info!("Warmup rep {}/{}", count.warmup_reps, params.warmup_reps);
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                if matches!(*state.borrow_and_update(), WorkoutState::SetSummary { .. } | WorkoutState::Idle) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("🛑 Interrupted, stopping set");
                trainer.session().stop(false).await?;
                break;
            }
        }
    }

    if coordinator.connection_lost_during_workout.get() {
        warn!("⚠️  Connection was lost during the set");
    }

    if let Some(set) = repository.completed_sets().await.last() {
        println!("\n📋 Set Summary");
        println!("  Stopped by:    {}", set.stop_reason);
        println!("  Working reps:  {}", set.rep_count.working_reps);
        println!("  Warmup reps:   {}", set.rep_count.warmup_reps);
        println!("  Volume:        {:.1} kg", set.metrics.total_volume_kg);
        println!("  Peak force:    {:.1} kg", set.metrics.peak_force_kg);
        println!("  Peak power:    {:.0} W", set.peak_power_w);
        println!("  Duration:      {:.1} s", set.metrics.duration_ms as f64 / 1000.0);
        for rep in &set.reps {
            println!(
                "    #{:<2} {} rom {:5.0} mm  up {:4} ms  down {:4} ms",
                rep.rep_number,
                if rep.is_warmup { "warmup " } else { "working" },
                rep.range_of_motion_mm,
                rep.concentric_ms,
                rep.eccentric_ms
            );
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
