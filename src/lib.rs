#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Cablelift
//!
//! A Rust library for running workouts on dual-cable motorized strength
//! trainers over Bluetooth Low Energy.
//!
//! The trainer streams position, velocity and load for both cables at
//! 10–20 Hz. This crate decodes that stream, classifies every sample into a
//! lift phase, counts reps, decides when a set should end on its own, and
//! sequences the commands that configure, start, pause and stop the motors.
//!
//! ## Architecture
//!
//! - **Protocol**: fixed-layout command frames (init, regular mode, echo
//!   mode, activation, start, stop) and telemetry decoding
//! - **Rep detector**: phase classification with an observed, self-calibrating
//!   range of motion
//! - **Auto-stop**: target-reached and stall detection
//! - **Session**: the workout state machine, run as a single task fed by
//!   bounded channels
//! - **Coordinator**: observable slots holding the shared session state
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library drives motors that apply load to a person.
//! Always ensure:
//! - Stopping a set is reachable from your UI at all times
//! - Connection-lost alerts are surfaced to the user
//! - Weights are chosen conservatively while testing
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cablelift::{mocks::InMemoryRepository, TrainerDevice, WorkoutMode, WorkoutParameters};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Discover and connect to the nearest trainer
//!     let trainer = TrainerDevice::connect_first(Arc::new(InMemoryRepository::new())).await?;
//!
//!     // Ten reps of 15 kg per cable, counting down first
//!     let params = WorkoutParameters {
//!         mode: WorkoutMode::OldSchool,
//!         target_reps: 10,
//!         weight_per_cable_kg: 15.0,
//!         ..Default::default()
//!     };
//!     trainer.session().start_workout(params, false).await?;
//!
//!     // The set ends on its own when the target is reached; stop early if needed
//!     trainer.session().stop(false).await?;
//!
//!     Ok(())
//! }
//! ```

/// Automatic set termination
pub mod auto_stop;
/// Bluetooth Low Energy communication module
pub mod ble;
/// Configuration for detectors, session and connection
pub mod config;
/// Shared observable session state
pub mod coordinator;
/// Connected trainer interface
pub mod device;
/// Error types and handling
pub mod error;
/// In-memory transport and repository
pub mod mocks;
/// Command and telemetry frame codec
pub mod protocol;
/// Lift phase classification and rep counting
pub mod rep_detector;
/// Workout state machine and its runner
pub mod session;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use auto_stop::{AutoStopDetector, AutoStopReason};
pub use config::{AutoStopConfig, ConnectionParams, RepDetectorConfig, SessionConfig, TrainerConfig};
pub use coordinator::{SessionCoordinator, Slot};
pub use device::TrainerDevice;
pub use error::{Result, TrainerError};
pub use protocol::{OutgoingCommand, RawFrame};
pub use rep_detector::RepPhaseDetector;
pub use session::{
    spawn_session, CommandTransport, SessionHandle, StartProgress, StopOutcome,
    WorkoutRepository, WorkoutSession,
};
pub use types::{
    CompletedSet, ConnectionState, DeviceInfo, EchoLevel, RepCount, RepPhase, RepSummary,
    StopReason, TelemetrySample, WorkoutMode, WorkoutParameters, WorkoutState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Trainer BLE service UUID (Nordic UART Service)
pub const TRAINER_SERVICE_UUID: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";

/// RX characteristic UUID for app-to-device commands
///
/// Every outgoing command frame is written here without response.
pub const TRAINER_RX_CHAR_UUID: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";

/// TX characteristic UUID carrying telemetry sample notifications
pub const TRAINER_TX_CHAR_UUID: &str = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E";

/// Characteristic UUID carrying machine rep notifications
pub const TRAINER_REP_CHAR_UUID: &str = "6E400004-B5A3-F393-E0A9-E50E24DCCA9E";

/// Advertised name prefixes that identify supported trainers
pub const TRAINER_NAME_PREFIXES: [&str; 2] = ["Vee_", "VIT"];
