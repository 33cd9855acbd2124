use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainerError};

/// Tunables for rep phase classification
///
/// Range-of-motion calibration is observed, never configured; these values
/// only bound how observations are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepDetectorConfig {
    /// Samples averaged to smooth velocity
    pub window_size: usize,
    /// Velocity magnitude that counts as deliberate movement, in mm/s
    pub min_velocity_mm_s: f32,
    /// Velocity magnitude below which the handles are considered still, in mm/s
    pub rest_velocity_mm_s: f32,
    /// Time the handles must stay still near the bottom before entering Rest
    pub rest_debounce_ms: u64,
    /// Top/bottom tolerance as a fraction of the observed range of motion
    pub position_tolerance: f32,
    /// Smallest travel accepted as a rep, in millimetres
    pub min_rom_mm: f32,
    /// Reps used to calibrate the range of motion before it is frozen
    pub calibration_reps: u32,
}

impl Default for RepDetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 3,
            min_velocity_mm_s: 50.0,
            rest_velocity_mm_s: 20.0,
            rest_debounce_ms: 400,
            position_tolerance: 0.15,
            min_rom_mm: 100.0,
            calibration_reps: 2,
        }
    }
}

/// Tunables for automatic set termination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoStopConfig {
    /// Continuous rest that ends a set, in milliseconds
    pub stall_timeout_ms: u64,
    /// Require at least one detected rep before a stall can end the set
    pub require_movement_before_stall: bool,
}

impl Default for AutoStopConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 5_000,
            require_movement_before_stall: true,
        }
    }
}

/// Session timing and channel sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Countdown length before a set, in seconds
    pub countdown_seconds: u8,
    /// Default rest between sets, in seconds
    pub default_rest_seconds: u32,
    /// Capacity of the telemetry channel; frames beyond it are dropped
    pub telemetry_channel_capacity: usize,
    /// Capacity of the control channel
    pub command_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            countdown_seconds: 5,
            default_rest_seconds: 60,
            telemetry_channel_capacity: 64,
            command_channel_capacity: 16,
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
    /// Scan timeout in milliseconds
    pub scan_timeout_ms: u64,
    /// Command write timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Interval between link checks in milliseconds
    pub monitor_interval_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
            command_timeout_ms: 3_000,
            monitor_interval_ms: 500,
        }
    }
}

/// Complete configuration for a trainer session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainerConfig {
    /// Rep detection
    pub detector: RepDetectorConfig,
    /// Auto-stop policy
    pub auto_stop: AutoStopConfig,
    /// Session timers and channels
    pub session: SessionConfig,
    /// BLE connection
    pub connection: ConnectionParams,
}

impl TrainerConfig {
    /// Parse and validate a TOML document; missing keys take their defaults
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidConfig`] if the document does not parse
    /// or fails validation.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that values are usable together
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if d.window_size == 0 {
            return Err(invalid("detector.window_size must be at least 1"));
        }
        if !(d.rest_velocity_mm_s > 0.0 && d.rest_velocity_mm_s < d.min_velocity_mm_s) {
            return Err(invalid(
                "detector.rest_velocity_mm_s must be positive and below min_velocity_mm_s",
            ));
        }
        if !(d.position_tolerance > 0.0 && d.position_tolerance < 0.5) {
            return Err(invalid("detector.position_tolerance must be in (0, 0.5)"));
        }
        if d.min_rom_mm <= 0.0 {
            return Err(invalid("detector.min_rom_mm must be positive"));
        }
        if d.calibration_reps == 0 {
            return Err(invalid("detector.calibration_reps must be at least 1"));
        }
        if self.auto_stop.stall_timeout_ms == 0 {
            return Err(invalid("auto_stop.stall_timeout_ms must be positive"));
        }
        if self.session.telemetry_channel_capacity == 0 || self.session.command_channel_capacity == 0
        {
            return Err(invalid("session channel capacities must be positive"));
        }
        if self.connection.monitor_interval_ms == 0 {
            return Err(invalid("connection.monitor_interval_ms must be positive"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> TrainerError {
    TrainerError::InvalidConfig(reason.to_string())
}
