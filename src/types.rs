use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};
use uuid::Uuid;

/// Maximum weight per cable accepted by the device, in kilograms
pub const MAX_WEIGHT_PER_CABLE_KG: f32 = 100.0;
/// Minimum weight per cable accepted by the device, in kilograms
pub const MIN_WEIGHT_PER_CABLE_KG: f32 = 0.0;
/// Smallest fixed rep target
pub const MIN_TARGET_REPS: u8 = 1;
/// Largest fixed rep target
pub const MAX_TARGET_REPS: u8 = 100;
/// Largest warmup rep count
pub const MAX_WARMUP_REPS: u8 = 20;
/// Largest per-rep progression/regression magnitude, in kilograms
pub const MAX_PROGRESSION_KG: f32 = 3.0;
/// Largest eccentric load percentage for echo mode
pub const MAX_ECCENTRIC_LOAD_PCT: u16 = 150;

/// Echo mode difficulty level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EchoLevel {
    /// Load follows the user closely
    #[default]
    Hard = 0,
    /// Slightly more resistance than the user's output
    Harder = 1,
    /// Noticeably more resistance than the user's output
    Hardest = 2,
    /// Maximum load matching
    Epic = 3,
}

impl From<u8> for EchoLevel {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Harder,
            2 => Self::Hardest,
            3 => Self::Epic,
            _ => Self::Hard,
        }
    }
}

impl fmt::Display for EchoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hard => write!(f, "Hard"),
            Self::Harder => write!(f, "Harder"),
            Self::Hardest => write!(f, "Hardest"),
            Self::Epic => write!(f, "Epic"),
        }
    }
}

/// Program mode run by the motors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkoutMode {
    /// Constant load in both directions
    #[default]
    OldSchool,
    /// Load drops off through the concentric for speed work
    Pump,
    /// Time under tension
    Tut,
    /// Time under tension with heavier eccentric
    TutBeast,
    /// Load applied only while lowering
    EccentricOnly,
    /// Load matched to the user's effort
    Echo {
        /// Load-matching difficulty
        level: EchoLevel,
        /// Eccentric load as a percentage of concentric
        eccentric_load_pct: u16,
    },
}

impl WorkoutMode {
    /// Device mode code transmitted in configuration frames
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::OldSchool => 0,
            Self::Pump => 2,
            Self::Tut => 3,
            Self::TutBeast => 4,
            Self::EccentricOnly => 6,
            Self::Echo { .. } => 10,
        }
    }

    /// Resolve a device mode code; echo settings default and are filled in by the caller
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::OldSchool),
            2 => Some(Self::Pump),
            3 => Some(Self::Tut),
            4 => Some(Self::TutBeast),
            6 => Some(Self::EccentricOnly),
            10 => Some(Self::Echo {
                level: EchoLevel::Hard,
                eccentric_load_pct: 100,
            }),
            _ => None,
        }
    }

    /// Whether this is the load-matching echo mode
    #[must_use]
    pub const fn is_echo(&self) -> bool {
        matches!(self, Self::Echo { .. })
    }
}

impl fmt::Display for WorkoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OldSchool => write!(f, "Old School"),
            Self::Pump => write!(f, "Pump"),
            Self::Tut => write!(f, "TUT"),
            Self::TutBeast => write!(f, "TUT Beast"),
            Self::EccentricOnly => write!(f, "Eccentric Only"),
            Self::Echo {
                level,
                eccentric_load_pct,
            } => write!(f, "Echo ({level}, {eccentric_load_pct}% eccentric)"),
        }
    }
}

/// Configuration for the next or current set
///
/// Always replaced as a whole value; never mutated field by field while shared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkoutParameters {
    /// Program mode
    pub mode: WorkoutMode,
    /// Working reps that end the set (ignored for AMRAP and Just Lift)
    pub target_reps: u8,
    /// Resistance per cable in kilograms
    pub weight_per_cable_kg: f32,
    /// Reps performed before working reps start counting
    pub warmup_reps: u8,
    /// End the set at the top of the final rep
    pub stop_at_top: bool,
    /// Free lifting with no rep target
    pub is_just_lift: bool,
    /// As many reps as possible; ended by stall detection
    pub is_amrap: bool,
    /// Weight change applied per rep (negative for regression)
    pub progression_kg: f32,
}

impl Default for WorkoutParameters {
    fn default() -> Self {
        Self {
            mode: WorkoutMode::OldSchool,
            target_reps: 10,
            weight_per_cable_kg: 10.0,
            warmup_reps: 3,
            stop_at_top: false,
            is_just_lift: false,
            is_amrap: false,
            progression_kg: 0.0,
        }
    }
}

impl WorkoutParameters {
    /// Whether the set has no fixed rep target
    #[must_use]
    pub const fn is_open_ended(&self) -> bool {
        self.is_amrap || self.is_just_lift
    }

    /// Copy with every field clamped to the range the device supports
    #[must_use]
    pub fn clamped(&self) -> Self {
        let weight = if self.weight_per_cable_kg.is_finite() {
            self.weight_per_cable_kg
                .clamp(MIN_WEIGHT_PER_CABLE_KG, MAX_WEIGHT_PER_CABLE_KG)
        } else {
            MIN_WEIGHT_PER_CABLE_KG
        };
        let progression = if self.progression_kg.is_finite() {
            self.progression_kg
                .clamp(-MAX_PROGRESSION_KG, MAX_PROGRESSION_KG)
        } else {
            0.0
        };
        let mode = match self.mode {
            WorkoutMode::Echo {
                level,
                eccentric_load_pct,
            } => WorkoutMode::Echo {
                level,
                eccentric_load_pct: eccentric_load_pct.min(MAX_ECCENTRIC_LOAD_PCT),
            },
            other => other,
        };

        Self {
            mode,
            target_reps: self.target_reps.clamp(MIN_TARGET_REPS, MAX_TARGET_REPS),
            weight_per_cable_kg: weight,
            warmup_reps: self.warmup_reps.min(MAX_WARMUP_REPS),
            stop_at_top: self.stop_at_top,
            is_just_lift: self.is_just_lift,
            is_amrap: self.is_amrap,
            progression_kg: progression,
        }
    }
}

/// Point in the lift cycle of the cable pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepPhase {
    /// Handles at rest near the bottom
    #[default]
    Rest,
    /// Lifting
    Concentric,
    /// At the top of the range
    Top,
    /// Lowering
    Eccentric,
    /// Back at the bottom of the range
    Bottom,
}

impl fmt::Display for RepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rest => write!(f, "Rest"),
            Self::Concentric => write!(f, "Concentric"),
            Self::Top => write!(f, "Top"),
            Self::Eccentric => write!(f, "Eccentric"),
            Self::Bottom => write!(f, "Bottom"),
        }
    }
}

/// Cumulative rep progress within the current set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RepCount {
    /// Warmup reps completed
    pub warmup_reps: u32,
    /// Working reps completed
    pub working_reps: u32,
    /// Whether the warmup target has been met
    pub is_warmup_complete: bool,
}

impl RepCount {
    /// Fresh count for a set with the given warmup target
    #[must_use]
    pub const fn for_warmup_target(warmup_target: u8) -> Self {
        Self {
            warmup_reps: 0,
            working_reps: 0,
            is_warmup_complete: warmup_target == 0,
        }
    }

    /// Total reps of either kind
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.warmup_reps + self.working_reps
    }
}

/// Transport status reported by the BLE layer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No device connected
    #[default]
    Disconnected,
    /// Looking for devices
    Scanning,
    /// Connection in progress
    Connecting,
    /// Connected to the device with this identifier
    Connected(String),
    /// Terminal transport failure
    Error(String),
}

impl ConnectionState {
    /// Whether a device is currently connected
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected(id) => write!(f, "Connected ({id})"),
            Self::Error(reason) => write!(f, "Error: {reason}"),
        }
    }
}

/// Aggregate statistics for a finished set
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SetMetrics {
    /// Set duration in milliseconds, between the first and last sample
    /// ticks of the set (wall clock if no sample arrived)
    pub duration_ms: u64,
    /// Weight per cable times both cables times working reps, in kilograms
    pub total_volume_kg: f32,
    /// Highest combined cable force seen during the set, in kilograms
    pub peak_force_kg: f32,
    /// Mean concentric velocity across working reps, in mm/s
    pub avg_concentric_velocity_mm_s: f32,
    /// Mean range of motion across working reps, in millimetres
    pub avg_range_of_motion_mm: f32,
}

/// Session lifecycle state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum WorkoutState {
    /// Nothing in progress
    #[default]
    Idle,
    /// A set has been requested and is being prepared
    Initializing,
    /// Countdown before the set starts, in whole seconds remaining
    Countdown(u8),
    /// Lifting in progress
    Active,
    /// Set paused by the user; load released
    Paused,
    /// Set finished; results available
    SetSummary {
        /// Aggregate set statistics
        metrics: SetMetrics,
        /// Highest instantaneous power in watts
        peak_power_w: f32,
        /// Final rep count
        rep_count: RepCount,
    },
    /// Rest period between sets, in whole seconds remaining
    Resting {
        /// Seconds left in the rest period
        seconds_remaining: u32,
    },
}

impl WorkoutState {
    /// Whether a set is being prepared (initializing or counting down)
    #[must_use]
    pub const fn is_starting(&self) -> bool {
        matches!(self, Self::Initializing | Self::Countdown(_))
    }

    /// Whether a set has started and not yet been stopped
    #[must_use]
    pub const fn is_set_in_progress(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    /// Whether a new set may be started from this state
    #[must_use]
    pub const fn can_start(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::SetSummary { .. } | Self::Resting { .. }
        )
    }
}

impl fmt::Display for WorkoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Countdown(n) => write!(f, "Countdown({n})"),
            Self::Active => write!(f, "Active"),
            Self::Paused => write!(f, "Paused"),
            Self::SetSummary { rep_count, .. } => write!(
                f,
                "SetSummary({} working, {} warmup)",
                rep_count.working_reps, rep_count.warmup_reps
            ),
            Self::Resting { seconds_remaining } => write!(f, "Resting({seconds_remaining})"),
        }
    }
}

/// Machine-side rep counters carried in every telemetry sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineCounters {
    /// Times the machine registered the top of a rep
    pub up: u8,
    /// Times the machine registered the bottom of a rep
    pub down: u8,
}

/// Reading of a single cable
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CableReading {
    /// Cable extension in millimetres
    pub position_mm: f32,
    /// Cable velocity in mm/s; positive while extending
    pub velocity_mm_s: f32,
    /// Load on the cable in kilograms
    pub load_kg: f32,
}

/// One decoded device reading
///
/// Only the protocol decoder creates samples; fields are read through accessors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySample {
    cable_a: CableReading,
    cable_b: CableReading,
    timestamp_ms: u64,
    status: u16,
    counters: MachineCounters,
}

impl TelemetrySample {
    pub(crate) const fn from_parts(
        cable_a: CableReading,
        cable_b: CableReading,
        timestamp_ms: u64,
        status: u16,
        counters: MachineCounters,
    ) -> Self {
        Self {
            cable_a,
            cable_b,
            timestamp_ms,
            status,
            counters,
        }
    }

    /// Left cable reading
    #[must_use]
    pub const fn cable_a(&self) -> &CableReading {
        &self.cable_a
    }

    /// Right cable reading
    #[must_use]
    pub const fn cable_b(&self) -> &CableReading {
        &self.cable_b
    }

    /// Device tick in milliseconds
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Raw status flags
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    /// Raw machine rep counters
    #[must_use]
    pub const fn machine_counters(&self) -> MachineCounters {
        self.counters
    }

    /// The cable extended further; used as the reference for phase detection
    #[must_use]
    pub fn lead_cable(&self) -> &CableReading {
        if self.cable_b.position_mm > self.cable_a.position_mm {
            &self.cable_b
        } else {
            &self.cable_a
        }
    }

    /// Combined load on both cables in kilograms
    #[must_use]
    pub fn total_load_kg(&self) -> f32 {
        self.cable_a.load_kg + self.cable_b.load_kg
    }
}

/// Machine rep-notification record
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RepNotification {
    /// Tops registered by the machine
    pub up_counter: u32,
    /// Bottoms registered by the machine
    pub down_counter: u32,
    /// Machine's range-of-motion top, in millimetres
    pub range_top_mm: f32,
    /// Machine's range-of-motion bottom, in millimetres
    pub range_bottom_mm: f32,
    /// Range calibration reps done
    pub rom_reps_done: u16,
    /// Range calibration reps required
    pub rom_reps_total: u16,
    /// Set reps done as counted by the machine
    pub set_reps_done: u16,
    /// Set reps programmed on the machine
    pub set_reps_total: u16,
}

/// Per-rep statistics emitted by the rep detector
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RepSummary {
    /// 1-based index of the rep within the set, across warmup and working reps
    pub rep_number: u32,
    /// Whether this rep counted toward warmup
    pub is_warmup: bool,
    /// Highest combined cable force during the rep, in kilograms
    pub peak_force_kg: f32,
    /// Mean concentric velocity, in mm/s
    pub avg_concentric_velocity_mm_s: f32,
    /// Mean eccentric velocity magnitude, in mm/s
    pub avg_eccentric_velocity_mm_s: f32,
    /// Time spent lifting, in milliseconds
    pub concentric_ms: u64,
    /// Time spent at the top, in milliseconds
    pub top_ms: u64,
    /// Time spent lowering, in milliseconds
    pub eccentric_ms: u64,
    /// Distance travelled from bottom to top, in millimetres
    pub range_of_motion_mm: f32,
    /// Highest instantaneous power, in watts
    pub peak_power_w: f32,
}

/// Why a set ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// User ended the set
    User,
    /// Target reps completed
    TargetReached,
    /// No movement for longer than the stall timeout
    Stall,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::TargetReached => write!(f, "target reached"),
            Self::Stall => write!(f, "stall"),
        }
    }
}

/// Position within a routine, carried between sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoutineContext {
    /// Index of the exercise within the routine
    pub exercise_index: usize,
    /// Index of the set within the exercise
    pub set_index: usize,
}

/// Write-once record of a finished set, handed to the persistence collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedSet {
    /// Unique record identifier
    pub id: Uuid,
    /// Parameters the set ran with
    pub parameters: WorkoutParameters,
    /// Final rep count
    pub rep_count: RepCount,
    /// Aggregate statistics
    pub metrics: SetMetrics,
    /// Highest instantaneous power, in watts
    pub peak_power_w: f32,
    /// Per-rep summaries in order
    pub reps: Vec<RepSummary>,
    /// Why the set ended
    pub stop_reason: StopReason,
    /// Routine position, if the set belonged to one
    pub routine: Option<RoutineContext>,
    /// Wall-clock time the set became active
    pub started_at: SystemTime,
}

/// Device information gathered during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised device name
    pub name: String,
    /// Device address
    pub address: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(name: String, rssi: i16) -> Self {
        Self {
            name,
            address: None,
            rssi,
        }
    }

    /// Attach the device address
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}
