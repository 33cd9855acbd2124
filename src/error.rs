use thiserror::Error;

/// Errors that can occur when working with a cable trainer
#[derive(Error, Debug)]
pub enum TrainerError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Trainer device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Command timeout
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A command could not be delivered to the device
    #[error("Failed to send {opcode} command: {reason}")]
    Transport {
        /// Name of the command that failed
        opcode: String,
        /// Underlying failure description
        reason: String,
    },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An incoming frame could not be decoded
    #[error("Failed to decode frame: {0}")]
    Decode(String),

    /// The requested operation is not valid in the current workout state
    #[error("Invalid workout state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// A pending workout start was cancelled before the set began
    #[error("Workout start cancelled")]
    Cancelled,

    /// The persistence collaborator failed to store a record
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration failed validation or could not be parsed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session task is no longer running
    #[error("Workout session has shut down")]
    SessionClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for trainer operations
pub type Result<T> = std::result::Result<T, TrainerError>;

impl TrainerError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::Transport { .. }
        )
    }

    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Decode(_) | Self::InvalidState { .. } | Self::Cancelled
        )
    }

    /// Check if this error came from a malformed incoming frame
    #[must_use]
    pub const fn is_decode_error(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

impl From<toml::de::Error> for TrainerError {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}
