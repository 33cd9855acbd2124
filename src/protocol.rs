use crate::{
    error::{Result, TrainerError},
    types::{
        CableReading, EchoLevel, MachineCounters, RepNotification, TelemetrySample,
        WorkoutMode, WorkoutParameters,
    },
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of init/start/stop frames
pub const CONTROL_FRAME_SIZE: usize = 4;
/// Size of the compact regular-mode frame
pub const REGULAR_FRAME_SIZE: usize = 25;
/// Size of the echo-mode frame
pub const ECHO_FRAME_SIZE: usize = 29;
/// Size of the full program activation frame
pub const ACTIVATION_FRAME_SIZE: usize = 97;
/// Size of a telemetry sample frame
pub const SAMPLE_FRAME_SIZE: usize = 28;
/// Size of a rep notification frame
pub const REP_FRAME_SIZE: usize = 24;

/// Rep target value meaning "no fixed target"
pub const UNLIMITED_REPS: u8 = 0xFF;

const FLAG_STOP_AT_TOP: u8 = 0x01;
const FLAG_JUST_LIFT: u8 = 0x02;
const FLAG_AMRAP: u8 = 0x04;

/// Command opcodes understood by the trainer firmware
///
/// The opcode is always the first byte of an outgoing frame and fixes the
/// frame's total length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Start the programmed set
    Start = 0x03,
    /// Full program activation
    Activation = 0x04,
    /// Stop and release load
    Stop = 0x05,
    /// Reset the motor controller before configuration
    Init = 0x0A,
    /// Load-matching echo program
    EchoMode = 0x4E,
    /// Compact mode and weight update
    RegularMode = 0x4F,
}

impl Opcode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x03 => Some(Self::Start),
            0x04 => Some(Self::Activation),
            0x05 => Some(Self::Stop),
            0x0A => Some(Self::Init),
            0x4E => Some(Self::EchoMode),
            0x4F => Some(Self::RegularMode),
            _ => None,
        }
    }

    /// Frame length carried by this opcode
    #[must_use]
    pub const fn frame_size(self) -> usize {
        match self {
            Self::Start | Self::Stop | Self::Init => CONTROL_FRAME_SIZE,
            Self::RegularMode => REGULAR_FRAME_SIZE,
            Self::EchoMode => ECHO_FRAME_SIZE,
            Self::Activation => ACTIVATION_FRAME_SIZE,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::Activation => write!(f, "Activation"),
            Self::Stop => write!(f, "Stop"),
            Self::Init => write!(f, "Init"),
            Self::EchoMode => write!(f, "EchoMode"),
            Self::RegularMode => write!(f, "RegularMode"),
        }
    }
}

/// Which part of a set a command belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Program configuration (mode, weight, reps)
    Config,
    /// Begin the configured set
    Start,
    /// End the set
    Stop,
}

/// Set-behaviour flags carried in configuration frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigFlags {
    /// End at the top of the last rep
    pub stop_at_top: bool,
    /// Free lifting, no target
    pub just_lift: bool,
    /// As many reps as possible
    pub amrap: bool,
}

impl ConfigFlags {
    fn from_parameters(params: &WorkoutParameters) -> Self {
        Self {
            stop_at_top: params.stop_at_top,
            just_lift: params.is_just_lift,
            amrap: params.is_amrap,
        }
    }

    const fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.stop_at_top {
            byte |= FLAG_STOP_AT_TOP;
        }
        if self.just_lift {
            byte |= FLAG_JUST_LIFT;
        }
        if self.amrap {
            byte |= FLAG_AMRAP;
        }
        byte
    }

    const fn from_byte(byte: u8) -> Self {
        Self {
            stop_at_top: byte & FLAG_STOP_AT_TOP != 0,
            just_lift: byte & FLAG_JUST_LIFT != 0,
            amrap: byte & FLAG_AMRAP != 0,
        }
    }
}

/// Force profile the firmware applies for a mode, as percentages and timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ModeProfile {
    concentric_pct: u16,
    eccentric_pct: u16,
    ramp_ms: u16,
    hold_ms: u16,
}

impl ModeProfile {
    const fn for_mode(mode: WorkoutMode) -> Self {
        let (concentric_pct, eccentric_pct, ramp_ms, hold_ms) = match mode {
            WorkoutMode::OldSchool => (100, 100, 0, 0),
            WorkoutMode::Pump => (100, 80, 150, 0),
            WorkoutMode::Tut => (100, 100, 250, 500),
            WorkoutMode::TutBeast => (100, 120, 250, 500),
            WorkoutMode::EccentricOnly => (0, 100, 0, 0),
            WorkoutMode::Echo {
                eccentric_load_pct, ..
            } => (100, eccentric_load_pct, 100, 0),
        };
        Self {
            concentric_pct,
            eccentric_pct,
            ramp_ms,
            hold_ms,
        }
    }
}

/// A fully encoded command frame ready to be written to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingCommand {
    opcode: Opcode,
    frame: Bytes,
}

impl OutgoingCommand {
    /// Build the frame for `class` from the given parameters
    ///
    /// Parameters are clamped before encoding; this never fails.
    #[must_use]
    pub fn encode(params: &WorkoutParameters, class: CommandClass) -> Self {
        match class {
            CommandClass::Config => Self::configure(params),
            CommandClass::Start => Self::start(),
            CommandClass::Stop => Self::stop(),
        }
    }

    /// Reset the motor controller
    #[must_use]
    pub fn init() -> Self {
        Self::control(Opcode::Init)
    }

    /// Begin the configured set
    #[must_use]
    pub fn start() -> Self {
        Self::control(Opcode::Start)
    }

    /// Stop the set and release load
    #[must_use]
    pub fn stop() -> Self {
        Self::control(Opcode::Stop)
    }

    /// Configuration frame appropriate for the parameters' mode
    #[must_use]
    pub fn configure(params: &WorkoutParameters) -> Self {
        if params.mode.is_echo() {
            Self::echo_mode(params)
        } else {
            Self::activation(params)
        }
    }

    /// Compact frame carrying mode and weight, used for mid-set changes
    #[must_use]
    pub fn regular_mode(params: &WorkoutParameters) -> Self {
        let params = params.clamped();
        let mut buf = BytesMut::with_capacity(REGULAR_FRAME_SIZE);

        buf.put_u8(Opcode::RegularMode as u8);
        buf.put_bytes(0, 3);
        buf.put_u8(params.mode.code());
        buf.put_u16_le(scale_u16(params.weight_per_cable_kg, 100.0));
        buf.put_i16_le(scale_i16(params.progression_kg, 100.0));
        buf.put_u8(rep_target_byte(&params));
        buf.put_u8(params.warmup_reps);
        buf.put_u8(ConfigFlags::from_parameters(&params).to_byte());
        buf.put_bytes(0, REGULAR_FRAME_SIZE - 1 - buf.len());

        Self::sealed(Opcode::RegularMode, buf)
    }

    /// Echo program frame
    ///
    /// Non-echo parameters are sent with the default echo settings.
    #[must_use]
    pub fn echo_mode(params: &WorkoutParameters) -> Self {
        let params = params.clamped();
        let (level, eccentric_pct) = match params.mode {
            WorkoutMode::Echo {
                level,
                eccentric_load_pct,
            } => (level, eccentric_load_pct),
            _ => (EchoLevel::Hard, 100),
        };
        let mut buf = BytesMut::with_capacity(ECHO_FRAME_SIZE);

        buf.put_u8(Opcode::EchoMode as u8);
        buf.put_bytes(0, 3);
        buf.put_u8(level as u8);
        buf.put_u16_le(eccentric_pct);
        buf.put_u16_le(scale_u16(params.weight_per_cable_kg, 10.0));
        buf.put_u8(rep_target_byte(&params));
        buf.put_u8(params.warmup_reps);
        buf.put_u8(ConfigFlags::from_parameters(&params).to_byte());
        buf.put_bytes(0, ECHO_FRAME_SIZE - 1 - buf.len());

        Self::sealed(Opcode::EchoMode, buf)
    }

    /// Full program activation frame
    #[must_use]
    pub fn activation(params: &WorkoutParameters) -> Self {
        let params = params.clamped();
        let profile = ModeProfile::for_mode(params.mode);
        let (echo_level, eccentric_pct) = match params.mode {
            WorkoutMode::Echo {
                level,
                eccentric_load_pct,
            } => (level as u8, eccentric_load_pct),
            _ => (0, 100),
        };
        let mut buf = BytesMut::with_capacity(ACTIVATION_FRAME_SIZE);

        buf.put_u8(Opcode::Activation as u8);
        buf.put_bytes(0, 3);
        buf.put_u8(rep_target_byte(&params));
        buf.put_u8(params.warmup_reps);
        buf.put_u8(params.mode.code());
        buf.put_u8(ConfigFlags::from_parameters(&params).to_byte());
        buf.put_u16_le(scale_u16(params.weight_per_cable_kg, 100.0));
        buf.put_u16_le(scale_u16(params.weight_per_cable_kg * 2.0, 10.0));
        buf.put_i16_le(scale_i16(params.progression_kg, 100.0));
        buf.put_u16_le(eccentric_pct);
        buf.put_u8(echo_level);
        buf.put_u16_le(profile.concentric_pct);
        buf.put_u16_le(profile.eccentric_pct);
        buf.put_u16_le(profile.ramp_ms);
        buf.put_u16_le(profile.hold_ms);
        buf.put_bytes(0, ACTIVATION_FRAME_SIZE - 1 - buf.len());

        Self::sealed(Opcode::Activation, buf)
    }

    /// Opcode of this frame
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Encoded frame bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// Frame length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    /// Whether the frame is empty (never true for encoded commands)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    fn control(opcode: Opcode) -> Self {
        let mut buf = BytesMut::with_capacity(CONTROL_FRAME_SIZE);
        buf.put_u8(opcode as u8);
        buf.put_bytes(0, CONTROL_FRAME_SIZE - 1);
        Self {
            opcode,
            frame: buf.freeze(),
        }
    }

    fn sealed(opcode: Opcode, mut buf: BytesMut) -> Self {
        let sum = checksum(&buf);
        buf.put_u8(sum);
        Self {
            opcode,
            frame: buf.freeze(),
        }
    }
}

/// Outgoing frame parsed back into its fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedCommand {
    /// Init, start or stop
    Control(Opcode),
    /// Regular, echo or activation frame
    Config {
        /// Frame opcode
        opcode: Opcode,
        /// Program mode, including echo settings where the frame carries them
        mode: WorkoutMode,
        /// Weight per cable in kilograms
        weight_per_cable_kg: f32,
        /// Rep target, `None` when unlimited
        target_reps: Option<u8>,
        /// Warmup reps
        warmup_reps: u8,
        /// Set-behaviour flags
        flags: ConfigFlags,
        /// Per-rep progression in kilograms (0 for echo frames)
        progression_kg: f32,
    },
}

/// Parse an outgoing command frame
///
/// # Errors
///
/// Returns [`TrainerError::Decode`] if the opcode is unknown, the length does
/// not match the opcode, the checksum fails, or the mode code is unknown.
pub fn parse_command(data: &[u8]) -> Result<DecodedCommand> {
    let first = *data
        .first()
        .ok_or_else(|| TrainerError::Decode("empty command frame".to_string()))?;
    let opcode = Opcode::from_u8(first)
        .ok_or_else(|| TrainerError::Decode(format!("unknown opcode: {first:02X}")))?;

    expect_len(data, opcode.frame_size(), "command")?;

    if opcode.frame_size() == CONTROL_FRAME_SIZE {
        return Ok(DecodedCommand::Control(opcode));
    }

    verify_checksum(data)?;

    let mut buf = &data[4..data.len() - 1];
    let decoded = match opcode {
        Opcode::RegularMode => {
            let mode = mode_from_code(buf.get_u8())?;
            let weight = f32::from(buf.get_u16_le()) / 100.0;
            let progression = f32::from(buf.get_i16_le()) / 100.0;
            let reps = buf.get_u8();
            let warmup = buf.get_u8();
            let flags = ConfigFlags::from_byte(buf.get_u8());
            DecodedCommand::Config {
                opcode,
                mode,
                weight_per_cable_kg: weight,
                target_reps: rep_target_from_byte(reps),
                warmup_reps: warmup,
                flags,
                progression_kg: progression,
            }
        }
        Opcode::EchoMode => {
            let level = EchoLevel::from(buf.get_u8());
            let eccentric_load_pct = buf.get_u16_le();
            let weight = f32::from(buf.get_u16_le()) / 10.0;
            let reps = buf.get_u8();
            let warmup = buf.get_u8();
            let flags = ConfigFlags::from_byte(buf.get_u8());
            DecodedCommand::Config {
                opcode,
                mode: WorkoutMode::Echo {
                    level,
                    eccentric_load_pct,
                },
                weight_per_cable_kg: weight,
                target_reps: rep_target_from_byte(reps),
                warmup_reps: warmup,
                flags,
                progression_kg: 0.0,
            }
        }
        Opcode::Activation => {
            let reps = buf.get_u8();
            let warmup = buf.get_u8();
            let mut mode = mode_from_code(buf.get_u8())?;
            let flags = ConfigFlags::from_byte(buf.get_u8());
            let weight = f32::from(buf.get_u16_le()) / 100.0;
            let _total_load = buf.get_u16_le();
            let progression = f32::from(buf.get_i16_le()) / 100.0;
            let eccentric_load_pct = buf.get_u16_le();
            let level = EchoLevel::from(buf.get_u8());
            if mode.is_echo() {
                mode = WorkoutMode::Echo {
                    level,
                    eccentric_load_pct,
                };
            }
            DecodedCommand::Config {
                opcode,
                mode,
                weight_per_cable_kg: weight,
                target_reps: rep_target_from_byte(reps),
                warmup_reps: warmup,
                flags,
                progression_kg: progression,
            }
        }
        Opcode::Start | Opcode::Stop | Opcode::Init => DecodedCommand::Control(opcode),
    };

    Ok(decoded)
}

/// Characteristic an incoming frame arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// Position/velocity/load sample characteristic
    Sample,
    /// Machine rep counter characteristic
    Reps,
}

/// Undecoded notification as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Characteristic the bytes came from
    pub source: FrameSource,
    /// Notification payload
    pub data: Bytes,
}

impl RawFrame {
    /// Wrap a sample-characteristic payload
    #[must_use]
    pub fn sample(data: impl Into<Bytes>) -> Self {
        Self {
            source: FrameSource::Sample,
            data: data.into(),
        }
    }

    /// Wrap a rep-characteristic payload
    #[must_use]
    pub fn reps(data: impl Into<Bytes>) -> Self {
        Self {
            source: FrameSource::Reps,
            data: data.into(),
        }
    }
}

/// A decoded incoming frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryFrame {
    /// Cable sample
    Sample(TelemetrySample),
    /// Machine rep counters
    Reps(RepNotification),
}

/// Decode a raw notification according to its source
///
/// # Errors
///
/// Returns [`TrainerError::Decode`] when the frame is malformed.
pub fn decode_frame(frame: &RawFrame) -> Result<TelemetryFrame> {
    match frame.source {
        FrameSource::Sample => decode_sample(&frame.data).map(TelemetryFrame::Sample),
        FrameSource::Reps => decode_rep_notification(&frame.data).map(TelemetryFrame::Reps),
    }
}

/// Parse a telemetry sample frame
///
/// Layout (little-endian):
/// - Bytes 0-3: device tick in ms (u32)
/// - Bytes 4-7: positions A/B (i16, divide by 10 for mm)
/// - Bytes 8-11: velocities A/B (i16, divide by 10 for mm/s)
/// - Bytes 12-15: loads A/B (u16, divide by 100 for kg)
/// - Bytes 16-17: status flags
/// - Bytes 18-19: machine up/down counters
/// - Byte 26: sequence, byte 27: XOR checksum
///
/// # Errors
///
/// Returns [`TrainerError::Decode`] on a length or checksum mismatch.
pub fn decode_sample(data: &[u8]) -> Result<TelemetrySample> {
    expect_len(data, SAMPLE_FRAME_SIZE, "sample")?;
    verify_checksum(data)?;

    let mut buf = data;
    let tick = buf.get_u32_le();
    let position_a = f32::from(buf.get_i16_le()) / 10.0;
    let position_b = f32::from(buf.get_i16_le()) / 10.0;
    let velocity_a = f32::from(buf.get_i16_le()) / 10.0;
    let velocity_b = f32::from(buf.get_i16_le()) / 10.0;
    let load_a = f32::from(buf.get_u16_le()) / 100.0;
    let load_b = f32::from(buf.get_u16_le()) / 100.0;
    let status = buf.get_u16_le();
    let counters = MachineCounters {
        up: buf.get_u8(),
        down: buf.get_u8(),
    };

    Ok(TelemetrySample::from_parts(
        CableReading {
            position_mm: position_a,
            velocity_mm_s: velocity_a,
            load_kg: load_a,
        },
        CableReading {
            position_mm: position_b,
            velocity_mm_s: velocity_b,
            load_kg: load_b,
        },
        u64::from(tick),
        status,
        counters,
    ))
}

/// Parse a machine rep notification frame
///
/// # Errors
///
/// Returns [`TrainerError::Decode`] on a length mismatch or non-finite range values.
pub fn decode_rep_notification(data: &[u8]) -> Result<RepNotification> {
    expect_len(data, REP_FRAME_SIZE, "rep notification")?;

    let mut buf = data;
    let notification = RepNotification {
        up_counter: buf.get_u32_le(),
        down_counter: buf.get_u32_le(),
        range_top_mm: buf.get_f32_le(),
        range_bottom_mm: buf.get_f32_le(),
        rom_reps_done: buf.get_u16_le(),
        rom_reps_total: buf.get_u16_le(),
        set_reps_done: buf.get_u16_le(),
        set_reps_total: buf.get_u16_le(),
    };

    if !notification.range_top_mm.is_finite() || !notification.range_bottom_mm.is_finite() {
        return Err(TrainerError::Decode(
            "rep notification carries non-finite range".to_string(),
        ));
    }

    Ok(notification)
}

/// Sample values in physical units, encodable into a device frame
///
/// Used by simulators and tests to produce what the trainer would send.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleFrame {
    /// Device tick in milliseconds
    pub tick_ms: u32,
    /// Left cable
    pub cable_a: CableReading,
    /// Right cable
    pub cable_b: CableReading,
    /// Status flags
    pub status: u16,
    /// Machine rep counters
    pub counters: MachineCounters,
    /// Frame sequence number
    pub sequence: u8,
}

impl SampleFrame {
    /// Frame where both cables move identically
    #[must_use]
    pub fn symmetric(tick_ms: u32, position_mm: f32, velocity_mm_s: f32, load_kg: f32) -> Self {
        let cable = CableReading {
            position_mm,
            velocity_mm_s,
            load_kg,
        };
        Self {
            tick_ms,
            cable_a: cable,
            cable_b: cable,
            ..Default::default()
        }
    }

    /// Encode into the 28-byte wire layout
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SAMPLE_FRAME_SIZE);
        buf.put_u32_le(self.tick_ms);
        buf.put_i16_le(scale_i16(self.cable_a.position_mm, 10.0));
        buf.put_i16_le(scale_i16(self.cable_b.position_mm, 10.0));
        buf.put_i16_le(scale_i16(self.cable_a.velocity_mm_s, 10.0));
        buf.put_i16_le(scale_i16(self.cable_b.velocity_mm_s, 10.0));
        buf.put_u16_le(scale_u16(self.cable_a.load_kg, 100.0));
        buf.put_u16_le(scale_u16(self.cable_b.load_kg, 100.0));
        buf.put_u16_le(self.status);
        buf.put_u8(self.counters.up);
        buf.put_u8(self.counters.down);
        buf.put_bytes(0, 6);
        buf.put_u8(self.sequence);
        let sum = checksum(&buf);
        buf.put_u8(sum);
        buf.freeze()
    }
}

/// Encode a rep notification into the 24-byte wire layout
#[must_use]
pub fn encode_rep_notification(notification: &RepNotification) -> Bytes {
    let mut buf = BytesMut::with_capacity(REP_FRAME_SIZE);
    buf.put_u32_le(notification.up_counter);
    buf.put_u32_le(notification.down_counter);
    buf.put_f32_le(notification.range_top_mm);
    buf.put_f32_le(notification.range_bottom_mm);
    buf.put_u16_le(notification.rom_reps_done);
    buf.put_u16_le(notification.rom_reps_total);
    buf.put_u16_le(notification.set_reps_done);
    buf.put_u16_le(notification.set_reps_total);
    buf.freeze()
}

/// XOR of all bytes
#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

fn verify_checksum(data: &[u8]) -> Result<()> {
    let (body, tail) = data.split_at(data.len() - 1);
    let expected = checksum(body);
    if tail[0] != expected {
        return Err(TrainerError::Decode(format!(
            "checksum mismatch: got {:02X}, expected {expected:02X}",
            tail[0]
        )));
    }
    Ok(())
}

fn expect_len(data: &[u8], expected: usize, what: &str) -> Result<()> {
    if data.len() != expected {
        return Err(TrainerError::Decode(format!(
            "{what} frame is {} bytes, expected {expected}",
            data.len()
        )));
    }
    Ok(())
}

fn mode_from_code(code: u8) -> Result<WorkoutMode> {
    WorkoutMode::from_code(code)
        .ok_or_else(|| TrainerError::Decode(format!("unknown mode code: {code}")))
}

const fn rep_target_byte(params: &WorkoutParameters) -> u8 {
    if params.is_open_ended() {
        UNLIMITED_REPS
    } else {
        params.target_reps
    }
}

const fn rep_target_from_byte(byte: u8) -> Option<u8> {
    if byte == UNLIMITED_REPS {
        None
    } else {
        Some(byte)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale_u16(value: f32, factor: f32) -> u16 {
    (value * factor).round().clamp(0.0, f32::from(u16::MAX)) as u16
}

#[allow(clippy::cast_possible_truncation)]
fn scale_i16(value: f32, factor: f32) -> i16 {
    (value * factor)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config_fields(cmd: &OutgoingCommand) -> (WorkoutMode, f32, Option<u8>, u8, ConfigFlags) {
        match parse_command(cmd.as_bytes()).unwrap() {
            DecodedCommand::Config {
                mode,
                weight_per_cable_kg,
                target_reps,
                warmup_reps,
                flags,
                ..
            } => (mode, weight_per_cable_kg, target_reps, warmup_reps, flags),
            DecodedCommand::Control(op) => panic!("expected config frame, got {op}"),
        }
    }

    #[test]
    fn test_control_frames() {
        for (cmd, opcode) in [
            (OutgoingCommand::init(), Opcode::Init),
            (OutgoingCommand::start(), Opcode::Start),
            (OutgoingCommand::stop(), Opcode::Stop),
        ] {
            assert_eq!(cmd.len(), CONTROL_FRAME_SIZE);
            assert_eq!(cmd.as_bytes()[0], opcode as u8);
            assert_eq!(
                parse_command(cmd.as_bytes()).unwrap(),
                DecodedCommand::Control(opcode)
            );
        }
    }

    #[test]
    fn test_frame_sizes() {
        let params = WorkoutParameters::default();
        assert_eq!(OutgoingCommand::regular_mode(&params).len(), REGULAR_FRAME_SIZE);
        assert_eq!(OutgoingCommand::echo_mode(&params).len(), ECHO_FRAME_SIZE);
        assert_eq!(OutgoingCommand::activation(&params).len(), ACTIVATION_FRAME_SIZE);
    }

    #[test]
    fn test_regular_frame_layout() {
        let params = WorkoutParameters {
            mode: WorkoutMode::Pump,
            weight_per_cable_kg: 22.5,
            target_reps: 8,
            warmup_reps: 2,
            stop_at_top: true,
            ..Default::default()
        };
        let cmd = OutgoingCommand::regular_mode(&params);
        let bytes = cmd.as_bytes();

        assert_eq!(bytes[0], 0x4F);
        assert_eq!(bytes[4], 2);
        assert_eq!(&bytes[5..7], &2250u16.to_le_bytes());
        assert_eq!(bytes[9], 8);
        assert_eq!(bytes[10], 2);
        assert_eq!(bytes[11], FLAG_STOP_AT_TOP);
        assert_eq!(bytes[24], checksum(&bytes[..24]));
    }

    #[test]
    fn test_encode_dispatches_on_class() {
        let params = WorkoutParameters::default();
        assert_eq!(
            OutgoingCommand::encode(&params, CommandClass::Config).opcode(),
            Opcode::Activation
        );
        assert_eq!(
            OutgoingCommand::encode(&params, CommandClass::Start).opcode(),
            Opcode::Start
        );
        assert_eq!(
            OutgoingCommand::encode(&params, CommandClass::Stop).opcode(),
            Opcode::Stop
        );

        let echo = WorkoutParameters {
            mode: WorkoutMode::Echo {
                level: EchoLevel::Harder,
                eccentric_load_pct: 120,
            },
            ..Default::default()
        };
        assert_eq!(
            OutgoingCommand::encode(&echo, CommandClass::Config).opcode(),
            Opcode::EchoMode
        );
    }

    #[test]
    fn test_out_of_range_weight_is_clamped_not_rejected() {
        let params = WorkoutParameters {
            weight_per_cable_kg: 180.0,
            target_reps: 250,
            ..Default::default()
        };
        let (_, weight, reps, _, _) = config_fields(&OutgoingCommand::regular_mode(&params));
        assert!((weight - 100.0).abs() < f32::EPSILON);
        assert_eq!(reps, Some(100));
    }

    #[test]
    fn test_open_ended_sets_encode_unlimited_reps() {
        let params = WorkoutParameters {
            is_amrap: true,
            ..Default::default()
        };
        let cmd = OutgoingCommand::activation(&params);
        assert_eq!(cmd.as_bytes()[4], UNLIMITED_REPS);
        let (_, _, reps, _, flags) = config_fields(&cmd);
        assert_eq!(reps, None);
        assert!(flags.amrap);
    }

    #[test]
    fn test_echo_frame_round_trips_echo_settings() {
        let params = WorkoutParameters {
            mode: WorkoutMode::Echo {
                level: EchoLevel::Epic,
                eccentric_load_pct: 130,
            },
            weight_per_cable_kg: 40.5,
            ..Default::default()
        };
        let (mode, weight, _, _, _) = config_fields(&OutgoingCommand::echo_mode(&params));
        assert_eq!(mode, params.mode);
        assert!((weight - 40.5).abs() < 1e-4);
    }

    #[test]
    fn test_activation_carries_echo_settings() {
        let params = WorkoutParameters {
            mode: WorkoutMode::Echo {
                level: EchoLevel::Hardest,
                eccentric_load_pct: 75,
            },
            ..Default::default()
        };
        let (mode, _, _, _, _) = config_fields(&OutgoingCommand::activation(&params));
        assert_eq!(mode, params.mode);
    }

    #[test]
    fn test_corrupted_command_checksum_rejected() {
        let cmd = OutgoingCommand::activation(&WorkoutParameters::default());
        let mut bytes = cmd.as_bytes().to_vec();
        bytes[8] ^= 0xFF;
        assert!(parse_command(&bytes).unwrap_err().is_decode_error());
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert!(parse_command(&[0x99, 0, 0, 0]).is_err());
        assert!(parse_command(&[]).is_err());
    }

    #[test]
    fn test_sample_decoding() {
        let frame = SampleFrame {
            tick_ms: 1_250,
            cable_a: CableReading {
                position_mm: 412.3,
                velocity_mm_s: -250.5,
                load_kg: 20.25,
            },
            cable_b: CableReading {
                position_mm: 408.0,
                velocity_mm_s: 248.0,
                load_kg: 19.75,
            },
            status: 0x0003,
            counters: MachineCounters { up: 4, down: 3 },
            sequence: 17,
        };
        let sample = decode_sample(&frame.encode()).unwrap();

        assert_eq!(sample.timestamp_ms(), 1_250);
        assert!((sample.cable_a().position_mm - 412.3).abs() < 1e-3);
        assert!((sample.cable_a().velocity_mm_s + 250.5).abs() < 1e-3);
        assert!((sample.cable_b().load_kg - 19.75).abs() < 1e-3);
        assert_eq!(sample.status(), 0x0003);
        assert_eq!(sample.machine_counters(), MachineCounters { up: 4, down: 3 });
    }

    #[test]
    fn test_short_sample_rejected() {
        let bytes = SampleFrame::symmetric(10, 100.0, 0.0, 5.0).encode();
        let err = decode_sample(&bytes[..27]).unwrap_err();
        assert!(err.is_decode_error());
        assert!(err.to_string().contains("27 bytes"));
    }

    #[test]
    fn test_sample_checksum_rejected() {
        let mut bytes = SampleFrame::symmetric(10, 100.0, 0.0, 5.0).encode().to_vec();
        bytes[5] ^= 0x10;
        assert!(decode_sample(&bytes).is_err());
    }

    #[test]
    fn test_rep_notification_decoding() {
        let notification = RepNotification {
            up_counter: 7,
            down_counter: 6,
            range_top_mm: 620.5,
            range_bottom_mm: 35.0,
            rom_reps_done: 3,
            rom_reps_total: 3,
            set_reps_done: 4,
            set_reps_total: 10,
        };
        let frame = RawFrame::reps(encode_rep_notification(&notification));
        assert_eq!(
            decode_frame(&frame).unwrap(),
            TelemetryFrame::Reps(notification)
        );
    }

    #[test]
    fn test_rep_notification_length_checked() {
        assert!(decode_rep_notification(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_rep_notification_rejects_nan_range() {
        let notification = RepNotification {
            range_top_mm: f32::NAN,
            ..Default::default()
        };
        assert!(decode_rep_notification(&encode_rep_notification(&notification)).is_err());
    }

    fn mode_strategy() -> impl Strategy<Value = WorkoutMode> {
        prop_oneof![
            Just(WorkoutMode::OldSchool),
            Just(WorkoutMode::Pump),
            Just(WorkoutMode::Tut),
            Just(WorkoutMode::TutBeast),
            Just(WorkoutMode::EccentricOnly),
            (0u8..4, 0u16..=150).prop_map(|(level, pct)| WorkoutMode::Echo {
                level: EchoLevel::from(level),
                eccentric_load_pct: pct,
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_config_frames_round_trip_weight_and_mode(
            mode in mode_strategy(),
            centi_kg in 0u16..=10_000,
            reps in 1u8..=100,
        ) {
            let params = WorkoutParameters {
                mode,
                weight_per_cable_kg: f32::from(centi_kg) / 100.0,
                target_reps: reps,
                ..Default::default()
            };

            let (decoded_mode, weight, decoded_reps, _, _) =
                config_fields(&OutgoingCommand::activation(&params));
            prop_assert_eq!(decoded_mode, mode);
            prop_assert!((weight - params.weight_per_cable_kg).abs() < 0.005);
            prop_assert_eq!(decoded_reps, Some(reps));

            let (decoded_mode, weight, _, _, _) =
                config_fields(&OutgoingCommand::regular_mode(&params));
            prop_assert_eq!(decoded_mode.code(), mode.code());
            prop_assert!((weight - params.weight_per_cable_kg).abs() < 0.005);
        }

        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..40)) {
            let _ = decode_sample(&data);
            let _ = decode_rep_notification(&data);
            let _ = parse_command(&data);
        }
    }
}
