//! Workout session state machine.
//!
//! [`WorkoutSession`] owns the detectors and is the only writer of
//! [`WorkoutState`]. It is driven either directly (tests feed frames and call
//! transitions one by one) or through [`spawn_session`], which runs it on a
//! single task fed by a telemetry channel, a control channel, an internal
//! timer channel and the coordinator's connection watch.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    auto_stop::AutoStopDetector,
    config::TrainerConfig,
    coordinator::SessionCoordinator,
    error::{Result, TrainerError},
    protocol::{decode_frame, OutgoingCommand, RawFrame, TelemetryFrame},
    rep_detector::RepPhaseDetector,
    types::{
        CompletedSet, ConnectionState, RepCount, RepSummary, RoutineContext, SetMetrics,
        StopReason, TelemetrySample, WorkoutParameters, WorkoutState,
    },
};

const TIMER_CHANNEL_CAPACITY: usize = 4;

/// Delivers encoded commands to the trainer
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Write one command frame
    async fn send(&self, command: &OutgoingCommand) -> Result<()>;
}

/// Stores finished sets and the last-used parameters
#[async_trait]
pub trait WorkoutRepository: Send + Sync {
    /// Store a finished set
    async fn save_completed_set(&self, set: &CompletedSet) -> Result<()>;
    /// Remember parameters for the next session
    async fn save_last_parameters(&self, params: &WorkoutParameters) -> Result<()>;
    /// Parameters saved by a previous session, if any
    async fn load_last_parameters(&self) -> Result<Option<WorkoutParameters>>;
}

/// How far `start_workout` got before returning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartProgress {
    /// The set is active
    Active,
    /// A countdown is running; the set activates when it reaches zero
    CountingDown,
}

/// Result of a stop request
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// The set ended and was handed to the repository
    Completed {
        /// Record of the finished set
        set: Box<CompletedSet>,
        /// Whether the repository accepted it
        persisted: bool,
        /// Whether the Stop frame reached the device; when false the motors
        /// may still hold load
        stop_sent: bool,
    },
    /// A pending start was cancelled before the set began
    Cancelled,
    /// Nothing to stop, or another stop was already in flight
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Countdown,
    Rest,
}

#[derive(Debug, Clone, Copy)]
struct TimerEvent {
    kind: TimerKind,
    generation: u64,
    remaining: u32,
}

/// The workout state machine
pub struct WorkoutSession {
    coordinator: Arc<SessionCoordinator>,
    transport: Arc<dyn CommandTransport>,
    repository: Arc<dyn WorkoutRepository>,
    rep_detector: RepPhaseDetector,
    auto_stop: AutoStopDetector,
    config: TrainerConfig,
    timer_tx: mpsc::Sender<TimerEvent>,
    timer_rx: Option<mpsc::Receiver<TimerEvent>>,
    timer_generation: u64,
    timer_task: Option<JoinHandle<()>>,
    pending_start: Option<oneshot::Sender<Result<()>>>,
    set_reps: Vec<RepSummary>,
    set_started_at: Option<SystemTime>,
    first_sample_ms: Option<u64>,
    last_sample_ms: Option<u64>,
}

impl WorkoutSession {
    /// Build a session around shared state and its two collaborators
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        transport: Arc<dyn CommandTransport>,
        repository: Arc<dyn WorkoutRepository>,
        config: TrainerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_CHANNEL_CAPACITY);
        let rep_detector = RepPhaseDetector::new(config.detector.clone(), coordinator.clone());
        let auto_stop = AutoStopDetector::new(config.auto_stop.clone(), coordinator.clone());
        Ok(Self {
            coordinator,
            transport,
            repository,
            rep_detector,
            auto_stop,
            config,
            timer_tx,
            timer_rx: Some(timer_rx),
            timer_generation: 0,
            timer_task: None,
            pending_start: None,
            set_reps: Vec::new(),
            set_started_at: None,
            first_sample_ms: None,
            last_sample_ms: None,
        })
    }

    /// Shared state this session writes
    #[must_use]
    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    /// Load the parameters saved by a previous session into the coordinator
    ///
    /// # Errors
    ///
    /// Returns the repository's error if loading fails.
    pub async fn restore_last_parameters(&self) -> Result<Option<WorkoutParameters>> {
        let params = self.repository.load_last_parameters().await?;
        if let Some(params) = params {
            self.coordinator.parameters.set(params.clamped());
        }
        Ok(params)
    }

    /// Begin a set
    ///
    /// `Initializing` is published before anything is sent. Without a
    /// countdown the device is configured and started before returning;
    /// otherwise the countdown timer finishes the transition.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] unless the session is idle, in a
    /// set summary or resting. A failed command send reverts to `Idle` and is
    /// returned.
    pub async fn start_workout(
        &mut self,
        params: WorkoutParameters,
        skip_countdown: bool,
    ) -> Result<StartProgress> {
        let state = self.coordinator.workout_state.get();
        if !state.can_start() {
            return Err(invalid_state(&state));
        }

        self.cancel_timers();
        let params = params.clamped();
        self.coordinator.parameters.set(params);
        self.set_state(WorkoutState::Initializing);

        self.rep_detector.begin_set(&params);
        self.auto_stop.reset();
        self.set_reps.clear();
        self.first_sample_ms = None;
        self.last_sample_ms = None;

        let seconds = self.config.session.countdown_seconds;
        if skip_countdown || seconds == 0 {
            self.activate().await?;
            return Ok(StartProgress::Active);
        }

        self.set_state(WorkoutState::Countdown(seconds));
        self.spawn_timer(TimerKind::Countdown, u32::from(seconds));
        Ok(StartProgress::CountingDown)
    }

    async fn activate(&mut self) -> Result<()> {
        let params = self.coordinator.parameters.get();
        let sequence = [
            OutgoingCommand::init(),
            OutgoingCommand::configure(&params),
            OutgoingCommand::start(),
        ];

        for command in &sequence {
            if let Err(e) = self.transport.send(command).await {
                error!(opcode = %command.opcode(), error = %e, "failed to start set");
                self.set_state(WorkoutState::Idle);
                return Err(e);
            }
        }

        self.set_started_at = Some(SystemTime::now());
        self.set_state(WorkoutState::Active);
        info!(mode = %params.mode, weight_kg = params.weight_per_cable_kg, "set active");
        Ok(())
    }

    /// End the current set
    ///
    /// An active or paused set is persisted exactly once, even with zero
    /// reps. A pending start is cancelled without persisting anything. In any
    /// other state this is a no-op.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` leaves room for transports that must
    /// confirm the stop.
    pub async fn stop(&mut self, exiting: bool) -> Result<StopOutcome> {
        let state = self.coordinator.workout_state.get();
        match state {
            WorkoutState::Active | WorkoutState::Paused => {
                Ok(self.finish_set(StopReason::User, exiting).await)
            }
            WorkoutState::Initializing | WorkoutState::Countdown(_) => {
                self.cancel_timers();
                if let Some(pending) = self.pending_start.take() {
                    let _ = pending.send(Err(TrainerError::Cancelled));
                }
                if exiting {
                    self.coordinator.routine.set(None);
                }
                self.set_state(WorkoutState::Idle);
                info!("pending start cancelled");
                Ok(StopOutcome::Cancelled)
            }
            WorkoutState::Idle | WorkoutState::SetSummary { .. } | WorkoutState::Resting { .. } => {
                debug!(state = %state, "stop ignored");
                Ok(StopOutcome::Ignored)
            }
        }
    }

    async fn finish_set(&mut self, reason: StopReason, exiting: bool) -> StopOutcome {
        let stop_sent = match self.transport.send(&OutgoingCommand::stop()).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "stop command failed; ending set locally");
                false
            }
        };
        self.cancel_timers();

        let params = self.coordinator.parameters.get();
        let rep_count = self.coordinator.rep_count.get();
        let reps = std::mem::take(&mut self.set_reps);
        let started_at = self.set_started_at.take().unwrap_or_else(SystemTime::now);
        let metrics = self.set_metrics(&params, &rep_count, &reps, started_at);
        let peak_power_w = reps.iter().map(|r| r.peak_power_w).fold(0.0, f32::max);

        let set = CompletedSet {
            id: Uuid::new_v4(),
            parameters: params,
            rep_count,
            metrics,
            peak_power_w,
            reps,
            stop_reason: reason,
            routine: self.coordinator.routine.get(),
            started_at,
        };

        let persisted = match self.repository.save_completed_set(&set).await {
            Ok(()) => true,
            Err(e) => {
                error!(set_id = %set.id, error = %e, "failed to persist completed set");
                false
            }
        };
        if let Err(e) = self.repository.save_last_parameters(&params).await {
            warn!(error = %e, "failed to save last parameters");
        }

        self.rep_detector.release();
        self.auto_stop.reset();

        if exiting {
            self.coordinator.routine.set(None);
            self.set_state(WorkoutState::Idle);
        } else {
            self.set_state(WorkoutState::SetSummary {
                metrics,
                peak_power_w,
                rep_count,
            });
        }

        info!(
            reason = %reason,
            working_reps = rep_count.working_reps,
            warmup_reps = rep_count.warmup_reps,
            persisted,
            stop_sent,
            "set finished"
        );
        StopOutcome::Completed {
            set: Box::new(set),
            persisted,
            stop_sent,
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn set_metrics(
        &self,
        params: &WorkoutParameters,
        rep_count: &RepCount,
        reps: &[RepSummary],
        started_at: SystemTime,
    ) -> SetMetrics {
        let duration_ms = match (self.first_sample_ms, self.last_sample_ms) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => started_at
                .elapsed()
                .map_or(0, |elapsed| elapsed.as_millis() as u64),
        };

        let working = || reps.iter().filter(|r| !r.is_warmup);

        SetMetrics {
            duration_ms,
            total_volume_kg: params.weight_per_cable_kg * 2.0 * rep_count.working_reps as f32,
            peak_force_kg: reps.iter().map(|r| r.peak_force_kg).fold(0.0, f32::max),
            avg_concentric_velocity_mm_s: mean(working().map(|r| r.avg_concentric_velocity_mm_s)),
            avg_range_of_motion_mm: mean(working().map(|r| r.range_of_motion_mm)),
        }
    }

    /// Release load and hold the set
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] unless active, or the send error
    /// (the set stays active).
    pub async fn pause(&mut self) -> Result<()> {
        let state = self.coordinator.workout_state.get();
        if state != WorkoutState::Active {
            return Err(invalid_state(&state));
        }
        self.transport.send(&OutgoingCommand::stop()).await?;
        self.set_state(WorkoutState::Paused);
        info!("set paused");
        Ok(())
    }

    /// Re-apply load and continue a paused set
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] unless paused, or the send error
    /// (the set stays paused).
    pub async fn resume(&mut self) -> Result<()> {
        let state = self.coordinator.workout_state.get();
        if state != WorkoutState::Paused {
            return Err(invalid_state(&state));
        }
        let params = self.coordinator.parameters.get();
        self.transport
            .send(&OutgoingCommand::configure(&params))
            .await?;
        self.transport.send(&OutgoingCommand::start()).await?;
        self.auto_stop.restart_idle_timer();
        self.set_state(WorkoutState::Active);
        info!("set resumed");
        Ok(())
    }

    /// Replace the parameter snapshot; mid-set changes reach the device first
    ///
    /// # Errors
    ///
    /// Returns the send error if the device could not be updated; the
    /// previous parameters stay in effect.
    pub async fn update_parameters(&mut self, params: WorkoutParameters) -> Result<()> {
        let params = params.clamped();
        let state = self.coordinator.workout_state.get();
        if state == WorkoutState::Active {
            let command = if params.mode.is_echo() {
                OutgoingCommand::echo_mode(&params)
            } else {
                OutgoingCommand::regular_mode(&params)
            };
            self.transport.send(&command).await?;
            info!(weight_kg = params.weight_per_cable_kg, mode = %params.mode, "parameters changed mid-set");
        }
        self.coordinator.parameters.set(params);
        if state.is_starting() || state.is_set_in_progress() {
            self.rep_detector.update_targets(&params);
        }
        Ok(())
    }

    /// Leave a summary or rest period and return to idle
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] while a set is starting or in
    /// progress.
    pub fn reset_for_new_workout(&mut self) -> Result<()> {
        let state = self.coordinator.workout_state.get();
        if state.is_starting() || state.is_set_in_progress() {
            return Err(invalid_state(&state));
        }
        self.cancel_timers();
        self.rep_detector.reset();
        self.auto_stop.reset();
        self.set_state(WorkoutState::Idle);
        Ok(())
    }

    /// Count down a rest period from a set summary
    ///
    /// Uses the configured default when `seconds` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] unless in a set summary.
    pub fn start_rest(&mut self, seconds: Option<u32>) -> Result<()> {
        let state = self.coordinator.workout_state.get();
        if !matches!(state, WorkoutState::SetSummary { .. }) {
            return Err(invalid_state(&state));
        }
        let seconds = seconds.unwrap_or(self.config.session.default_rest_seconds);
        if seconds == 0 {
            self.set_state(WorkoutState::Idle);
            return Ok(());
        }
        self.set_state(WorkoutState::Resting {
            seconds_remaining: seconds,
        });
        self.spawn_timer(TimerKind::Rest, seconds);
        Ok(())
    }

    /// Clear the sticky connection-lost alert
    pub fn dismiss_connection_alert(&self) {
        self.coordinator.connection_lost_during_workout.set(false);
    }

    /// Set or clear the routine position carried between sets
    pub fn set_routine_context(&self, context: Option<RoutineContext>) {
        self.coordinator.routine.set(context);
    }

    /// Decode and apply one notification; malformed frames are dropped
    pub async fn process_frame(&mut self, frame: &RawFrame) {
        match decode_frame(frame) {
            Ok(TelemetryFrame::Sample(sample)) => self.process_sample(sample).await,
            Ok(TelemetryFrame::Reps(notification)) => {
                self.coordinator.machine_reps.set(Some(notification));
            }
            Err(e) => {
                debug!(source = ?frame.source, len = frame.data.len(), error = %e, "dropping frame");
            }
        }
    }

    /// Apply one decoded sample
    pub async fn process_sample(&mut self, sample: TelemetrySample) {
        self.coordinator.latest_sample.set(Some(sample));
        if self.coordinator.workout_state.get() != WorkoutState::Active {
            return;
        }

        let now = sample.timestamp_ms();
        self.first_sample_ms.get_or_insert(now);
        self.last_sample_ms = Some(now);

        if let Some(summary) = self.rep_detector.process(&sample) {
            self.set_reps.push(summary);
        }

        if let Some(reason) = self.auto_stop.evaluate(&sample) {
            info!(reason = %reason, "auto-stop");
            self.finish_set(reason.into(), false).await;
        }
    }

    /// React to a transport status change
    pub fn on_connection_change(&self, connection: &ConnectionState) {
        if connection.is_connected() {
            return;
        }
        let state = self.coordinator.workout_state.get();
        if state.is_set_in_progress() && !self.coordinator.connection_lost_during_workout.get() {
            warn!(state = %state, connection = %connection, "connection lost during workout");
            self.coordinator.connection_lost_during_workout.set(true);
        }
    }

    async fn handle_timer(&mut self, event: TimerEvent) {
        if event.generation != self.timer_generation {
            debug!(kind = ?event.kind, "stale timer tick ignored");
            return;
        }
        let state = self.coordinator.workout_state.get();

        match event.kind {
            TimerKind::Countdown => {
                if !matches!(state, WorkoutState::Countdown(_)) {
                    return;
                }
                if event.remaining > 0 {
                    let seconds = u8::try_from(event.remaining).unwrap_or(u8::MAX);
                    self.set_state(WorkoutState::Countdown(seconds));
                    return;
                }
                self.timer_task = None;
                let result = self.activate().await;
                match self.pending_start.take() {
                    Some(pending) => {
                        let _ = pending.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            error!(error = %e, "set failed to start after countdown");
                        }
                    }
                }
            }
            TimerKind::Rest => {
                if !matches!(state, WorkoutState::Resting { .. }) {
                    return;
                }
                if event.remaining > 0 {
                    self.set_state(WorkoutState::Resting {
                        seconds_remaining: event.remaining,
                    });
                } else {
                    self.timer_task = None;
                    self.set_state(WorkoutState::Idle);
                    info!("rest finished");
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start {
                params,
                skip_countdown,
                reply,
            } => match self.start_workout(params, skip_countdown).await {
                Ok(StartProgress::Active) => {
                    let _ = reply.send(Ok(()));
                }
                Ok(StartProgress::CountingDown) => self.pending_start = Some(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            SessionCommand::Stop { exiting, reply } => {
                let _ = reply.send(self.stop(exiting).await);
            }
            SessionCommand::Pause { reply } => {
                let _ = reply.send(self.pause().await);
            }
            SessionCommand::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            SessionCommand::UpdateParameters { params, reply } => {
                let _ = reply.send(self.update_parameters(params).await);
            }
            SessionCommand::ResetForNewWorkout { reply } => {
                let _ = reply.send(self.reset_for_new_workout());
            }
            SessionCommand::StartRest { seconds, reply } => {
                let _ = reply.send(self.start_rest(seconds));
            }
            SessionCommand::DismissConnectionAlert => self.dismiss_connection_alert(),
            SessionCommand::SetRoutineContext(context) => self.set_routine_context(context),
        }
    }

    fn set_state(&self, state: WorkoutState) {
        debug!(state = %state, "workout state");
        self.coordinator.workout_state.set(state);
    }

    fn spawn_timer(&mut self, kind: TimerKind, seconds: u32) {
        self.cancel_timers();
        let generation = self.timer_generation;
        let tx = self.timer_tx.clone();
        self.timer_task = Some(tokio::spawn(async move {
            for remaining in (0..seconds).rev() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let event = TimerEvent {
                    kind,
                    generation,
                    remaining,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }));
    }

    fn cancel_timers(&mut self) {
        self.timer_generation = self.timer_generation.wrapping_add(1);
        if let Some(task) = self.timer_task.take() {
            task.abort();
        }
    }
}

impl Drop for WorkoutSession {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, n) = values.fold((0.0, 0u32), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f32
    }
}

fn invalid_state(state: &WorkoutState) -> TrainerError {
    TrainerError::InvalidState {
        state: state.to_string(),
    }
}

/// Requests accepted by a running session
#[derive(Debug)]
pub enum SessionCommand {
    /// Begin a set; the reply arrives once the set is active
    Start {
        /// Set parameters
        params: WorkoutParameters,
        /// Skip the countdown
        skip_countdown: bool,
        /// Completion
        reply: oneshot::Sender<Result<()>>,
    },
    /// End the set
    Stop {
        /// Leave the workout entirely instead of showing a summary
        exiting: bool,
        /// Outcome
        reply: oneshot::Sender<Result<StopOutcome>>,
    },
    /// Pause the set
    Pause {
        /// Completion
        reply: oneshot::Sender<Result<()>>,
    },
    /// Resume a paused set
    Resume {
        /// Completion
        reply: oneshot::Sender<Result<()>>,
    },
    /// Replace the parameters
    UpdateParameters {
        /// New parameters
        params: WorkoutParameters,
        /// Completion
        reply: oneshot::Sender<Result<()>>,
    },
    /// Return to idle from a summary or rest
    ResetForNewWorkout {
        /// Completion
        reply: oneshot::Sender<Result<()>>,
    },
    /// Start a rest countdown
    StartRest {
        /// Rest length; the configured default when `None`
        seconds: Option<u32>,
        /// Completion
        reply: oneshot::Sender<Result<()>>,
    },
    /// Clear the connection-lost alert
    DismissConnectionAlert,
    /// Set or clear the routine position
    SetRoutineContext(Option<RoutineContext>),
}

/// Cloneable front end to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    coordinator: Arc<SessionCoordinator>,
    stop_in_flight: Arc<AtomicBool>,
}

struct StopGuard<'a>(&'a AtomicBool);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SessionHandle {
    /// Shared state written by the session
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    /// Start a set and wait until it is active
    ///
    /// # Errors
    ///
    /// Returns the session's error, [`TrainerError::Cancelled`] if the set
    /// was stopped during the countdown, or [`TrainerError::SessionClosed`].
    pub async fn start_workout(&self, params: WorkoutParameters, skip_countdown: bool) -> Result<()> {
        self.request(|reply| SessionCommand::Start {
            params,
            skip_countdown,
            reply,
        })
        .await?
    }

    /// Stop the set; a stop issued while another is in flight is ignored
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::SessionClosed`] if the session has shut down.
    pub async fn stop(&self, exiting: bool) -> Result<StopOutcome> {
        if self.stop_in_flight.swap(true, Ordering::AcqRel) {
            debug!("stop already in flight");
            return Ok(StopOutcome::Ignored);
        }
        let _guard = StopGuard(&self.stop_in_flight);
        self.request(|reply| SessionCommand::Stop { exiting, reply })
            .await?
    }

    /// Pause the set
    ///
    /// # Errors
    ///
    /// See [`WorkoutSession::pause`].
    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Pause { reply }).await?
    }

    /// Resume a paused set
    ///
    /// # Errors
    ///
    /// See [`WorkoutSession::resume`].
    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Resume { reply }).await?
    }

    /// Replace the parameters
    ///
    /// # Errors
    ///
    /// See [`WorkoutSession::update_parameters`].
    pub async fn update_parameters(&self, params: WorkoutParameters) -> Result<()> {
        self.request(|reply| SessionCommand::UpdateParameters { params, reply })
            .await?
    }

    /// Return to idle from a summary or rest
    ///
    /// # Errors
    ///
    /// See [`WorkoutSession::reset_for_new_workout`].
    pub async fn reset_for_new_workout(&self) -> Result<()> {
        self.request(|reply| SessionCommand::ResetForNewWorkout { reply })
            .await?
    }

    /// Start a rest countdown
    ///
    /// # Errors
    ///
    /// See [`WorkoutSession::start_rest`].
    pub async fn start_rest(&self, seconds: Option<u32>) -> Result<()> {
        self.request(|reply| SessionCommand::StartRest { seconds, reply })
            .await?
    }

    /// Clear the connection-lost alert
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::SessionClosed`] if the session has shut down.
    pub async fn dismiss_connection_alert(&self) -> Result<()> {
        self.send(SessionCommand::DismissConnectionAlert).await
    }

    /// Set or clear the routine position
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::SessionClosed`] if the session has shut down.
    pub async fn set_routine_context(&self, context: Option<RoutineContext>) -> Result<()> {
        self.send(SessionCommand::SetRoutineContext(context)).await
    }

    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TrainerError::SessionClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply)).await?;
        response.await.map_err(|_| TrainerError::SessionClosed)
    }
}

/// Run `session` on its own task
///
/// Returns the control handle, the sender the transport feeds raw
/// notifications into, and the task handle. The task ends when every
/// [`SessionHandle`] has been dropped.
#[must_use]
pub fn spawn_session(
    session: WorkoutSession,
) -> (SessionHandle, mpsc::Sender<RawFrame>, JoinHandle<()>) {
    let capacities = &session.config.session;
    let (telemetry_tx, telemetry_rx) = mpsc::channel(capacities.telemetry_channel_capacity);
    let (command_tx, command_rx) = mpsc::channel(capacities.command_channel_capacity);
    let handle = SessionHandle {
        commands: command_tx,
        coordinator: session.coordinator.clone(),
        stop_in_flight: Arc::new(AtomicBool::new(false)),
    };
    let task = tokio::spawn(run_session(session, telemetry_rx, command_rx));
    (handle, telemetry_tx, task)
}

async fn run_session(
    mut session: WorkoutSession,
    mut telemetry: mpsc::Receiver<RawFrame>,
    mut commands: mpsc::Receiver<SessionCommand>,
) {
    let Some(mut timers) = session.timer_rx.take() else {
        error!("session timer channel already taken");
        return;
    };
    let mut connection = session.coordinator.connection.subscribe();
    let mut telemetry_open = true;

    info!("workout session started");
    loop {
        tokio::select! {
            biased;

            Some(event) = timers.recv() => session.handle_timer(event).await,

            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = connection.borrow_and_update().clone();
                session.on_connection_change(&state);
            }

            frame = telemetry.recv(), if telemetry_open => match frame {
                Some(frame) => session.process_frame(&frame).await,
                None => {
                    debug!("telemetry channel closed");
                    telemetry_open = false;
                }
            },

            command = commands.recv() => match command {
                Some(command) => session.handle_command(command).await,
                None => break,
            },
        }
    }
    info!("workout session stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{InMemoryRepository, RecordingTransport},
        protocol::{Opcode, SampleFrame},
        types::{RepPhase, WorkoutMode},
    };

    fn session_with(
        transport: &Arc<RecordingTransport>,
        repository: &Arc<InMemoryRepository>,
    ) -> WorkoutSession {
        WorkoutSession::new(
            Arc::new(SessionCoordinator::new()),
            transport.clone(),
            repository.clone(),
            TrainerConfig::default(),
        )
        .unwrap()
    }

    fn fixtures() -> (Arc<RecordingTransport>, Arc<InMemoryRepository>) {
        (
            Arc::new(RecordingTransport::new()),
            Arc::new(InMemoryRepository::new()),
        )
    }

    #[tokio::test]
    async fn test_start_sends_init_config_start_in_order() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);

        let progress = session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();

        assert_eq!(progress, StartProgress::Active);
        assert_eq!(
            transport.sent_opcodes().await,
            vec![Opcode::Init, Opcode::Activation, Opcode::Start]
        );
        assert_eq!(session.coordinator().workout_state.get(), WorkoutState::Active);
    }

    #[tokio::test]
    async fn test_echo_mode_configures_with_echo_frame() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        let params = WorkoutParameters {
            mode: WorkoutMode::Echo {
                level: crate::types::EchoLevel::Harder,
                eccentric_load_pct: 120,
            },
            ..Default::default()
        };

        session.start_workout(params, true).await.unwrap();
        assert_eq!(transport.sent_opcodes().await[1], Opcode::EchoMode);
    }

    #[tokio::test]
    async fn test_start_failure_reverts_to_idle() {
        let (_, repository) = fixtures();
        let transport = Arc::new(RecordingTransport::failing_on(Opcode::Start));
        let mut session = session_with(&transport, &repository);
        let mut history = session.coordinator().workout_state.history().unwrap();

        let err = session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap_err();

        assert!(err.is_connection_error());
        assert_eq!(session.coordinator().workout_state.get(), WorkoutState::Idle);
        assert_eq!(history.try_recv().unwrap(), WorkoutState::Initializing);
        assert_eq!(history.try_recv().unwrap(), WorkoutState::Idle);
    }

    #[tokio::test]
    async fn test_start_rejected_while_active() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();

        let err = session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, TrainerError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_start_clamps_parameters() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        let params = WorkoutParameters {
            weight_per_cable_kg: 500.0,
            ..Default::default()
        };
        session.start_workout(params, true).await.unwrap();
        assert!(
            (session.coordinator().parameters.get().weight_per_cable_kg - 100.0).abs()
                < f32::EPSILON
        );
    }

    #[tokio::test]
    async fn test_stop_persists_zero_rep_set() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();

        let outcome = session.stop(false).await.unwrap();
        let StopOutcome::Completed { set, persisted, stop_sent } = outcome else {
            panic!("expected a completed set");
        };

        assert!(persisted);
        assert!(stop_sent);
        assert_eq!(set.rep_count.total(), 0);
        assert_eq!(set.stop_reason, StopReason::User);
        assert_eq!(repository.completed_sets().await.len(), 1);
        assert!(repository.last_parameters().await.is_some());
        assert_eq!(transport.sent_opcodes().await.last(), Some(&Opcode::Stop));
        assert!(matches!(
            session.coordinator().workout_state.get(),
            WorkoutState::SetSummary { .. }
        ));
    }

    #[tokio::test]
    async fn test_second_stop_is_ignored() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();

        session.stop(false).await.unwrap();
        assert_eq!(session.stop(false).await.unwrap(), StopOutcome::Ignored);
        assert_eq!(repository.completed_sets().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_exiting_clears_routine() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        let routine = RoutineContext {
            exercise_index: 1,
            set_index: 2,
        };
        session.set_routine_context(Some(routine));
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();

        let StopOutcome::Completed { set, .. } = session.stop(true).await.unwrap() else {
            panic!("expected a completed set");
        };
        assert_eq!(set.routine, Some(routine));
        assert_eq!(session.coordinator().workout_state.get(), WorkoutState::Idle);
        assert!(session.coordinator().routine.get().is_none());
    }

    #[tokio::test]
    async fn test_stop_not_exiting_keeps_routine() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        let routine = RoutineContext::default();
        session.set_routine_context(Some(routine));
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();
        session.stop(false).await.unwrap();
        assert_eq!(session.coordinator().routine.get(), Some(routine));
    }

    #[tokio::test]
    async fn test_stop_send_failure_still_finishes_set() {
        let (_, repository) = fixtures();
        let transport = Arc::new(RecordingTransport::failing_on(Opcode::Stop));
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();

        let outcome = session.stop(false).await.unwrap();
        assert!(matches!(
            outcome,
            StopOutcome::Completed {
                persisted: true,
                stop_sent: false,
                ..
            }
        ));
        assert_eq!(repository.completed_sets().await.len(), 1);
        assert!(matches!(
            session.coordinator().workout_state.get(),
            WorkoutState::SetSummary { .. }
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (transport, repository) = fixtures();
        let mut config = TrainerConfig::default();
        config.session.telemetry_channel_capacity = 0;

        let result = WorkoutSession::new(
            Arc::new(SessionCoordinator::new()),
            transport.clone(),
            repository.clone(),
            config.clone(),
        );
        assert!(matches!(result, Err(TrainerError::InvalidConfig(_))));

        config = TrainerConfig::default();
        config.detector.window_size = 0;
        let result = WorkoutSession::new(
            Arc::new(SessionCoordinator::new()),
            transport,
            repository,
            config,
        );
        assert!(matches!(result, Err(TrainerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported_not_fatal() {
        let (transport, _) = fixtures();
        let repository = Arc::new(InMemoryRepository::failing());
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();

        let outcome = session.stop(false).await.unwrap();
        assert!(matches!(outcome, StopOutcome::Completed { persisted: false, .. }));
        assert!(matches!(
            session.coordinator().workout_state.get(),
            WorkoutState::SetSummary { .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_from_idle_is_ignored() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        assert_eq!(session.stop(false).await.unwrap(), StopOutcome::Ignored);
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();
        transport.clear().await;

        session.pause().await.unwrap();
        assert_eq!(session.coordinator().workout_state.get(), WorkoutState::Paused);
        session.resume().await.unwrap();
        assert_eq!(session.coordinator().workout_state.get(), WorkoutState::Active);
        assert_eq!(
            transport.sent_opcodes().await,
            vec![Opcode::Stop, Opcode::Activation, Opcode::Start]
        );
    }

    #[tokio::test]
    async fn test_pause_requires_active() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        assert!(matches!(
            session.pause().await,
            Err(TrainerError::InvalidState { .. })
        ));
        assert!(matches!(
            session.resume().await,
            Err(TrainerError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_parameters_mid_set_sends_regular_frame() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();
        transport.clear().await;

        let heavier = WorkoutParameters {
            weight_per_cable_kg: 25.0,
            ..Default::default()
        };
        session.update_parameters(heavier).await.unwrap();

        assert_eq!(transport.sent_opcodes().await, vec![Opcode::RegularMode]);
        assert_eq!(session.coordinator().parameters.get(), heavier);
    }

    #[tokio::test]
    async fn test_update_parameters_failure_keeps_previous() {
        let (_, repository) = fixtures();
        let transport = Arc::new(RecordingTransport::failing_on(Opcode::RegularMode));
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();

        let heavier = WorkoutParameters {
            weight_per_cable_kg: 25.0,
            ..Default::default()
        };
        assert!(session.update_parameters(heavier).await.is_err());
        assert_eq!(
            session.coordinator().parameters.get(),
            WorkoutParameters::default()
        );
    }

    #[tokio::test]
    async fn test_update_parameters_mid_set_in_echo_sends_echo_frame() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        let echo = WorkoutParameters {
            mode: WorkoutMode::Echo {
                level: crate::types::EchoLevel::Hard,
                eccentric_load_pct: 100,
            },
            ..Default::default()
        };
        session.start_workout(echo, true).await.unwrap();
        transport.clear().await;

        let harder = WorkoutParameters {
            mode: WorkoutMode::Echo {
                level: crate::types::EchoLevel::Epic,
                eccentric_load_pct: 140,
            },
            ..echo
        };
        session.update_parameters(harder).await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], OutgoingCommand::echo_mode(&harder));
    }

    #[tokio::test]
    async fn test_update_parameters_retargets_rep_detector() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        let params = WorkoutParameters {
            warmup_reps: 3,
            target_reps: 5,
            ..Default::default()
        };
        session.start_workout(params, true).await.unwrap();

        session
            .update_parameters(WorkoutParameters {
                warmup_reps: 0,
                ..params
            })
            .await
            .unwrap();

        let mut lift = crate::rep_detector::tests::Lift::new();
        let mut samples = lift.hold(300);
        samples.extend(lift.rep());
        samples.extend(lift.rep());
        for sample in samples {
            session.process_sample(sample).await;
        }

        assert_eq!(
            session.coordinator().rep_count.get(),
            RepCount {
                warmup_reps: 0,
                working_reps: 2,
                is_warmup_complete: true,
            }
        );
    }

    #[tokio::test]
    async fn test_update_parameters_while_idle_sends_nothing() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        session
            .update_parameters(WorkoutParameters::default())
            .await
            .unwrap();
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();

        let mut bytes = SampleFrame::symmetric(10, 300.0, 400.0, 20.0).encode().to_vec();
        bytes.pop();
        session.process_frame(&RawFrame::sample(bytes)).await;

        assert!(session.coordinator().latest_sample.get().is_none());
        assert_eq!(session.coordinator().rep_phase.get(), RepPhase::Rest);
        assert_eq!(session.coordinator().workout_state.get(), WorkoutState::Active);
    }

    #[tokio::test]
    async fn test_samples_outside_active_only_update_latest() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        let frame = SampleFrame::symmetric(10, 300.0, 400.0, 20.0).encode();
        session.process_frame(&RawFrame::sample(frame)).await;

        assert!(session.coordinator().latest_sample.get().is_some());
        assert_eq!(session.coordinator().rep_phase.get(), RepPhase::Rest);
    }

    #[tokio::test]
    async fn test_connection_loss_raises_sticky_flag() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();

        session.on_connection_change(&ConnectionState::Disconnected);
        assert!(session.coordinator().connection_lost_during_workout.get());
        assert_eq!(session.coordinator().workout_state.get(), WorkoutState::Active);

        session.on_connection_change(&ConnectionState::Connected("trainer".to_string()));
        assert!(session.coordinator().connection_lost_during_workout.get());

        session.dismiss_connection_alert();
        assert!(!session.coordinator().connection_lost_during_workout.get());
    }

    #[tokio::test]
    async fn test_connection_loss_while_idle_is_quiet() {
        let (transport, repository) = fixtures();
        let session = session_with(&transport, &repository);
        session.on_connection_change(&ConnectionState::Disconnected);
        assert!(!session.coordinator().connection_lost_during_workout.get());
    }

    #[tokio::test]
    async fn test_reset_for_new_workout() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        session
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();
        assert!(session.reset_for_new_workout().is_err());

        session.stop(false).await.unwrap();
        session.reset_for_new_workout().unwrap();
        assert_eq!(session.coordinator().workout_state.get(), WorkoutState::Idle);
    }

    #[tokio::test]
    async fn test_restore_last_parameters() {
        let (transport, repository) = fixtures();
        let saved = WorkoutParameters {
            weight_per_cable_kg: 32.5,
            target_reps: 8,
            ..Default::default()
        };
        repository.save_last_parameters(&saved).await.unwrap();

        let session = session_with(&transport, &repository);
        assert_eq!(session.restore_last_parameters().await.unwrap(), Some(saved));
        assert_eq!(session.coordinator().parameters.get(), saved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_then_active_through_runner() {
        let (transport, repository) = fixtures();
        let session = session_with(&transport, &repository);
        let coordinator = session.coordinator().clone();
        let mut history = coordinator.workout_state.history().unwrap();
        let (handle, _telemetry, _task) = spawn_session(session);

        handle
            .start_workout(WorkoutParameters::default(), false)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(state) = history.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                WorkoutState::Initializing,
                WorkoutState::Countdown(5),
                WorkoutState::Countdown(4),
                WorkoutState::Countdown(3),
                WorkoutState::Countdown(2),
                WorkoutState::Countdown(1),
                WorkoutState::Active,
            ]
        );
        assert_eq!(transport.sent_opcodes().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_countdown_cancels_start() {
        let (transport, repository) = fixtures();
        let session = session_with(&transport, &repository);
        let (handle, _telemetry, _task) = spawn_session(session);

        let starter = handle.clone();
        let start = tokio::spawn(async move {
            starter
                .start_workout(WorkoutParameters::default(), false)
                .await
        });
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(handle.stop(false).await.unwrap(), StopOutcome::Cancelled);
        assert!(matches!(
            start.await.unwrap(),
            Err(TrainerError::Cancelled)
        ));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.coordinator().workout_state.get(), WorkoutState::Idle);
        assert!(transport.sent().await.is_empty());
        assert!(repository.completed_sets().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_counts_down_to_idle() {
        let (transport, repository) = fixtures();
        let session = session_with(&transport, &repository);
        let (handle, _telemetry, _task) = spawn_session(session);

        handle
            .start_workout(WorkoutParameters::default(), true)
            .await
            .unwrap();
        handle.stop(false).await.unwrap();
        handle.start_rest(Some(3)).await.unwrap();
        assert_eq!(
            handle.coordinator().workout_state.get(),
            WorkoutState::Resting {
                seconds_remaining: 3
            }
        );

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(
            handle.coordinator().workout_state.get(),
            WorkoutState::Resting {
                seconds_remaining: 2
            }
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(handle.coordinator().workout_state.get(), WorkoutState::Idle);
    }

    #[tokio::test]
    async fn test_start_rest_requires_summary() {
        let (transport, repository) = fixtures();
        let mut session = session_with(&transport, &repository);
        assert!(matches!(
            session.start_rest(None),
            Err(TrainerError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_session() {
        let (transport, repository) = fixtures();
        let session = session_with(&transport, &repository);
        let (handle, _telemetry, task) = spawn_session(session);
        task.abort();
        let _ = task.await;

        assert!(matches!(
            handle.pause().await,
            Err(TrainerError::SessionClosed)
        ));
    }
}
