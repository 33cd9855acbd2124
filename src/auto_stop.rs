//! Automatic set termination.
//!
//! The detector only reports that a set should end; applying the stop is the
//! session's job.

use std::{fmt, sync::Arc};

use tracing::{debug, info};

use crate::{
    config::AutoStopConfig,
    coordinator::SessionCoordinator,
    types::{RepPhase, StopReason, TelemetrySample},
};

/// Why the detector wants the set to end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStopReason {
    /// Working reps reached the target
    TargetReached,
    /// Handles rested longer than the stall timeout
    Stall,
}

impl From<AutoStopReason> for StopReason {
    fn from(reason: AutoStopReason) -> Self {
        match reason {
            AutoStopReason::TargetReached => Self::TargetReached,
            AutoStopReason::Stall => Self::Stall,
        }
    }
}

impl fmt::Display for AutoStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetReached => write!(f, "target reached"),
            Self::Stall => write!(f, "stall"),
        }
    }
}

/// Watches rep progress and rest time for conditions that end a set
pub struct AutoStopDetector {
    config: AutoStopConfig,
    coordinator: Arc<SessionCoordinator>,
    rest_since_ms: Option<u64>,
    last_sample_ms: Option<u64>,
    fired: bool,
}

impl AutoStopDetector {
    /// Create a detector reading rep progress from `coordinator`
    #[must_use]
    pub const fn new(config: AutoStopConfig, coordinator: Arc<SessionCoordinator>) -> Self {
        Self {
            config,
            coordinator,
            rest_since_ms: None,
            last_sample_ms: None,
            fired: false,
        }
    }

    /// Clear timers and re-arm for a new set
    pub fn reset(&mut self) {
        self.rest_since_ms = None;
        self.last_sample_ms = None;
        self.fired = false;
        self.coordinator.auto_stop_remaining_ms.set(None);
    }

    /// Restart the stall timer, e.g. after resuming from pause
    pub fn restart_idle_timer(&mut self) {
        self.rest_since_ms = None;
        self.coordinator.auto_stop_remaining_ms.set(None);
    }

    /// Time left on a running stall timer
    #[must_use]
    pub fn pending_stop_ms(&self) -> Option<u64> {
        let since = self.rest_since_ms?;
        let now = self.last_sample_ms?;
        Some(
            self.config
                .stall_timeout_ms
                .saturating_sub(now.saturating_sub(since)),
        )
    }

    /// Evaluate one tick; returns a reason at most once per set
    pub fn evaluate(&mut self, sample: &TelemetrySample) -> Option<AutoStopReason> {
        if self.fired {
            return None;
        }

        let now = sample.timestamp_ms();
        self.last_sample_ms = Some(now);

        let params = self.coordinator.parameters.get();
        let count = self.coordinator.rep_count.get();
        let phase = self.coordinator.rep_phase.get();

        if !params.is_open_ended()
            && count.is_warmup_complete
            && count.working_reps >= u32::from(params.target_reps)
            && (phase == RepPhase::Rest || params.stop_at_top)
        {
            info!(working_reps = count.working_reps, "target reps reached");
            return Some(self.fire(AutoStopReason::TargetReached));
        }

        if phase != RepPhase::Rest {
            if self.rest_since_ms.take().is_some() {
                self.coordinator.auto_stop_remaining_ms.set(None);
            }
            return None;
        }

        let armed = !self.config.require_movement_before_stall || count.total() > 0;
        if !armed {
            return None;
        }

        let since = *self.rest_since_ms.get_or_insert(now);
        let resting_ms = now.saturating_sub(since);
        let remaining = self.config.stall_timeout_ms.saturating_sub(resting_ms);
        self.coordinator.auto_stop_remaining_ms.set(Some(remaining));

        if remaining > 0 {
            return None;
        }

        if !count.is_warmup_complete {
            debug!(resting_ms, "stall during warmup ignored");
            return None;
        }

        info!(resting_ms, "stall detected");
        Some(self.fire(AutoStopReason::Stall))
    }

    fn fire(&mut self, reason: AutoStopReason) -> AutoStopReason {
        self.fired = true;
        self.rest_since_ms = None;
        self.coordinator.auto_stop_remaining_ms.set(None);
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CableReading, MachineCounters, RepCount, WorkoutParameters};
    use proptest::prelude::*;

    fn sample_at(timestamp_ms: u64) -> TelemetrySample {
        let cable = CableReading {
            position_mm: 50.0,
            velocity_mm_s: 0.0,
            load_kg: 10.0,
        };
        TelemetrySample::from_parts(cable, cable, timestamp_ms, 0, MachineCounters::default())
    }

    fn setup(params: WorkoutParameters, count: RepCount) -> (AutoStopDetector, Arc<SessionCoordinator>) {
        let coordinator = Arc::new(SessionCoordinator::new());
        coordinator.parameters.set(params);
        coordinator.rep_count.set(count);
        coordinator.rep_phase.set(RepPhase::Rest);
        (
            AutoStopDetector::new(AutoStopConfig::default(), coordinator.clone()),
            coordinator,
        )
    }

    fn working(reps: u32) -> RepCount {
        RepCount {
            warmup_reps: 0,
            working_reps: reps,
            is_warmup_complete: true,
        }
    }

    #[test]
    fn test_target_reached_at_rest() {
        let params = WorkoutParameters {
            target_reps: 3,
            ..Default::default()
        };
        let (mut detector, coordinator) = setup(params, working(3));

        coordinator.rep_phase.set(RepPhase::Bottom);
        assert_eq!(detector.evaluate(&sample_at(0)), None);

        coordinator.rep_phase.set(RepPhase::Rest);
        assert_eq!(
            detector.evaluate(&sample_at(50)),
            Some(AutoStopReason::TargetReached)
        );
        // Fires once.
        assert_eq!(detector.evaluate(&sample_at(100)), None);
    }

    #[test]
    fn test_stop_at_top_does_not_wait_for_rest() {
        let params = WorkoutParameters {
            target_reps: 1,
            stop_at_top: true,
            ..Default::default()
        };
        let (mut detector, coordinator) = setup(params, working(1));
        coordinator.rep_phase.set(RepPhase::Top);
        assert_eq!(
            detector.evaluate(&sample_at(0)),
            Some(AutoStopReason::TargetReached)
        );
    }

    #[test]
    fn test_amrap_ignores_target() {
        let params = WorkoutParameters {
            target_reps: 2,
            is_amrap: true,
            ..Default::default()
        };
        let (mut detector, _) = setup(params, working(5));
        assert_eq!(detector.evaluate(&sample_at(0)), None);
        assert_eq!(detector.pending_stop_ms(), Some(5_000));
    }

    #[test]
    fn test_stall_after_timeout() {
        let params = WorkoutParameters {
            is_amrap: true,
            ..Default::default()
        };
        let (mut detector, coordinator) = setup(params, working(4));

        assert_eq!(detector.evaluate(&sample_at(1_000)), None);
        assert_eq!(detector.evaluate(&sample_at(4_000)), None);
        assert_eq!(coordinator.auto_stop_remaining_ms.get(), Some(2_000));
        assert_eq!(
            detector.evaluate(&sample_at(6_000)),
            Some(AutoStopReason::Stall)
        );
        assert_eq!(coordinator.auto_stop_remaining_ms.get(), None);
    }

    #[test]
    fn test_movement_restarts_stall_timer() {
        let params = WorkoutParameters {
            is_amrap: true,
            ..Default::default()
        };
        let (mut detector, coordinator) = setup(params, working(1));

        detector.evaluate(&sample_at(0));
        coordinator.rep_phase.set(RepPhase::Concentric);
        assert_eq!(detector.evaluate(&sample_at(4_000)), None);
        assert_eq!(detector.pending_stop_ms(), None);

        coordinator.rep_phase.set(RepPhase::Rest);
        assert_eq!(detector.evaluate(&sample_at(5_000)), None);
        assert_eq!(detector.evaluate(&sample_at(9_000)), None);
        assert_eq!(
            detector.evaluate(&sample_at(10_000)),
            Some(AutoStopReason::Stall)
        );
    }

    #[test]
    fn test_stall_requires_a_rep_by_default() {
        let params = WorkoutParameters {
            is_amrap: true,
            warmup_reps: 0,
            ..Default::default()
        };
        let (mut detector, _) = setup(params, working(0));
        assert_eq!(detector.evaluate(&sample_at(0)), None);
        assert_eq!(detector.evaluate(&sample_at(60_000)), None);
    }

    #[test]
    fn test_stall_honoured_once_warmup_completes() {
        let params = WorkoutParameters {
            is_amrap: true,
            warmup_reps: 3,
            ..Default::default()
        };
        let warming = RepCount {
            warmup_reps: 1,
            working_reps: 0,
            is_warmup_complete: false,
        };
        let (mut detector, coordinator) = setup(params, warming);

        assert_eq!(detector.evaluate(&sample_at(0)), None);
        assert_eq!(detector.evaluate(&sample_at(10_000)), None);

        coordinator.rep_count.set(RepCount {
            warmup_reps: 3,
            working_reps: 0,
            is_warmup_complete: true,
        });
        assert_eq!(
            detector.evaluate(&sample_at(10_050)),
            Some(AutoStopReason::Stall)
        );
    }

    #[test]
    fn test_restart_idle_timer() {
        let params = WorkoutParameters {
            is_amrap: true,
            ..Default::default()
        };
        let (mut detector, _) = setup(params, working(2));
        detector.evaluate(&sample_at(0));
        detector.evaluate(&sample_at(4_900));
        detector.restart_idle_timer();
        assert_eq!(detector.evaluate(&sample_at(5_000)), None);
        assert_eq!(detector.pending_stop_ms(), Some(5_000));
    }

    proptest! {
        #[test]
        fn prop_stall_never_fires_during_warmup(
            idle_ms in 0u64..600_000,
            warmup_done in 0u32..5,
        ) {
            let params = WorkoutParameters {
                is_amrap: true,
                warmup_reps: 5,
                ..Default::default()
            };
            let count = RepCount {
                warmup_reps: warmup_done,
                working_reps: 0,
                is_warmup_complete: false,
            };
            let (mut detector, _) = setup(params, count);
            prop_assert_eq!(detector.evaluate(&sample_at(0)), None);
            prop_assert_eq!(detector.evaluate(&sample_at(idle_ms)), None);
        }
    }
}
