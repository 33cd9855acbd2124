//! Shared session state.
//!
//! The coordinator is a set of observable slots and nothing else: it holds no
//! references to the components that read and write it and makes no
//! decisions. Each slot has a single writer:
//!
//! | Slot | Writer |
//! |---|---|
//! | `workout_state`, `parameters`, `routine`, `connection_lost_during_workout`, `auto_stop_remaining_ms` | session |
//! | `rep_count`, `rep_phase`, `last_rep` | rep detector |
//! | `latest_sample`, `machine_reps` | session telemetry pipeline |
//! | `connection` | transport |

use tokio::sync::{broadcast, watch};

use crate::types::{
    ConnectionState, RepCount, RepNotification, RepPhase, RepSummary, RoutineContext,
    TelemetrySample, WorkoutParameters, WorkoutState,
};

const STATE_HISTORY_CAPACITY: usize = 64;

/// One observable value
#[derive(Debug)]
pub struct Slot<T> {
    tx: watch::Sender<T>,
    history: Option<broadcast::Sender<T>>,
}

impl<T: Clone> Slot<T> {
    /// Slot holding `initial`
    #[must_use]
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx, history: None }
    }

    /// Slot that additionally publishes every write in order
    #[must_use]
    pub fn with_history(initial: T) -> Self {
        let (history, _) = broadcast::channel(STATE_HISTORY_CAPACITY);
        Self {
            history: Some(history),
            ..Self::new(initial)
        }
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and notify watchers
    pub fn set(&self, value: T) {
        if let Some(history) = &self.history {
            // No receivers is fine; history is best-effort.
            let _ = history.send(value.clone());
        }
        self.tx.send_replace(value);
    }

    /// Watch the latest value
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Receive every subsequent write, if this slot keeps history
    #[must_use]
    pub fn history(&self) -> Option<broadcast::Receiver<T>> {
        self.history.as_ref().map(broadcast::Sender::subscribe)
    }
}

/// Canonical mutable session state shared by the session and detectors
#[derive(Debug)]
pub struct SessionCoordinator {
    /// Current lifecycle state; every transition is kept in history
    pub workout_state: Slot<WorkoutState>,
    /// Parameters for the current or next set
    pub parameters: Slot<WorkoutParameters>,
    /// Reps completed in the current set
    pub rep_count: Slot<RepCount>,
    /// Current phase of the lift cycle
    pub rep_phase: Slot<RepPhase>,
    /// Most recent decoded sample
    pub latest_sample: Slot<Option<TelemetrySample>>,
    /// Most recent machine rep notification
    pub machine_reps: Slot<Option<RepNotification>>,
    /// Transport status
    pub connection: Slot<ConnectionState>,
    /// Sticky alert raised when the link drops mid-set
    pub connection_lost_during_workout: Slot<bool>,
    /// Summary of the last completed rep
    pub last_rep: Slot<Option<RepSummary>>,
    /// Routine position carried between sets
    pub routine: Slot<Option<RoutineContext>>,
    /// Time left before a running stall timer ends the set
    pub auto_stop_remaining_ms: Slot<Option<u64>>,
}

impl SessionCoordinator {
    /// Coordinator with idle defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            workout_state: Slot::with_history(WorkoutState::Idle),
            parameters: Slot::new(WorkoutParameters::default()),
            rep_count: Slot::new(RepCount::default()),
            rep_phase: Slot::new(RepPhase::Rest),
            latest_sample: Slot::new(None),
            machine_reps: Slot::new(None),
            connection: Slot::new(ConnectionState::Disconnected),
            connection_lost_during_workout: Slot::new(false),
            last_rep: Slot::new(None),
            routine: Slot::new(None),
            auto_stop_remaining_ms: Slot::new(None),
        }
    }
}

impl Default for SessionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_get_set() {
        let slot = Slot::new(3u32);
        assert_eq!(slot.get(), 3);
        slot.set(7);
        assert_eq!(slot.get(), 7);
    }

    #[tokio::test]
    async fn test_slot_notifies_watchers() {
        let slot = Slot::new(RepPhase::Rest);
        let mut rx = slot.subscribe();
        slot.set(RepPhase::Concentric);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), RepPhase::Concentric);
    }

    #[test]
    fn test_history_keeps_every_write() {
        let coordinator = SessionCoordinator::new();
        let mut history = coordinator.workout_state.history().unwrap();

        coordinator.workout_state.set(WorkoutState::Initializing);
        coordinator.workout_state.set(WorkoutState::Active);

        assert_eq!(history.try_recv().unwrap(), WorkoutState::Initializing);
        assert_eq!(history.try_recv().unwrap(), WorkoutState::Active);
        assert!(history.try_recv().is_err());
    }

    #[test]
    fn test_plain_slot_has_no_history() {
        let coordinator = SessionCoordinator::new();
        assert!(coordinator.rep_count.history().is_none());
    }

    #[test]
    fn test_defaults() {
        let coordinator = SessionCoordinator::default();
        assert_eq!(coordinator.workout_state.get(), WorkoutState::Idle);
        assert_eq!(coordinator.connection.get(), ConnectionState::Disconnected);
        assert!(!coordinator.connection_lost_during_workout.get());
        assert!(coordinator.latest_sample.get().is_none());
    }
}
