//! Rep phase detection.
//!
//! Classifies each sample of the lead cable into a [`RepPhase`] and counts a
//! rep when the handles return to the bottom after a full
//! Concentric → Top → Eccentric cycle. The range of motion is observed: the
//! top and bottom references adapt over the first few reps of a set and are
//! then frozen so they cannot drift as the athlete fatigues.

use std::{collections::VecDeque, sync::Arc};

use tracing::{debug, info};

use crate::{
    config::RepDetectorConfig,
    coordinator::SessionCoordinator,
    types::{RepCount, RepPhase, RepSummary, TelemetrySample, WorkoutParameters},
};

const GRAVITY: f32 = 9.81;

/// Statistics for the cycle currently in progress
#[derive(Debug, Clone, Default)]
struct Cycle {
    reached_top: bool,
    counted: bool,
    concentric_start_ms: u64,
    top_start_ms: Option<u64>,
    eccentric_start_ms: Option<u64>,
    min_position: f32,
    max_position: f32,
    peak_force_kg: f32,
    peak_power_w: f32,
    concentric_velocity_sum: f32,
    concentric_samples: u32,
    eccentric_velocity_sum: f32,
    eccentric_samples: u32,
}

impl Cycle {
    fn start(timestamp_ms: u64, position: f32) -> Self {
        Self {
            concentric_start_ms: timestamp_ms,
            min_position: position,
            max_position: position,
            ..Self::default()
        }
    }

    fn observe(&mut self, sample: &TelemetrySample, position: f32, velocity: f32, phase: RepPhase) {
        self.min_position = self.min_position.min(position);
        self.max_position = self.max_position.max(position);

        let force = sample.total_load_kg();
        self.peak_force_kg = self.peak_force_kg.max(force);
        self.peak_power_w = self
            .peak_power_w
            .max(force * GRAVITY * velocity.abs() / 1000.0);

        match phase {
            RepPhase::Concentric => {
                self.concentric_velocity_sum += velocity;
                self.concentric_samples += 1;
            }
            RepPhase::Eccentric => {
                self.eccentric_velocity_sum += velocity.abs();
                self.eccentric_samples += 1;
            }
            RepPhase::Rest | RepPhase::Top | RepPhase::Bottom => {}
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn summarize(&self, rep_number: u32, is_warmup: bool, end_ms: u64) -> RepSummary {
        let top_start = self.top_start_ms.unwrap_or(end_ms);
        let eccentric_start = self.eccentric_start_ms.unwrap_or(end_ms);
        let mean = |sum: f32, n: u32| if n == 0 { 0.0 } else { sum / n as f32 };

        RepSummary {
            rep_number,
            is_warmup,
            peak_force_kg: self.peak_force_kg,
            avg_concentric_velocity_mm_s: mean(
                self.concentric_velocity_sum,
                self.concentric_samples,
            ),
            avg_eccentric_velocity_mm_s: mean(self.eccentric_velocity_sum, self.eccentric_samples),
            concentric_ms: top_start.saturating_sub(self.concentric_start_ms),
            top_ms: eccentric_start.saturating_sub(top_start),
            eccentric_ms: end_ms.saturating_sub(eccentric_start),
            range_of_motion_mm: self.max_position - self.min_position,
            peak_power_w: self.peak_power_w,
        }
    }
}

/// Observed range of motion
#[derive(Debug, Clone, Default)]
struct RangeOfMotion {
    bottom: Option<f32>,
    top: Option<f32>,
    calibration_tops: Vec<f32>,
    frozen: bool,
}

impl RangeOfMotion {
    fn span(&self, min_rom_mm: f32) -> f32 {
        match (self.bottom, self.top) {
            (Some(bottom), Some(top)) if top - bottom >= min_rom_mm => top - bottom,
            _ => min_rom_mm,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_rep(&mut self, cycle: &Cycle, calibration_reps: u32) {
        if self.frozen {
            return;
        }
        self.calibration_tops.push(cycle.max_position);
        self.top = Some(
            self.calibration_tops.iter().sum::<f32>() / self.calibration_tops.len() as f32,
        );
        self.bottom = Some(
            self.bottom
                .map_or(cycle.min_position, |b| b.min(cycle.min_position)),
        );
        if self.calibration_tops.len() >= calibration_reps as usize {
            self.frozen = true;
        }
    }
}

/// Classifies telemetry into lift phases and counts reps
pub struct RepPhaseDetector {
    config: RepDetectorConfig,
    coordinator: Arc<SessionCoordinator>,
    window: VecDeque<(f32, f32)>,
    phase: RepPhase,
    range: RangeOfMotion,
    cycle: Option<Cycle>,
    still_since_ms: Option<u64>,
    count: RepCount,
    warmup_target: u32,
    working_target: Option<u32>,
    stop_at_top: bool,
}

impl RepPhaseDetector {
    /// Create a detector writing phase and rep count to `coordinator`
    #[must_use]
    pub fn new(config: RepDetectorConfig, coordinator: Arc<SessionCoordinator>) -> Self {
        let window = VecDeque::with_capacity(config.window_size);
        Self {
            config,
            coordinator,
            window,
            phase: RepPhase::Rest,
            range: RangeOfMotion::default(),
            cycle: None,
            still_since_ms: None,
            count: RepCount::default(),
            warmup_target: 0,
            working_target: None,
            stop_at_top: false,
        }
    }

    /// Prepare for a new set: clears calibration and rep count
    pub fn begin_set(&mut self, params: &WorkoutParameters) {
        self.set_targets(params);
        self.reset();
    }

    /// Apply changed targets mid-set, keeping the reps already counted
    ///
    /// Warmup completion is re-evaluated only while no working rep has been
    /// counted; once working reps exist the set stays past warmup.
    pub fn update_targets(&mut self, params: &WorkoutParameters) {
        self.set_targets(params);
        if self.count.working_reps == 0 {
            self.count.is_warmup_complete = self.count.warmup_reps >= self.warmup_target;
        }
        self.coordinator.rep_count.set(self.count);
    }

    fn set_targets(&mut self, params: &WorkoutParameters) {
        self.warmup_target = u32::from(params.warmup_reps);
        self.working_target = if params.is_open_ended() {
            None
        } else {
            Some(u32::from(params.target_reps))
        };
        self.stop_at_top = params.stop_at_top;
    }

    /// Return to fresh calibration state, keeping the set's targets
    pub fn reset(&mut self) {
        self.window.clear();
        self.phase = RepPhase::Rest;
        self.range = RangeOfMotion::default();
        self.cycle = None;
        self.still_since_ms = None;
        self.count = RepCount {
            warmup_reps: 0,
            working_reps: 0,
            is_warmup_complete: self.warmup_target == 0,
        };

        self.coordinator.rep_phase.set(self.phase);
        self.coordinator.rep_count.set(self.count);
        self.coordinator.last_rep.set(None);
    }

    /// Drop calibration and any in-flight cycle, keeping the finished set's count
    pub fn release(&mut self) {
        self.window.clear();
        self.range = RangeOfMotion::default();
        self.cycle = None;
        self.still_since_ms = None;
        self.phase = RepPhase::Rest;
        self.coordinator.rep_phase.set(self.phase);
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> RepPhase {
        self.phase
    }

    /// Reps counted so far in this set
    #[must_use]
    pub const fn rep_count(&self) -> RepCount {
        self.count
    }

    /// Whether the range of motion has been frozen
    #[must_use]
    pub const fn is_calibrated(&self) -> bool {
        self.range.frozen
    }

    /// Observed (bottom, top) references, once a rep has been seen
    #[must_use]
    pub fn range_of_motion(&self) -> Option<(f32, f32)> {
        self.range.bottom.zip(self.range.top)
    }

    /// Classify one sample; returns a summary when it completes a rep
    pub fn process(&mut self, sample: &TelemetrySample) -> Option<RepSummary> {
        let lead = sample.lead_cable();
        let position = lead.position_mm;
        let now = sample.timestamp_ms();

        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back((position, lead.velocity_mm_s));
        let velocity = self.smoothed_velocity();

        if !self.range.frozen && matches!(self.phase, RepPhase::Rest | RepPhase::Bottom) {
            self.range.bottom = Some(self.range.bottom.map_or(position, |b| b.min(position)));
        }

        if velocity.abs() < self.config.rest_velocity_mm_s {
            self.still_since_ms.get_or_insert(now);
        } else {
            self.still_since_ms = None;
        }

        let previous = self.phase;
        let (next, completed) = self.classify(sample, position, velocity, now);

        if let Some(cycle) = self.cycle.as_mut() {
            cycle.observe(sample, position, velocity, next);
        }

        if next != previous {
            debug!(from = %previous, to = %next, position, velocity, "rep phase change");
            self.phase = next;
            self.coordinator.rep_phase.set(next);
        }

        completed
    }

    fn classify(
        &mut self,
        sample: &TelemetrySample,
        position: f32,
        velocity: f32,
        now: u64,
    ) -> (RepPhase, Option<RepSummary>) {
        let min_velocity = self.config.min_velocity_mm_s;
        let span = self.range.span(self.config.min_rom_mm);
        let tolerance = span * self.config.position_tolerance;
        let bottom = self.range.bottom.unwrap_or(position);
        let near_bottom = position <= bottom + tolerance;
        let near_top = self.range.frozen
            && self
                .range
                .top
                .is_some_and(|top| position >= top - tolerance);
        let rested = near_bottom
            && self.still_since_ms.is_some_and(|since| {
                now.saturating_sub(since) >= self.config.rest_debounce_ms
            });

        match self.phase {
            RepPhase::Rest | RepPhase::Bottom => {
                if velocity > min_velocity {
                    self.cycle = Some(Cycle::start(now, position));
                    (RepPhase::Concentric, None)
                } else if rested {
                    (RepPhase::Rest, None)
                } else {
                    (self.phase, None)
                }
            }
            RepPhase::Concentric => {
                let travel = position - bottom;
                let stopped_rising = velocity < self.config.rest_velocity_mm_s;
                if near_top
                    || (!self.range.frozen && stopped_rising && travel >= self.config.min_rom_mm)
                {
                    let completed = self.enter_top(sample, now);
                    (RepPhase::Top, completed)
                } else if velocity < -min_velocity {
                    debug!(travel, "reversal before reaching top");
                    self.mark_eccentric(now);
                    (RepPhase::Eccentric, None)
                } else if rested {
                    self.cycle = None;
                    (RepPhase::Rest, None)
                } else {
                    (RepPhase::Concentric, None)
                }
            }
            RepPhase::Top => {
                if velocity < -min_velocity {
                    self.mark_eccentric(now);
                    (RepPhase::Eccentric, None)
                } else if near_bottom {
                    self.mark_eccentric(now);
                    let completed = self.complete_cycle(sample, now);
                    (RepPhase::Bottom, completed)
                } else {
                    (RepPhase::Top, None)
                }
            }
            RepPhase::Eccentric => {
                if near_bottom {
                    let completed = self.complete_cycle(sample, now);
                    (RepPhase::Bottom, completed)
                } else if velocity > min_velocity {
                    (RepPhase::Concentric, None)
                } else {
                    (RepPhase::Eccentric, None)
                }
            }
        }
    }

    /// Warmup done and every working rep of a fixed target counted
    fn target_met(&self) -> bool {
        self.count.is_warmup_complete
            && self
                .working_target
                .is_some_and(|target| self.count.working_reps >= target)
    }

    fn enter_top(&mut self, sample: &TelemetrySample, now: u64) -> Option<RepSummary> {
        let final_rep_at_top = self.stop_at_top
            && !self.target_met()
            && self.count.is_warmup_complete
            && self
                .working_target
                .is_some_and(|target| self.count.working_reps + 1 >= target);

        let cycle = self.cycle.as_mut()?;
        cycle.reached_top = true;
        cycle.top_start_ms.get_or_insert(now);

        if final_rep_at_top && !cycle.counted {
            cycle.counted = true;
            return Some(self.count_rep(sample, now));
        }
        None
    }

    fn mark_eccentric(&mut self, now: u64) {
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.eccentric_start_ms.get_or_insert(now);
        }
    }

    fn complete_cycle(&mut self, sample: &TelemetrySample, now: u64) -> Option<RepSummary> {
        let cycle = self.cycle.as_ref()?;
        if !cycle.reached_top {
            debug!("partial cycle ended at bottom; not counted");
            self.cycle = None;
            return None;
        }
        if cycle.counted {
            self.cycle = None;
            return None;
        }
        if self.target_met() {
            debug!(working_reps = self.count.working_reps, "rep beyond target not counted");
            self.cycle = None;
            return None;
        }
        let summary = self.count_rep(sample, now);
        self.cycle = None;
        Some(summary)
    }

    fn count_rep(&mut self, sample: &TelemetrySample, now: u64) -> RepSummary {
        let position = sample.lead_cable().position_mm;
        let is_warmup = !self.count.is_warmup_complete;
        if is_warmup {
            self.count.warmup_reps += 1;
            if self.count.warmup_reps >= self.warmup_target {
                self.count.is_warmup_complete = true;
                info!(warmup_reps = self.count.warmup_reps, "warmup complete");
            }
        } else {
            self.count.working_reps += 1;
        }

        let summary = match self.cycle.as_mut() {
            Some(cycle) => {
                cycle.min_position = cycle.min_position.min(position);
                cycle.max_position = cycle.max_position.max(position);
                let was_frozen = self.range.frozen;
                self.range.record_rep(cycle, self.config.calibration_reps);
                if self.range.frozen && !was_frozen {
                    info!(
                        bottom = ?self.range.bottom,
                        top = ?self.range.top,
                        "range of motion calibrated"
                    );
                }
                cycle.summarize(self.count.total(), is_warmup, now)
            }
            None => RepSummary {
                rep_number: self.count.total(),
                is_warmup,
                ..RepSummary::default()
            },
        };

        info!(
            rep = summary.rep_number,
            warmup = is_warmup,
            working_reps = self.count.working_reps,
            "rep completed"
        );
        self.coordinator.rep_count.set(self.count);
        self.coordinator.last_rep.set(Some(summary));
        summary
    }

    #[allow(clippy::cast_precision_loss)]
    fn smoothed_velocity(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().map(|(_, v)| v).sum::<f32>() / self.window.len() as f32
    }
}
