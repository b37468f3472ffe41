//! Adaptive tick timing.
//!
//! The next tick fires at the minimum of three candidate intervals:
//!
//! - stimulus: time since the last external stimulus (dormant when none)
//! - activation: projected time until some node crosses the workspace entry
//!   threshold
//! - arousal floor: `ceiling / (1 + gain × active_energy)`, EMA-smoothed
//!
//! The scheduler holds no clock. Callers pass `now` in Unix milliseconds so
//! the state machine stays deterministic under test.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::constants::WORKSPACE_ENTRY_THRESHOLD;
use crate::error::{Result, SubstrateError};
use crate::propagation::EnergyChange;
use crate::time::Timestamp;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Upper bound on the physics step, whatever the wall-clock gap.
    pub dt_cap_ms: u64,
    pub arousal_ceiling_ms: u64,
    pub arousal_gain: f64,
    /// EMA weight of the newest sample (0 = frozen, 1 = no memory).
    pub ema_beta: f64,
    /// Also smooth the stimulus interval.
    pub smooth_stimulus: bool,
    pub entry_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 100,
            max_interval_ms: 60_000,
            dt_cap_ms: 5_000,
            arousal_ceiling_ms: 10_000,
            arousal_gain: 4.0,
            ema_beta: 0.3,
            smooth_stimulus: false,
            entry_threshold: WORKSPACE_ENTRY_THRESHOLD,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Scheduled,
    Ticking,
}

/// Which candidate set the interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickFactor {
    Stimulus,
    Activation,
    ArousalFloor,
}

/// Inputs the engine measures after each tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ActivitySignal {
    /// Seconds until the earliest projected threshold crossing, if any node
    /// is heading there.
    pub time_to_cross: Option<f64>,
    /// Sum of energy over active nodes, all channels.
    pub active_energy: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TickDecision {
    pub interval_ms: u64,
    pub due_at: Timestamp,
    pub factor: TickFactor,
    pub stimulus_ms: f64,
    pub activation_ms: f64,
    pub arousal_ms: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TickStart {
    /// Physics step in seconds.
    pub dt: f64,
    pub capped: bool,
    pub started_at: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StimulusEffect {
    /// A scheduled wait should be cut short and recomputed.
    Preempt,
    /// Only recorded; takes effect at the next scheduling.
    Recorded,
}

#[derive(Clone, Debug)]
pub struct TickScheduler {
    pub config: SchedulerConfig,
    state: SchedulerState,
    last_stimulus: Option<Timestamp>,
    last_tick: Option<Timestamp>,
    stimulus_ema: Option<f64>,
    arousal_ema: Option<f64>,
    pending: Option<TickDecision>,
}

impl TickScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: SchedulerState::Idle,
            last_stimulus: None,
            last_tick: None,
            stimulus_ema: None,
            arousal_ema: None,
            pending: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn pending(&self) -> Option<&TickDecision> {
        self.pending.as_ref()
    }

    fn clamp_ms(&self, ms: f64) -> f64 {
        let min = self.config.min_interval_ms as f64;
        let max = self.config.max_interval_ms.max(self.config.min_interval_ms) as f64;
        ms.clamp(min, max)
    }

    pub fn on_stimulus(&mut self, now: Timestamp) -> StimulusEffect {
        self.last_stimulus = Some(now);
        match self.state {
            SchedulerState::Scheduled => {
                trace!("stimulus pre-empts scheduled tick");
                StimulusEffect::Preempt
            }
            SchedulerState::Idle | SchedulerState::Ticking => StimulusEffect::Recorded,
        }
    }

    fn stimulus_interval(&mut self, now: Timestamp) -> f64 {
        let Some(last) = self.last_stimulus else {
            return self.config.max_interval_ms as f64;
        };
        let raw = self.clamp_ms((now - last).max(0) as f64);
        if !self.config.smooth_stimulus {
            return raw;
        }
        let beta = self.config.ema_beta.clamp(0.0, 1.0);
        let smoothed = match self.stimulus_ema {
            Some(prev) => beta * raw + (1.0 - beta) * prev,
            None => raw,
        };
        self.stimulus_ema = Some(smoothed);
        smoothed
    }

    fn activation_interval(&self, signal: &ActivitySignal) -> f64 {
        match signal.time_to_cross {
            Some(secs) if secs.is_finite() && secs >= 0.0 => self.clamp_ms(secs * 1000.0),
            _ => self.config.max_interval_ms as f64,
        }
    }

    fn arousal_interval(&mut self, signal: &ActivitySignal) -> f64 {
        let ceiling = self.config.arousal_ceiling_ms as f64;
        let energy = signal.active_energy.max(0.0);
        let raw = ceiling / (1.0 + self.config.arousal_gain.max(0.0) * energy);
        let beta = self.config.ema_beta.clamp(0.0, 1.0);
        let smoothed = match self.arousal_ema {
            Some(prev) => beta * raw + (1.0 - beta) * prev,
            None => raw,
        };
        let smoothed = smoothed.min(ceiling);
        self.arousal_ema = Some(smoothed);
        smoothed
    }

    /// Compute the next deadline and move to `Scheduled`.
    pub fn schedule(&mut self, now: Timestamp, signal: ActivitySignal) -> TickDecision {
        let stimulus_ms = self.stimulus_interval(now);
        let activation_ms = self.activation_interval(&signal);
        let arousal_ms = self.arousal_interval(&signal);

        let (factor, chosen) = [
            (TickFactor::Stimulus, stimulus_ms),
            (TickFactor::Activation, activation_ms),
            (TickFactor::ArousalFloor, arousal_ms),
        ]
        .into_iter()
        .fold((TickFactor::Stimulus, f64::INFINITY), |best, c| {
            if c.1 < best.1 { c } else { best }
        });
        let interval_ms = self.clamp_ms(chosen).round() as u64;

        let decision = TickDecision {
            interval_ms,
            due_at: now + interval_ms as Timestamp,
            factor,
            stimulus_ms,
            activation_ms,
            arousal_ms,
        };
        debug!(
            interval_ms,
            factor = ?factor,
            stimulus_ms,
            activation_ms,
            arousal_ms,
            "next tick scheduled"
        );
        self.pending = Some(decision);
        self.state = SchedulerState::Scheduled;
        decision
    }

    /// Enter `Ticking`. The physics step is the time since the previous
    /// completed tick (or the scheduled interval for the first tick), capped.
    pub fn begin_tick(&mut self, now: Timestamp) -> Result<TickStart> {
        if self.state == SchedulerState::Ticking {
            return Err(SubstrateError::TickAborted(
                "tick already in progress".into(),
            ));
        }
        let elapsed_ms = match (self.last_tick, self.pending) {
            (Some(last), _) => (now - last).max(0) as f64,
            (None, Some(p)) => p.interval_ms as f64,
            (None, None) => self.config.min_interval_ms as f64,
        };
        let elapsed_ms = elapsed_ms.max(self.config.min_interval_ms as f64);
        let cap = self.config.dt_cap_ms as f64;
        let capped = elapsed_ms > cap;
        self.state = SchedulerState::Ticking;
        self.pending = None;
        Ok(TickStart {
            dt: elapsed_ms.min(cap) / 1000.0,
            capped,
            started_at: now,
        })
    }

    pub fn end_tick(&mut self, now: Timestamp) {
        self.last_tick = Some(now);
        self.state = SchedulerState::Idle;
    }

    /// Abandon the tick in progress. The next tick integrates the full gap
    /// since the last completed one.
    pub fn abort_tick(&mut self) {
        self.state = SchedulerState::Idle;
    }
}

/// Earliest time (seconds) at which a rising node below `threshold` would
/// reach it, extrapolating the per-tick change linearly.
pub fn projected_crossing(changes: &[EnergyChange], dt: f64, threshold: f64) -> Option<f64> {
    if dt.is_nan() || dt <= 0.0 {
        return None;
    }
    changes
        .iter()
        .filter(|c| c.after < threshold && c.after > c.before)
        .map(|c| (threshold - c.after) / ((c.after - c.before) / dt))
        .filter(|t| t.is_finite())
        .min_by(f64::total_cmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{EntityId, NodeId};

    fn quiet() -> ActivitySignal {
        ActivitySignal::default()
    }

    #[test]
    fn test_dormant_uses_arousal_floor() {
        let mut s = TickScheduler::new(SchedulerConfig::default());
        let d = s.schedule(0, quiet());
        assert_eq!(d.stimulus_ms, 60_000.0);
        assert_eq!(d.activation_ms, 60_000.0);
        assert_eq!(d.factor, TickFactor::ArousalFloor);
        assert_eq!(d.interval_ms, 10_000);
        assert_eq!(s.state(), SchedulerState::Scheduled);
    }

    #[test]
    fn test_fresh_stimulus_hits_min_interval() {
        let mut s = TickScheduler::new(SchedulerConfig::default());
        s.on_stimulus(1_000);
        let d = s.schedule(1_000, quiet());
        assert_eq!(d.factor, TickFactor::Stimulus);
        assert_eq!(d.interval_ms, 100);
        assert_eq!(d.due_at, 1_100);
    }

    #[test]
    fn test_stimulus_preempts_only_when_scheduled() {
        let mut s = TickScheduler::new(SchedulerConfig::default());
        assert_eq!(s.on_stimulus(0), StimulusEffect::Recorded);
        s.schedule(0, quiet());
        assert_eq!(s.on_stimulus(10), StimulusEffect::Preempt);
        s.begin_tick(20).unwrap();
        assert_eq!(s.on_stimulus(30), StimulusEffect::Recorded);
    }

    #[test]
    fn test_activation_projection_wins() {
        let mut s = TickScheduler::new(SchedulerConfig::default());
        let d = s.schedule(
            0,
            ActivitySignal {
                time_to_cross: Some(0.5),
                active_energy: 0.0,
            },
        );
        assert_eq!(d.factor, TickFactor::Activation);
        assert_eq!(d.interval_ms, 500);
    }

    #[test]
    fn test_arousal_is_smoothed_and_bounded() {
        let mut s = TickScheduler::new(SchedulerConfig::default());
        let first = s.schedule(0, quiet()).arousal_ms;
        let hot = ActivitySignal {
            time_to_cross: None,
            active_energy: 10.0,
        };
        let second = s.schedule(0, hot).arousal_ms;
        let raw = 10_000.0 / (1.0 + 4.0 * 10.0);
        assert!(second < first);
        assert!(second > raw);
        assert!((second - (0.3 * raw + 0.7 * first)).abs() < 1e-9);
        for _ in 0..50 {
            assert!(s.schedule(0, hot).arousal_ms <= 10_000.0);
        }
    }

    #[test]
    fn test_dt_capped() {
        let mut s = TickScheduler::new(SchedulerConfig::default());
        s.schedule(0, quiet());
        let first = s.begin_tick(10_000).unwrap();
        assert_eq!(first.dt, 5.0);
        assert!(first.capped);
        s.end_tick(10_000);
        s.schedule(10_000, quiet());
        let second = s.begin_tick(10_250).unwrap();
        assert!((second.dt - 0.25).abs() < 1e-12);
        assert!(!second.capped);
    }

    #[test]
    fn test_double_begin_rejected() {
        let mut s = TickScheduler::new(SchedulerConfig::default());
        s.begin_tick(0).unwrap();
        assert!(s.begin_tick(1).unwrap_err().is_retryable());
        s.abort_tick();
        assert_eq!(s.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_projected_crossing() {
        let changes = vec![
            EnergyChange {
                node: NodeId(1),
                entity: EntityId(1),
                before: 0.02,
                after: 0.04,
            },
            EnergyChange {
                node: NodeId(2),
                entity: EntityId(1),
                before: 0.09,
                after: 0.08,
            },
            EnergyChange {
                node: NodeId(3),
                entity: EntityId(1),
                before: 0.5,
                after: 0.6,
            },
        ];
        // node 1 rises 0.02/s and needs 0.06 more
        let t = projected_crossing(&changes, 1.0, 0.1).unwrap();
        assert!((t - 3.0).abs() < 1e-9);
        assert_eq!(projected_crossing(&changes[1..], 1.0, 0.1), None);
        assert_eq!(projected_crossing(&changes, 0.0, 0.1), None);
    }
}
