use serde::{Deserialize, Serialize};

use crate::error::{Result, SubstrateError};
use crate::lifecycle::LifecycleConfig;
use crate::propagation::PropagationConfig;
use crate::scheduler::SchedulerConfig;
use crate::workspace::WorkspaceConfig;

/// Every tunable of one engine instance. Missing sections and fields fall
/// back to their defaults, so a partial TOML table is a valid config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub propagation: PropagationConfig,
    pub workspace: WorkspaceConfig,
    pub lifecycle: LifecycleConfig,
    pub scheduler: SchedulerConfig,
    /// Run a lifecycle scan every this many ticks.
    pub lifecycle_every_ticks: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            propagation: PropagationConfig::default(),
            workspace: WorkspaceConfig::default(),
            lifecycle: LifecycleConfig::default(),
            scheduler: SchedulerConfig::default(),
            lifecycle_every_ticks: 10,
        }
    }
}

fn unit(name: &str, v: f64) -> Result<()> {
    if (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(SubstrateError::InvalidInput(format!(
            "{name} must be in [0, 1], got {v}"
        )))
    }
}

fn positive(name: &str, v: f64) -> Result<()> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(SubstrateError::InvalidInput(format!(
            "{name} must be positive, got {v}"
        )))
    }
}

impl EngineConfig {
    /// Reject values the dynamics cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.propagation;
        positive("propagation.diffusion_rate", p.diffusion_rate)?;
        unit("propagation.learning_rate", p.learning_rate)?;
        if p.workspace_decay_multiplier.is_nan() || p.workspace_decay_multiplier < 1.0 {
            return Err(SubstrateError::InvalidInput(format!(
                "propagation.workspace_decay_multiplier must be >= 1, got {}",
                p.workspace_decay_multiplier
            )));
        }

        let w = &self.workspace;
        if w.capacity == 0 {
            return Err(SubstrateError::InvalidInput(
                "workspace.capacity must be at least 1".into(),
            ));
        }
        positive("workspace.stability_bonus", w.stability_bonus)?;

        let l = &self.lifecycle;
        unit("lifecycle.create_jaccard_low", l.create_jaccard_low)?;
        unit("lifecycle.redirect_jaccard_high", l.redirect_jaccard_high)?;
        if l.create_jaccard_low >= l.redirect_jaccard_high {
            return Err(SubstrateError::InvalidInput(format!(
                "lifecycle.create_jaccard_low ({}) must be below redirect_jaccard_high ({})",
                l.create_jaccard_low, l.redirect_jaccard_high
            )));
        }
        unit("lifecycle.redirect_affinity", l.redirect_affinity)?;
        unit("lifecycle.redundancy_quantile", l.redundancy_quantile)?;
        unit("lifecycle.promotion_quantile", l.promotion_quantile)?;
        if l.cohort.min_samples == 0 || l.cohort.window < l.cohort.min_samples {
            return Err(SubstrateError::InvalidInput(
                "lifecycle.cohort.window must hold at least min_samples (>= 1)".into(),
            ));
        }

        let s = &self.scheduler;
        if s.min_interval_ms == 0 || s.min_interval_ms > s.max_interval_ms {
            return Err(SubstrateError::InvalidInput(format!(
                "scheduler interval bounds invalid: min {} max {}",
                s.min_interval_ms, s.max_interval_ms
            )));
        }
        unit("scheduler.ema_beta", s.ema_beta)?;

        if self.lifecycle_every_ticks == 0 {
            return Err(SubstrateError::InvalidInput(
                "lifecycle_every_ticks must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"workspace": {"capacity": 40}, "lifecycle_every_ticks": 3}"#)
                .unwrap();
        assert_eq!(cfg.workspace.capacity, 40);
        assert_eq!(cfg.workspace.stability_bonus, 1.10);
        assert_eq!(cfg.lifecycle_every_ticks, 3);
        assert_eq!(cfg.scheduler.min_interval_ms, 100);
    }

    #[test]
    fn test_rejects_inverted_jaccard_band() {
        let mut cfg = EngineConfig::default();
        cfg.lifecycle.create_jaccard_low = 0.9;
        assert!(matches!(
            cfg.validate(),
            Err(SubstrateError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut cfg = EngineConfig::default();
        cfg.workspace.capacity = 0;
        assert!(cfg.validate().is_err());
    }
}
