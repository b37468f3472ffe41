//! Cohort-learned thresholds.
//!
//! A cohort is the recent history of one score (redundancy, usefulness,
//! context divergence, quality). Thresholds such as "the 90th percentile of
//! redundancy" are read from it instead of being hardcoded.
//!
//! Estimator: a rolling window of the last `window` samples, each weighted by
//! `0.5^(age / half_life)` with age 0 for the newest sample. Quantiles use the
//! weighted midpoint rule (each sample sits at the middle of its cumulative
//! weight band) with linear interpolation between neighbors. With equal
//! weights this reduces to the Hazen plotting position.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::constants::{COHORT_HALF_LIFE, COHORT_MIN_SAMPLES, COHORT_WINDOW};
use crate::error::{Result, SubstrateError};

/// Which score a cohort tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortMetric {
    Redundancy,
    Usefulness,
    Divergence,
    Quality,
    Coactivation,
}

impl CohortMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redundancy => "s_red",
            Self::Usefulness => "s_use",
            Self::Divergence => "context_divergence",
            Self::Quality => "quality",
            Self::Coactivation => "coactivation",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortConfig {
    pub window: usize,
    pub half_life: f64,
    pub min_samples: usize,
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            window: COHORT_WINDOW,
            half_life: COHORT_HALF_LIFE,
            min_samples: COHORT_MIN_SAMPLES,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CohortQuantile {
    metric: CohortMetric,
    config: CohortConfig,
    /// Oldest first.
    samples: VecDeque<f64>,
}

impl CohortQuantile {
    pub fn new(metric: CohortMetric, config: CohortConfig) -> Self {
        Self {
            metric,
            config,
            samples: VecDeque::with_capacity(config.window.min(1024)),
        }
    }

    pub fn metric(&self) -> CohortMetric {
        self.metric
    }

    /// Record a sample. Non-finite values are ignored.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.samples.len() >= self.config.window.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.samples.len() >= self.config.min_samples
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(SubstrateError::InsufficientCohortData {
                metric: self.metric.as_str(),
                samples: self.samples.len(),
                required: self.config.min_samples,
            })
        }
    }

    /// (value, weight) pairs sorted by value.
    fn weighted_sorted(&self) -> Vec<(f64, f64)> {
        let n = self.samples.len();
        let half_life = self.config.half_life.max(f64::MIN_POSITIVE);
        let mut pairs: Vec<(f64, f64)> = self
            .samples
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let age = (n - 1 - i) as f64;
                (v, 0.5f64.powf(age / half_life))
            })
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        pairs
    }

    /// Weighted quantile `q` in [0, 1].
    pub fn quantile(&self, q: f64) -> Result<f64> {
        self.ensure_ready()?;
        let q = q.clamp(0.0, 1.0);
        let pairs = self.weighted_sorted();
        let total: f64 = pairs.iter().map(|p| p.1).sum();

        let mut cumulative = 0.0;
        let mut prev: Option<(f64, f64)> = None;
        for &(value, weight) in &pairs {
            let position = (cumulative + weight / 2.0) / total;
            cumulative += weight;
            if q <= position {
                return Ok(match prev {
                    None => value,
                    Some((prev_pos, prev_value)) => {
                        let span = position - prev_pos;
                        if span <= 0.0 {
                            value
                        } else {
                            prev_value + (value - prev_value) * (q - prev_pos) / span
                        }
                    }
                });
            }
            prev = Some((position, value));
        }
        Ok(pairs.last().map(|p| p.0).unwrap_or(0.0))
    }

    pub fn median(&self) -> Result<f64> {
        self.quantile(0.5)
    }

    /// Weighted share of the cohort below `value`, counting ties as half.
    pub fn percentile_rank(&self, value: f64) -> Result<f64> {
        self.ensure_ready()?;
        let pairs = self.weighted_sorted();
        let total: f64 = pairs.iter().map(|p| p.1).sum();
        let mut below = 0.0;
        for &(v, w) in &pairs {
            if v < value {
                below += w;
            } else if v == value {
                below += w / 2.0;
            }
        }
        Ok((below / total).clamp(0.0, 1.0))
    }
}
