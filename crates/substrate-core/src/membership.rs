//! Member affinity learning from co-activation.
//!
//! Every tick each active entity channel is observed. A node's co-activation
//! strength is its channel energy relative to the channel peak, or zero when
//! it sits below the activity floor. Strengths feed one moving average per
//! (entity, node). During a lifecycle scan, averages with enough observations
//! are pushed into a cohort and compared against its admit and prune
//! quantiles:
//!
//! - a member above the admit quantile moves toward its average,
//! - a member below the prune quantile moves down and leaves below the floor,
//! - a non-member above the admit quantile joins at a weak affinity.
//!
//! Traces are runtime state; a restored partition relearns them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cohort::CohortQuantile;
use crate::constants::{CLEANUP_THRESHOLD, EPSILON, REDIRECT_AFFINITY};
use crate::entity::{EntityRegistry, MembershipChange};
use crate::error::Result;
use crate::graph::Graph;
use crate::ids::{EntityId, NodeId};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Smoothing of the per-node co-activation average.
    pub ema_alpha: f64,
    /// Fraction of the gap to the average closed per adjustment.
    pub learning_rate: f64,
    pub admit_quantile: f64,
    pub prune_quantile: f64,
    /// Observations a trace needs before it can move a weight.
    pub min_observations: u32,
    /// Ticks between two adjustments of the same member.
    pub cooldown_ticks: u64,
    /// Members whose weight would fall below this are removed.
    pub prune_floor: f64,
    /// Ceiling on the weight a newly admitted node starts with.
    pub admit_affinity: f64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.1,
            learning_rate: 0.1,
            admit_quantile: 0.7,
            prune_quantile: 0.3,
            min_observations: 30,
            cooldown_ticks: 100,
            prune_floor: 0.05,
            admit_affinity: REDIRECT_AFFINITY,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Trace {
    pub average: f64,
    pub observations: u32,
    pub last_adjusted: Option<u64>,
}

/// Weight changes for one entity, with the cohort cut points that justified them.
#[derive(Clone, Debug, PartialEq)]
pub struct Adjustment {
    pub entity: EntityId,
    pub changes: Vec<MembershipChange>,
    pub admit_threshold: f64,
    pub prune_threshold: f64,
}

#[derive(Clone, Debug, Default)]
pub struct MembershipLearner {
    config: MembershipConfig,
    traces: BTreeMap<EntityId, BTreeMap<NodeId, Trace>>,
    observed: u64,
}

impl MembershipLearner {
    pub fn new(config: MembershipConfig) -> Self {
        Self {
            config,
            traces: BTreeMap::new(),
            observed: 0,
        }
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub fn trace(&self, entity: EntityId, node: NodeId) -> Option<&Trace> {
        self.traces.get(&entity)?.get(&node)
    }

    /// Fold the current channel energies into the traces.
    pub fn observe(&mut self, graph: &Graph, registry: &EntityRegistry, activity_floor: f64) {
        self.observed += 1;
        let learning: BTreeSet<EntityId> = registry
            .live()
            .filter(|e| e.policy().accepts_members && e.policy().accepts_energy)
            .map(|e| e.id)
            .collect();
        self.traces.retain(|id, _| learning.contains(id));

        let alpha = self.config.ema_alpha.clamp(0.0, 1.0);
        for entity in registry.live().filter(|e| learning.contains(&e.id)) {
            let active: BTreeMap<NodeId, f64> = graph
                .nodes()
                .filter_map(|n| {
                    let e = n.energy(entity.id);
                    (e > activity_floor).then_some((n.id, e))
                })
                .collect();
            // A quiet channel says nothing about its members.
            let Some(peak) = active.values().copied().max_by(f64::total_cmp) else {
                continue;
            };

            let traces = self.traces.entry(entity.id).or_default();
            for &node in entity.members.keys().chain(active.keys()) {
                traces.entry(node).or_default();
            }
            traces.retain(|node, trace| {
                let strength = active.get(node).map_or(0.0, |e| e / peak);
                trace.average += alpha * (strength - trace.average);
                trace.observations = trace.observations.saturating_add(1);
                entity.members.contains_key(node) || trace.average > CLEANUP_THRESHOLD
            });
        }
    }

    /// Feed eligible averages into `cohort` and derive weight changes from
    /// its quantiles. Errors while the cohort is too small.
    pub fn propose(
        &mut self,
        registry: &EntityRegistry,
        cohort: &mut CohortQuantile,
    ) -> Result<Vec<Adjustment>> {
        let config = self.config;
        let now = self.observed;
        let eligible = |t: &Trace| {
            t.observations >= config.min_observations
                && t.last_adjusted
                    .is_none_or(|last| now.saturating_sub(last) >= config.cooldown_ticks)
        };

        let mut any = false;
        for trace in self.traces.values().flat_map(|t| t.values()).filter(|t| eligible(*t)) {
            cohort.push(trace.average);
            any = true;
        }
        if !any {
            return Ok(Vec::new());
        }
        let admit = cohort.quantile(config.admit_quantile)?;
        let prune = cohort.quantile(config.prune_quantile)?;

        let mut out = Vec::new();
        for (&id, traces) in &mut self.traces {
            let Some(entity) = registry
                .get(id)
                .filter(|e| e.is_live() && e.policy().accepts_members)
            else {
                continue;
            };
            let mut remaining = entity.members.len();
            let mut changes = Vec::new();
            for (&node, trace) in traces.iter_mut() {
                if !eligible(&*trace) {
                    continue;
                }
                let avg = trace.average;
                let before = entity.members.get(&node).copied();
                let after = match before {
                    Some(w) if avg > admit && avg > w => {
                        Some(w + config.learning_rate * (avg - w))
                    }
                    Some(w) if avg < prune && avg < w => {
                        let lowered = w + config.learning_rate * (avg - w);
                        if lowered >= config.prune_floor {
                            Some(lowered)
                        } else if remaining > 1 {
                            remaining -= 1;
                            None
                        } else {
                            Some(config.prune_floor.min(w))
                        }
                    }
                    None if avg > admit => Some(avg.min(config.admit_affinity)),
                    _ => continue,
                };
                let after = after.map(|w| w.clamp(0.0, 1.0));
                if let (Some(b), Some(a)) = (before, after)
                    && (a - b).abs() <= EPSILON
                {
                    continue;
                }
                trace.last_adjusted = Some(now);
                changes.push(MembershipChange { node, before, after });
            }
            if !changes.is_empty() {
                out.push(Adjustment {
                    entity: id,
                    changes,
                    admit_threshold: admit,
                    prune_threshold: prune,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::{CohortConfig, CohortMetric};
    use crate::entity::{LifecycleState, Provenance};
    use crate::node::NodeSpec;
    use crate::propagation::{PropagationConfig, Propagator};

    fn quick() -> MembershipConfig {
        MembershipConfig {
            ema_alpha: 0.5,
            min_observations: 2,
            cooldown_ticks: 0,
            ..MembershipConfig::default()
        }
    }

    fn cohort() -> CohortQuantile {
        CohortQuantile::new(
            CohortMetric::Coactivation,
            CohortConfig {
                window: 256,
                half_life: 1e9,
                min_samples: 4,
            },
        )
    }

    fn setup(weights: &[f64]) -> (Graph, EntityRegistry, EntityId, Vec<NodeId>) {
        let mut g = Graph::new();
        let ids: Vec<NodeId> = (0..weights.len())
            .map(|i| g.upsert_node(NodeSpec::new(format!("n{i}")), 0, 0).unwrap())
            .collect();
        let mut reg = EntityRegistry::new();
        let members = ids.iter().copied().zip(weights.iter().copied()).collect();
        let id = reg
            .create(
                "topic".into(),
                members,
                1.0,
                LifecycleState::Provisional,
                Provenance::Created,
                0,
            )
            .id;
        (g, reg, id, ids)
    }

    #[test]
    fn test_quiet_channel_is_not_observed() {
        let (g, reg, id, ids) = setup(&[1.0, 1.0]);
        let mut learner = MembershipLearner::new(quick());
        learner.observe(&g, &reg, 0.01);
        assert!(learner.trace(id, ids[0]).is_none());
    }

    #[test]
    fn test_average_tracks_relative_energy() {
        let (mut g, reg, id, ids) = setup(&[1.0, 1.0]);
        let p = Propagator::new(PropagationConfig::default());
        p.inject(&mut g, id, ids[0], 0.8).unwrap();
        p.inject(&mut g, id, ids[1], 0.4).unwrap();
        let mut learner = MembershipLearner::new(quick());
        learner.observe(&g, &reg, 0.01);
        let top = learner.trace(id, ids[0]).unwrap();
        let half = learner.trace(id, ids[1]).unwrap();
        assert!((top.average - 0.5).abs() < 1e-12);
        assert!((half.average - 0.25).abs() < 1e-12);
        assert_eq!(top.observations, 1);
    }

    #[test]
    fn test_propose_errors_until_cohort_ready() {
        let (mut g, reg, id, ids) = setup(&[1.0]);
        let p = Propagator::new(PropagationConfig::default());
        p.inject(&mut g, id, ids[0], 0.8).unwrap();
        let mut learner = MembershipLearner::new(quick());
        for _ in 0..2 {
            learner.observe(&g, &reg, 0.01);
        }
        let err = learner.propose(&reg, &mut cohort()).unwrap_err();
        assert!(err.is_deferral());
    }

    #[test]
    fn test_weak_member_pruned_but_last_member_kept() {
        let (mut g, reg, id, ids) = setup(&[1.0, 1.0, 1.0, 1.0, 0.06]);
        let p = Propagator::new(PropagationConfig::default());
        for &n in &ids[..4] {
            p.inject(&mut g, id, n, 0.8).unwrap();
        }
        let mut learner = MembershipLearner::new(MembershipConfig {
            learning_rate: 0.5,
            ..quick()
        });
        let mut c = cohort();
        for _ in 0..4 {
            c.push(0.5);
        }
        for _ in 0..3 {
            learner.observe(&g, &reg, 0.01);
        }
        let out = learner.propose(&reg, &mut c).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].changes,
            vec![MembershipChange {
                node: ids[4],
                before: Some(0.06),
                after: None,
            }]
        );
    }
}
