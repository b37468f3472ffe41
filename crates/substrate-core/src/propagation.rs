//! Energy propagation: diffusion, decay and Hebbian strengthening.
//!
//! A tick is computed against one read-only view of the graph and written
//! into a [`StagedTick`]. Nothing touches the graph until [`Propagator::commit`],
//! which either applies the whole stage or rejects it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    CLEANUP_THRESHOLD, DIFFUSION_FLOOR, DIFFUSION_RATE, ENERGY_CEILING, EPSILON, LEARNING_RATE,
    STRENGTHEN_THRESHOLD, WORKSPACE_DECAY_MULTIPLIER,
};
use crate::error::{RecordRef, Result, SubstrateError};
use crate::graph::Graph;
use crate::ids::{EdgeId, EntityId, NodeId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Fraction of source energy pushed along a unit-weight edge per second.
    pub diffusion_rate: f64,
    /// Nodes at or below this energy do not diffuse.
    pub diffusion_floor: f64,
    pub learning_rate: f64,
    /// Minimum accepted transfer for an edge to be strengthened.
    pub strengthen_threshold: f64,
    /// Decay multiplier for nodes in the entity's current workspace.
    pub workspace_decay_multiplier: f64,
    /// Energies below this are dropped from the node's map.
    pub cleanup_threshold: f64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            diffusion_rate: DIFFUSION_RATE,
            diffusion_floor: DIFFUSION_FLOOR,
            learning_rate: LEARNING_RATE,
            strengthen_threshold: STRENGTHEN_THRESHOLD,
            workspace_decay_multiplier: WORKSPACE_DECAY_MULTIPLIER,
            cleanup_threshold: CLEANUP_THRESHOLD,
        }
    }
}

/// Per-channel numbers from one staged tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelDiagnostics {
    pub entity: EntityId,
    pub active_nodes: usize,
    pub energy_before: f64,
    pub energy_after: f64,
    /// Transfer accepted by targets.
    pub transferred: f64,
    /// Transfer held back at the source by the soft ceiling.
    pub refunded: f64,
    pub strengthened_edges: usize,
    /// |sum after diffusion - sum before|; zero up to rounding.
    pub conservation_error: f64,
}

/// Fully computed tick, not yet applied.
#[derive(Clone, Debug, Default)]
pub struct StagedTick {
    pub dt: f64,
    /// Complete post-tick energy map for every node the tick touched.
    pub energies: BTreeMap<NodeId, BTreeMap<EntityId, f64>>,
    /// New weights for strengthened edges.
    pub weights: BTreeMap<EdgeId, f64>,
    /// Accepted transfer per edge, summed over channels.
    pub transfers: BTreeMap<EdgeId, f64>,
    pub diagnostics: Vec<ChannelDiagnostics>,
}

impl StagedTick {
    pub fn total_transferred(&self) -> f64 {
        self.diagnostics.iter().map(|d| d.transferred).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnergyChange {
    pub node: NodeId,
    pub entity: EntityId,
    pub before: f64,
    pub after: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightChange {
    pub edge: EdgeId,
    pub before: f64,
    pub after: f64,
}

/// What a commit changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitSummary {
    pub energy: Vec<EnergyChange>,
    pub weights: Vec<WeightChange>,
}

/// How lifecycle decisions move energy between channels.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelRemap {
    /// All source channels fold into `target`.
    Merge {
        sources: Vec<EntityId>,
        target: EntityId,
    },
    /// Each member node's energy follows the part it was assigned to.
    /// Energy on nodes in no part is divided evenly.
    Split {
        source: EntityId,
        parts: Vec<(EntityId, BTreeSet<NodeId>)>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct Propagator {
    pub config: PropagationConfig,
}

struct Transfer {
    edge: EdgeId,
    source: NodeId,
    target: NodeId,
    amount: f64,
}

impl Propagator {
    pub fn new(config: PropagationConfig) -> Self {
        Self { config }
    }

    /// Compute one tick for `channels` without mutating the graph.
    ///
    /// `in_workspace(entity, node)` selects the faster decay rate.
    pub fn stage<F>(
        &self,
        graph: &Graph,
        channels: &[EntityId],
        dt: f64,
        in_workspace: F,
    ) -> Result<StagedTick>
    where
        F: Fn(EntityId, NodeId) -> bool,
    {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(SubstrateError::TickAborted(format!(
                "non-positive dt {dt}"
            )));
        }

        let mut staged = StagedTick {
            dt,
            ..StagedTick::default()
        };

        for &entity in channels {
            let (next, transfers, mut diag) = self.diffuse(graph, entity, dt);

            let mut energy_after = 0.0;
            for (&node_id, &energy) in &next {
                let Some(node) = graph.node(node_id) else {
                    return Err(SubstrateError::TickAborted(format!(
                        "node {node_id} vanished during staging"
                    )));
                };
                let mut rate = node.decay_rate;
                if in_workspace(entity, node_id) {
                    rate *= self.config.workspace_decay_multiplier;
                }
                let decayed = energy * (-rate * dt).exp();
                let map = staged
                    .energies
                    .entry(node_id)
                    .or_insert_with(|| node.energies.clone());
                if decayed < self.config.cleanup_threshold {
                    map.remove(&entity);
                } else {
                    map.insert(entity, decayed.min(ENERGY_CEILING));
                    energy_after += decayed.min(ENERGY_CEILING);
                }
            }
            diag.energy_after = energy_after;

            for t in &transfers {
                *staged.transfers.entry(t.edge).or_insert(0.0) += t.amount;
                if t.amount <= self.config.strengthen_threshold {
                    continue;
                }
                let Some(edge) = graph.edge(t.edge) else {
                    continue;
                };
                let w = staged.weights.get(&t.edge).copied().unwrap_or(edge.weight);
                let grown = w + self.config.learning_rate * t.amount * (1.0 - w);
                staged.weights.insert(t.edge, grown.clamp(0.0, 1.0));
                diag.strengthened_edges += 1;
            }

            staged.diagnostics.push(diag);
        }

        Ok(staged)
    }

    /// Diffuse one channel from the current snapshot.
    fn diffuse(
        &self,
        graph: &Graph,
        entity: EntityId,
        dt: f64,
    ) -> (BTreeMap<NodeId, f64>, Vec<Transfer>, ChannelDiagnostics) {
        let snapshot: BTreeMap<NodeId, f64> = graph
            .nodes()
            .filter_map(|n| {
                let e = n.energy(entity);
                (e > 0.0).then_some((n.id, e))
            })
            .collect();

        let mut diag = ChannelDiagnostics {
            entity,
            energy_before: snapshot.values().sum(),
            ..ChannelDiagnostics::default()
        };

        let mut transfers = Vec::new();
        for (&source, &energy) in &snapshot {
            if energy <= self.config.diffusion_floor {
                continue;
            }
            diag.active_nodes += 1;
            let start = transfers.len();
            let mut total = 0.0;
            for edge in graph.outgoing_edges(source) {
                let amount = energy * edge.weight * self.config.diffusion_rate * dt;
                if amount <= 0.0 {
                    continue;
                }
                total += amount;
                transfers.push(Transfer {
                    edge: edge.id,
                    source,
                    target: edge.target,
                    amount,
                });
            }
            // A node never sends more than it holds.
            if total > energy {
                let scale = energy / total;
                for t in &mut transfers[start..] {
                    t.amount *= scale;
                }
            }
        }

        let mut incoming: HashMap<NodeId, f64> = HashMap::new();
        for t in &transfers {
            *incoming.entry(t.target).or_insert(0.0) += t.amount;
        }
        // Soft ceiling: scale what each target accepts so it cannot pass 1.0
        // even if it sends nothing. The remainder stays at the source.
        let accept: HashMap<NodeId, f64> = incoming
            .into_iter()
            .map(|(target, total)| {
                let current = snapshot.get(&target).copied().unwrap_or(0.0);
                let headroom = (ENERGY_CEILING - current).max(0.0);
                let ratio = if total > headroom {
                    headroom / total
                } else {
                    1.0
                };
                (target, ratio)
            })
            .collect();

        let mut next = snapshot.clone();
        for t in &mut transfers {
            let ratio = accept.get(&t.target).copied().unwrap_or(1.0);
            let accepted = t.amount * ratio;
            diag.refunded += t.amount - accepted;
            diag.transferred += accepted;
            t.amount = accepted;
            *next.entry(t.source).or_insert(0.0) -= accepted;
            *next.entry(t.target).or_insert(0.0) += accepted;
        }
        for e in next.values_mut() {
            if *e < 0.0 {
                *e = 0.0;
            }
        }

        let after: f64 = next.values().sum();
        diag.conservation_error = (after - diag.energy_before).abs();
        (next, transfers, diag)
    }

    /// Apply a staged tick atomically. If any touched node or edge is no
    /// longer open, nothing is applied and the tick is aborted.
    pub fn commit(&self, graph: &mut Graph, staged: StagedTick) -> Result<CommitSummary> {
        for &node in staged.energies.keys() {
            if !graph.node(node).is_some_and(|n| n.is_open()) {
                return Err(SubstrateError::TickAborted(format!(
                    "{} closed before commit",
                    RecordRef::Node(node)
                )));
            }
        }
        for &edge in staged.weights.keys() {
            if !graph.edge(edge).is_some_and(|e| e.is_open()) {
                return Err(SubstrateError::TickAborted(format!(
                    "{} closed before commit",
                    RecordRef::Edge(edge)
                )));
            }
        }

        let mut summary = CommitSummary::default();
        for (node_id, energies) in staged.energies {
            let Some(node) = graph.node_mut(node_id) else {
                continue;
            };
            let channels: BTreeSet<EntityId> =
                node.energies.keys().chain(energies.keys()).copied().collect();
            for entity in channels {
                let before = node.energy(entity);
                let after = energies.get(&entity).copied().unwrap_or(0.0);
                if (before - after).abs() > EPSILON {
                    summary.energy.push(EnergyChange {
                        node: node_id,
                        entity,
                        before,
                        after,
                    });
                }
            }
            node.energies = energies;
        }
        for (edge_id, weight) in staged.weights {
            let Some(edge) = graph.edge_mut(edge_id) else {
                continue;
            };
            summary.weights.push(WeightChange {
                edge: edge_id,
                before: edge.weight,
                after: weight,
            });
            edge.weight = weight;
        }

        debug!(
            dt = staged.dt,
            energy_changes = summary.energy.len(),
            weight_changes = summary.weights.len(),
            "tick committed"
        );
        Ok(summary)
    }

    /// Stage and commit one channel.
    pub fn tick<F>(
        &self,
        graph: &mut Graph,
        entity: EntityId,
        dt: f64,
        in_workspace: F,
    ) -> Result<CommitSummary>
    where
        F: Fn(EntityId, NodeId) -> bool,
    {
        let staged = self.stage(graph, &[entity], dt, in_workspace)?;
        self.commit(graph, staged)
    }

    /// Add external energy to one node. Returns the new energy.
    pub fn inject(
        &self,
        graph: &mut Graph,
        entity: EntityId,
        node: NodeId,
        amount: f64,
    ) -> Result<f64> {
        if !amount.is_finite() {
            return Err(SubstrateError::InvalidInput(format!(
                "injected amount {amount} is not finite"
            )));
        }
        let target = graph
            .node_mut(node)
            .ok_or(SubstrateError::StaleReference(RecordRef::Node(node)))?;
        let current = target.energy(entity);
        let next = (current + amount.clamp(0.0, 1.0)).min(ENERGY_CEILING);
        if next >= self.config.cleanup_threshold {
            target.energies.insert(entity, next);
        }
        Ok(next)
    }

    /// Move energy between channels after a merge or split.
    pub fn remap_channels(&self, graph: &mut Graph, remap: &ChannelRemap) -> CommitSummary {
        let ids: Vec<NodeId> = graph.nodes().map(|n| n.id).collect();
        let mut summary = CommitSummary::default();
        for id in ids {
            let Some(node) = graph.node_mut(id) else {
                continue;
            };
            let before = node.energies.clone();
            match remap {
                ChannelRemap::Merge { sources, target } => {
                    let moved: f64 = sources
                        .iter()
                        .filter_map(|s| node.energies.remove(s))
                        .sum();
                    if moved > 0.0 {
                        let e = node.energies.entry(*target).or_insert(0.0);
                        *e = (*e + moved).min(ENERGY_CEILING);
                    }
                }
                ChannelRemap::Split { source, parts } => {
                    let Some(moved) = node.energies.remove(source) else {
                        continue;
                    };
                    let owners: Vec<EntityId> = match parts
                        .iter()
                        .find(|(_, members)| members.contains(&id))
                    {
                        Some((owner, _)) => vec![*owner],
                        None => parts.iter().map(|(e, _)| *e).collect(),
                    };
                    if owners.is_empty() {
                        continue;
                    }
                    let share = moved / owners.len() as f64;
                    for owner in owners {
                        let e = node.energies.entry(owner).or_insert(0.0);
                        *e = (*e + share).min(ENERGY_CEILING);
                    }
                }
            }
            let channels: BTreeSet<EntityId> =
                before.keys().chain(node.energies.keys()).copied().collect();
            for entity in channels {
                let b = before.get(&entity).copied().unwrap_or(0.0);
                let a = node.energy(entity);
                if (a - b).abs() > EPSILON {
                    summary.energy.push(EnergyChange {
                        node: id,
                        entity,
                        before: b,
                        after: a,
                    });
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::EdgeSpec;
    use crate::node::NodeSpec;

    const V: EntityId = EntityId(1);

    fn chain(weight: f64, decay: f64) -> (Graph, NodeId, NodeId, EdgeId) {
        let mut g = Graph::new();
        let a = g
            .upsert_node(NodeSpec::new("a").with_decay(decay), 0, 0)
            .unwrap();
        let b = g
            .upsert_node(NodeSpec::new("b").with_decay(decay), 0, 0)
            .unwrap();
        let e = g.upsert_edge(EdgeSpec::new(a, b, weight), 0, 0).unwrap();
        (g, a, b, e)
    }

    fn never(_: EntityId, _: NodeId) -> bool {
        false
    }

    #[test]
    fn test_single_step_transfer() {
        let (mut g, a, b, _) = chain(0.8, 0.0);
        let p = Propagator::default();
        p.inject(&mut g, V, a, 0.5).unwrap();
        p.tick(&mut g, V, 1.0, never).unwrap();
        let ea = g.node(a).unwrap().energy(V);
        let eb = g.node(b).unwrap().energy(V);
        assert!((eb - 0.04).abs() < 1e-12);
        assert!((ea - 0.46).abs() < 1e-12);
    }

    #[test]
    fn test_non_positive_dt_aborts() {
        let (mut g, a, _, _) = chain(0.8, 0.0);
        let p = Propagator::default();
        p.inject(&mut g, V, a, 0.5).unwrap();
        for dt in [0.0, -1.0, f64::NAN] {
            let err = p.tick(&mut g, V, dt, never).unwrap_err();
            assert!(err.is_retryable());
        }
        assert!((g.node(a).unwrap().energy(V) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_soft_ceiling_refunds_source() {
        let (mut g, a, b, _) = chain(1.0, 0.0);
        let p = Propagator::new(PropagationConfig {
            diffusion_rate: 0.5,
            ..PropagationConfig::default()
        });
        p.inject(&mut g, V, a, 1.0).unwrap();
        p.inject(&mut g, V, b, 0.9).unwrap();
        let staged = p.stage(&g, &[V], 1.0, never).unwrap();
        let d = &staged.diagnostics[0];
        assert!((d.transferred - 0.1).abs() < 1e-12);
        assert!((d.refunded - 0.4).abs() < 1e-12);
        assert!(d.conservation_error < 1e-12);

        p.commit(&mut g, staged).unwrap();
        assert!((g.node(b).unwrap().energy(V) - 1.0).abs() < 1e-12);
        assert!((g.node(a).unwrap().energy(V) - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_outflow_limited_to_source_energy() {
        let mut g = Graph::new();
        let hub = g.upsert_node(NodeSpec::new("hub").with_decay(0.0), 0, 0).unwrap();
        for i in 0..20 {
            let leaf = g
                .upsert_node(NodeSpec::new(format!("leaf{i}")).with_decay(0.0), 0, 0)
                .unwrap();
            g.upsert_edge(EdgeSpec::new(hub, leaf, 1.0), 0, 0).unwrap();
        }
        let p = Propagator::new(PropagationConfig {
            diffusion_rate: 1.0,
            ..PropagationConfig::default()
        });
        p.inject(&mut g, V, hub, 0.5).unwrap();
        p.tick(&mut g, V, 1.0, never).unwrap();
        assert!(g.node(hub).unwrap().energy(V) < 1e-9);
        let total: f64 = g.nodes().map(|n| n.energy(V)).sum();
        assert!((total - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_workspace_nodes_decay_faster() {
        let mut g = Graph::new();
        let a = g.upsert_node(NodeSpec::new("a").with_decay(0.1), 0, 0).unwrap();
        let b = g.upsert_node(NodeSpec::new("b").with_decay(0.1), 0, 0).unwrap();
        let p = Propagator::default();
        p.inject(&mut g, V, a, 0.5).unwrap();
        p.inject(&mut g, V, b, 0.5).unwrap();
        p.tick(&mut g, V, 1.0, |_, n| n == a).unwrap();
        assert!(g.node(a).unwrap().energy(V) < g.node(b).unwrap().energy(V));
    }

    #[test]
    fn test_strengthening_soft_clamp() {
        let (mut g, a, _, e) = chain(0.99, 0.0);
        let p = Propagator::new(PropagationConfig {
            learning_rate: 50.0,
            diffusion_rate: 1.0,
            ..PropagationConfig::default()
        });
        p.inject(&mut g, V, a, 1.0).unwrap();
        p.tick(&mut g, V, 1.0, never).unwrap();
        let w = g.edge(e).unwrap().weight;
        assert!(w > 0.99 && w <= 1.0);
    }

    #[test]
    fn test_small_transfer_does_not_strengthen() {
        let (mut g, a, _, e) = chain(0.1, 0.0);
        let p = Propagator::default();
        p.inject(&mut g, V, a, 0.5).unwrap();
        let summary = p.tick(&mut g, V, 1.0, never).unwrap();
        assert!(summary.weights.is_empty());
        assert!((g.edge(e).unwrap().weight - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_cleanup_drops_tiny_energy() {
        let mut g = Graph::new();
        let a = g.upsert_node(NodeSpec::new("a").with_decay(10.0), 0, 0).unwrap();
        let p = Propagator::default();
        p.inject(&mut g, V, a, 0.5).unwrap();
        p.tick(&mut g, V, 1.0, never).unwrap();
        assert!(g.node(a).unwrap().energies.is_empty());
    }

    #[test]
    fn test_commit_rejects_closed_node() {
        let (mut g, a, b, _) = chain(0.8, 0.0);
        let p = Propagator::default();
        p.inject(&mut g, V, a, 0.5).unwrap();
        let staged = p.stage(&g, &[V], 1.0, never).unwrap();
        g.close_node(b, 5).unwrap();
        let err = p.commit(&mut g, staged).unwrap_err();
        assert!(matches!(err, SubstrateError::TickAborted(_)));
        assert!((g.node(a).unwrap().energy(V) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_inject_clamps_and_rejects_closed() {
        let (mut g, a, b, _) = chain(0.8, 0.0);
        let p = Propagator::default();
        assert!((p.inject(&mut g, V, a, 5.0).unwrap() - 1.0).abs() < 1e-12);
        assert!((p.inject(&mut g, V, a, 0.3).unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(p.inject(&mut g, V, a, -2.0).unwrap(), 1.0);
        g.close_node(b, 1).unwrap();
        assert!(matches!(
            p.inject(&mut g, V, b, 0.1),
            Err(SubstrateError::StaleReference(_))
        ));
    }

    #[test]
    fn test_channels_are_independent() {
        let (mut g, a, b, _) = chain(0.8, 0.0);
        let p = Propagator::default();
        let w = EntityId(2);
        p.inject(&mut g, V, a, 0.5).unwrap();
        p.inject(&mut g, w, b, 0.2).unwrap();
        p.tick(&mut g, V, 1.0, never).unwrap();
        assert!((g.node(b).unwrap().energy(w) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_remap_merge_and_split() {
        let (mut g, a, b, _) = chain(0.8, 0.0);
        let p = Propagator::default();
        let (x, y, m) = (EntityId(1), EntityId(2), EntityId(3));
        p.inject(&mut g, x, a, 0.4).unwrap();
        p.inject(&mut g, y, a, 0.3).unwrap();
        p.remap_channels(
            &mut g,
            &ChannelRemap::Merge {
                sources: vec![x, y],
                target: m,
            },
        );
        assert!((g.node(a).unwrap().energy(m) - 0.7).abs() < 1e-12);
        assert_eq!(g.node(a).unwrap().energy(x), 0.0);

        p.inject(&mut g, m, b, 0.2).unwrap();
        let (s1, s2) = (EntityId(4), EntityId(5));
        p.remap_channels(
            &mut g,
            &ChannelRemap::Split {
                source: m,
                parts: vec![(s1, BTreeSet::from([a])), (s2, BTreeSet::new())],
            },
        );
        assert!((g.node(a).unwrap().energy(s1) - 0.7).abs() < 1e-12);
        assert!((g.node(b).unwrap().energy(s1) - 0.1).abs() < 1e-12);
        assert!((g.node(b).unwrap().energy(s2) - 0.1).abs() < 1e-12);
    }
}
