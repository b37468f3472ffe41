//! Workspace selection: which active clusters an entity attends to.
//!
//! Each tick, active nodes in an entity's channel are grouped into clusters,
//! scored as `total_energy × coherence × goal_alignment`, and packed greedily
//! into a fixed capacity. Losing clusters keep their energy.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{FRAME_HISTORY_LEN, PERIPHERAL_FLOOR, STABILITY_BONUS, WORKSPACE_CAPACITY};
use crate::entity::EntityRegistry;
use crate::error::{Result, SubstrateError};
use crate::graph::Graph;
use crate::ids::{EntityId, NodeId};
use crate::metrics::coherence;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub capacity: u32,
    /// Nodes above this energy are clustering candidates.
    pub peripheral_floor: f64,
    /// Score multiplier for clusters selected on the previous tick.
    pub stability_bonus: f64,
    pub frame_history: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            capacity: WORKSPACE_CAPACITY,
            peripheral_floor: PERIPHERAL_FLOOR,
            stability_bonus: STABILITY_BONUS,
            frame_history: FRAME_HISTORY_LEN,
        }
    }
}

/// Stable identity of a cluster across ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ClusterKey {
    /// Members of a live entity record.
    Entity(EntityId),
    /// Connected component of unaffiliated nodes, named by its lowest node id.
    Component(NodeId),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub node: NodeId,
    /// Channel energy, weighted by affinity for entity clusters.
    pub energy: f64,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub key: ClusterKey,
    pub members: Vec<ClusterMember>,
    pub coherence: f64,
    pub goal_alignment: f64,
}

impl Cluster {
    pub fn total_energy(&self) -> f64 {
        self.members.iter().map(|m| m.energy).sum()
    }

    pub fn size(&self) -> u32 {
        self.members.iter().map(|m| m.size).sum()
    }

    pub fn score(&self) -> f64 {
        self.total_energy() * self.coherence * self.goal_alignment
    }

    pub fn node_set(&self) -> BTreeSet<NodeId> {
        self.members.iter().map(|m| m.node).collect()
    }
}

/// External estimate of how well a cluster serves the current goal.
pub trait GoalAlignment {
    /// Opaque similarity in [0, 1].
    fn alignment(&self, graph: &Graph, members: &[ClusterMember]) -> f64;
}

/// Every cluster is fully aligned.
pub struct Unaligned;

impl GoalAlignment for Unaligned {
    fn alignment(&self, _graph: &Graph, _members: &[ClusterMember]) -> f64 {
        1.0
    }
}

/// Cosine between the mean member embedding and a goal embedding, mapped
/// from [-1, 1] to [0, 1]. Missing embeddings count as fully aligned.
pub struct EmbeddingAlignment<'a> {
    pub goal: Option<&'a [f32]>,
}

impl GoalAlignment for EmbeddingAlignment<'_> {
    fn alignment(&self, graph: &Graph, members: &[ClusterMember]) -> f64 {
        let Some(goal) = self.goal.filter(|g| !g.is_empty()) else {
            return 1.0;
        };
        let mut mean = vec![0.0f64; goal.len()];
        let mut count = 0usize;
        for m in members {
            let Some(embedding) = graph.node(m.node).and_then(|n| n.embedding.as_ref()) else {
                continue;
            };
            if embedding.len() != goal.len() {
                continue;
            }
            for (acc, &x) in mean.iter_mut().zip(embedding) {
                *acc += f64::from(x);
            }
            count += 1;
        }
        if count == 0 {
            return 1.0;
        }
        let dot: f64 = mean.iter().zip(goal).map(|(a, &b)| a * f64::from(b)).sum();
        let norm_m = mean.iter().map(|a| a * a).sum::<f64>().sqrt();
        let norm_g = goal.iter().map(|&b| f64::from(b).powi(2)).sum::<f64>().sqrt();
        if norm_m <= 0.0 || norm_g <= 0.0 {
            return 1.0;
        }
        ((dot / (norm_m * norm_g) + 1.0) / 2.0).clamp(0.0, 1.0)
    }
}

/// Group the active nodes of `channel` into candidate clusters.
pub fn identify_clusters(
    graph: &Graph,
    registry: &EntityRegistry,
    channel: EntityId,
    floor: f64,
    alignment: &dyn GoalAlignment,
) -> Vec<Cluster> {
    let active: BTreeMap<NodeId, (f64, u32)> = graph
        .nodes()
        .filter(|n| n.is_active(channel, floor))
        .map(|n| (n.id, (n.energy(channel), n.cost())))
        .collect();
    if active.is_empty() {
        return Vec::new();
    }

    let mut clusters = Vec::new();
    let mut affiliated: BTreeSet<NodeId> = BTreeSet::new();

    for entity in registry.live() {
        let members: Vec<ClusterMember> = entity
            .members
            .iter()
            .filter_map(|(node, &aff)| {
                active.get(node).map(|&(energy, size)| ClusterMember {
                    node: *node,
                    energy: energy * aff,
                    size,
                })
            })
            .filter(|m| m.energy > 0.0)
            .collect();
        if members.is_empty() {
            continue;
        }
        let set: BTreeSet<NodeId> = members.iter().map(|m| m.node).collect();
        affiliated.extend(set.iter().copied());
        clusters.push(Cluster {
            key: ClusterKey::Entity(entity.id),
            coherence: coherence(graph, &set),
            goal_alignment: alignment.alignment(graph, &members),
            members,
        });
    }

    // Connected components over open edges among unaffiliated active nodes.
    let mut unvisited: BTreeSet<NodeId> = active
        .keys()
        .filter(|n| !affiliated.contains(n))
        .copied()
        .collect();
    while let Some(start) = unvisited.pop_first() {
        let mut component = vec![start];
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            let neighbors = graph
                .outgoing_edges(node)
                .map(|e| e.target)
                .chain(graph.incoming_edges(node).map(|e| e.source));
            for next in neighbors.collect::<Vec<_>>() {
                if unvisited.remove(&next) {
                    component.push(next);
                    stack.push(next);
                }
            }
        }
        component.sort();
        let members: Vec<ClusterMember> = component
            .iter()
            .filter_map(|n| {
                active.get(n).map(|&(energy, size)| ClusterMember {
                    node: *n,
                    energy,
                    size,
                })
            })
            .collect();
        let set: BTreeSet<NodeId> = component.iter().copied().collect();
        clusters.push(Cluster {
            key: ClusterKey::Component(component[0]),
            coherence: coherence(graph, &set),
            goal_alignment: alignment.alignment(graph, &members),
            members,
        });
    }

    clusters
}

/// Nodes one entity attends to at one tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceFrame {
    pub entity: EntityId,
    pub tick: u64,
    pub nodes: BTreeSet<NodeId>,
    pub clusters: Vec<ClusterKey>,
    pub used: u32,
    pub capacity: u32,
    /// The top cluster was cut down to fit.
    pub truncated: bool,
}

impl WorkspaceFrame {
    pub fn empty(entity: EntityId, tick: u64, capacity: u32) -> Self {
        Self {
            entity,
            tick,
            capacity,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Pack `candidates` into `capacity` units.
///
/// Clusters in `resident` get the stability bonus. Whole clusters are taken
/// in score order when their not-yet-selected members fit. If the top cluster
/// alone is too big it is truncated to its highest-energy members that fit.
/// If nothing fits at all the highest-energy node that fits on its own is
/// taken alone, and if no single node fits the result is `CapacityViolation`.
pub fn select_workspace(
    entity: EntityId,
    candidates: &[Cluster],
    capacity: u32,
    resident: &BTreeSet<ClusterKey>,
    stability_bonus: f64,
) -> Result<WorkspaceFrame> {
    let mut frame = WorkspaceFrame::empty(entity, 0, capacity);
    if candidates.is_empty() {
        return Ok(frame);
    }

    let mut ranked: Vec<(f64, &Cluster)> = candidates
        .iter()
        .map(|c| {
            let bonus = if resident.contains(&c.key) {
                stability_bonus
            } else {
                1.0
            };
            (c.score() * bonus, c)
        })
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.key.cmp(&b.1.key)));

    for (rank, (_, cluster)) in ranked.iter().enumerate() {
        let extra: u32 = cluster
            .members
            .iter()
            .filter(|m| !frame.nodes.contains(&m.node))
            .map(|m| m.size)
            .sum();
        if frame.used + extra <= capacity {
            for m in &cluster.members {
                frame.nodes.insert(m.node);
            }
            frame.used += extra;
            frame.clusters.push(cluster.key);
        } else if rank == 0 {
            let mut by_energy: Vec<&ClusterMember> = cluster.members.iter().collect();
            by_energy.sort_by(|a, b| b.energy.total_cmp(&a.energy).then(a.node.cmp(&b.node)));
            for m in by_energy {
                if frame.used + m.size <= capacity {
                    frame.nodes.insert(m.node);
                    frame.used += m.size;
                }
            }
            if !frame.nodes.is_empty() {
                frame.clusters.push(cluster.key);
                frame.truncated = true;
            }
        }
    }

    if frame.nodes.is_empty() {
        let members: Vec<(ClusterKey, &ClusterMember)> = candidates
            .iter()
            .flat_map(|c| c.members.iter().map(move |m| (c.key, m)))
            .collect();
        let best = members
            .iter()
            .filter(|(_, m)| m.size <= capacity)
            .max_by(|a, b| {
                a.1.energy
                    .total_cmp(&b.1.energy)
                    .then(b.1.node.cmp(&a.1.node))
            });
        match best {
            Some(&(key, member)) => {
                frame.nodes.insert(member.node);
                frame.used = member.size;
                frame.clusters.push(key);
                frame.truncated = true;
            }
            None => {
                if let Some(needed) = members.iter().map(|(_, m)| m.size).min() {
                    return Err(SubstrateError::CapacityViolation { needed, capacity });
                }
            }
        }
    }

    Ok(frame)
}

/// Bounded ring of recent frames across all entities.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameHistory {
    limit: usize,
    frames: VecDeque<WorkspaceFrame>,
}

impl FrameHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            frames: VecDeque::new(),
        }
    }

    pub fn push(&mut self, frame: WorkspaceFrame) {
        while self.frames.len() >= self.limit {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkspaceFrame> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Per-engine selector state: the last frame per entity and frame history.
#[derive(Clone, Debug)]
pub struct WorkspaceSelector {
    pub config: WorkspaceConfig,
    current: BTreeMap<EntityId, WorkspaceFrame>,
    history: FrameHistory,
}

impl WorkspaceSelector {
    pub fn new(config: WorkspaceConfig) -> Self {
        let history = FrameHistory::new(config.frame_history);
        Self {
            config,
            current: BTreeMap::new(),
            history,
        }
    }

    /// Select and record the workspace of `entity` for `tick`. A capacity
    /// violation yields an empty frame.
    pub fn select(
        &mut self,
        graph: &Graph,
        registry: &EntityRegistry,
        entity: EntityId,
        tick: u64,
        alignment: &dyn GoalAlignment,
    ) -> WorkspaceFrame {
        let clusters = identify_clusters(
            graph,
            registry,
            entity,
            self.config.peripheral_floor,
            alignment,
        );
        let resident: BTreeSet<ClusterKey> = self
            .current
            .get(&entity)
            .map(|f| f.clusters.iter().copied().collect())
            .unwrap_or_default();

        let mut frame = match select_workspace(
            entity,
            &clusters,
            self.config.capacity,
            &resident,
            self.config.stability_bonus,
        ) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(entity = %entity, error = %e, "workspace allocation failed, using empty frame");
                WorkspaceFrame::empty(entity, tick, self.config.capacity)
            }
        };
        frame.tick = tick;
        self.history.push(frame.clone());
        self.current.insert(entity, frame.clone());
        frame
    }

    pub fn in_workspace(&self, entity: EntityId, node: NodeId) -> bool {
        self.current
            .get(&entity)
            .is_some_and(|f| f.nodes.contains(&node))
    }

    pub fn current(&self, entity: EntityId) -> Option<&WorkspaceFrame> {
        self.current.get(&entity)
    }

    pub fn history(&self) -> &FrameHistory {
        &self.history
    }

    /// Drop frame state of retired entities.
    pub fn forget(&mut self, entity: EntityId) {
        self.current.remove(&entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(id: u64, energies: &[f64], size: u32) -> Cluster {
        Cluster {
            key: ClusterKey::Component(NodeId(id * 100)),
            members: energies
                .iter()
                .enumerate()
                .map(|(i, &e)| ClusterMember {
                    node: NodeId(id * 100 + i as u64),
                    energy: e,
                    size,
                })
                .collect(),
            coherence: 1.0,
            goal_alignment: 1.0,
        }
    }

    #[test]
    fn test_empty_candidates_empty_frame() {
        let frame = select_workspace(EntityId(1), &[], 100, &BTreeSet::new(), 1.1).unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_greedy_skips_cluster_that_does_not_fit() {
        let big = cluster(1, &[0.55; 5], 17); // score 2.75, size 85
        let small = cluster(2, &[0.196; 5], 7); // score 0.98, size 35
        let frame =
            select_workspace(EntityId(1), &[small.clone(), big.clone()], 100, &BTreeSet::new(), 1.1)
                .unwrap();
        assert_eq!(frame.clusters, vec![big.key]);
        assert_eq!(frame.used, 85);
        assert_eq!(frame.nodes, big.node_set());
    }

    #[test]
    fn test_oversized_top_cluster_truncated() {
        let top = cluster(1, &[0.9, 0.5, 0.8, 0.1], 40);
        let frame = select_workspace(EntityId(1), &[top], 100, &BTreeSet::new(), 1.1).unwrap();
        assert!(frame.truncated);
        assert_eq!(frame.used, 80);
        assert_eq!(frame.nodes, BTreeSet::from([NodeId(100), NodeId(102)]));
    }

    #[test]
    fn test_stability_bonus_breaks_near_tie() {
        let a = cluster(1, &[0.50], 60);
        let b = cluster(2, &[0.52], 60);
        let resident = BTreeSet::from([a.key]);
        let frame =
            select_workspace(EntityId(1), &[a.clone(), b], 100, &resident, 1.1).unwrap();
        assert_eq!(frame.clusters, vec![a.key]);
    }

    #[test]
    fn test_shared_nodes_not_charged_twice() {
        let a = cluster(1, &[0.9, 0.9], 30);
        let mut b = cluster(2, &[0.1], 30);
        b.members.extend(a.members.clone());
        let frame = select_workspace(EntityId(1), &[a, b], 100, &BTreeSet::new(), 1.1).unwrap();
        assert_eq!(frame.used, 90);
        assert_eq!(frame.clusters.len(), 2);
    }

    #[test]
    fn test_capacity_violation_when_single_node_too_big() {
        let c = cluster(1, &[0.9], 150);
        let err = select_workspace(EntityId(1), &[c], 100, &BTreeSet::new(), 1.1).unwrap_err();
        assert_eq!(
            err,
            SubstrateError::CapacityViolation {
                needed: 150,
                capacity: 100
            }
        );
    }

    #[test]
    fn test_degenerate_single_node_fallback() {
        let top = cluster(1, &[0.3, 0.3], 150);
        let second = cluster(2, &[0.45, 0.1], 15);
        let frame =
            select_workspace(EntityId(1), &[top, second], 20, &BTreeSet::new(), 1.1).unwrap();
        assert_eq!(frame.nodes, BTreeSet::from([NodeId(200)]));
        assert_eq!(frame.used, 15);
        assert!(frame.truncated);
    }

    #[test]
    fn test_fallback_skips_oversized_nodes() {
        let top = cluster(1, &[0.9], 150);
        let second = cluster(2, &[0.3, 0.3], 15);
        let frame =
            select_workspace(EntityId(1), &[top, second], 20, &BTreeSet::new(), 1.1).unwrap();
        assert_eq!(frame.nodes, BTreeSet::from([NodeId(200)]));
        assert_eq!(frame.used, 15);
        assert_eq!(frame.clusters, vec![ClusterKey::Component(NodeId(200))]);
    }

    #[test]
    fn test_capacity_violation_when_no_node_fits() {
        let top = cluster(1, &[0.9], 150);
        let second = cluster(2, &[0.3], 40);
        let err =
            select_workspace(EntityId(1), &[top, second], 20, &BTreeSet::new(), 1.1).unwrap_err();
        assert!(matches!(
            err,
            SubstrateError::CapacityViolation { needed: 40, capacity: 20 }
        ));
    }

    #[test]
    fn test_frame_history_bounded() {
        let mut h = FrameHistory::new(3);
        for t in 0..10 {
            h.push(WorkspaceFrame::empty(EntityId(1), t, 100));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.iter().next().unwrap().tick, 7);
    }

    #[test]
    fn test_embedding_alignment_missing_is_neutral() {
        let g = Graph::new();
        let align = EmbeddingAlignment { goal: None };
        assert_eq!(align.alignment(&g, &[]), 1.0);
    }
}
