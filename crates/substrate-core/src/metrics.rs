//! Pairwise entity metrics and the composite redundancy/usefulness scores.
//!
//! All metrics are computed on demand from the graph, the member maps and
//! the frame history. Nothing here is cached.
//!
//! - J: member-set Jaccard
//! - C: among union members active in either channel, the share active in both
//! - U: among frames where either entity appears, the share where both do
//! - H: normalized entropy of affinity mass over (only A, shared, only B)
//! - ΔCtx: 1 - cosine of affinity-weighted one-hop neighbor vectors

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::graph::Graph;
use crate::ids::{EntityId, NodeId};
use crate::workspace::FrameHistory;

/// Numerically stable `ln(1 + e^x)`.
pub fn softplus(x: f64) -> f64 {
    if x > 30.0 { x } else { x.exp().ln_1p() }
}

pub fn jaccard(a: &BTreeSet<NodeId>, b: &BTreeSet<NodeId>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Internal edge density: distinct connected pairs over possible pairs.
/// A single node is perfectly coherent; an empty set is not.
pub fn coherence(graph: &Graph, members: &BTreeSet<NodeId>) -> f64 {
    let n = members.len();
    match n {
        0 => return 0.0,
        1 => return 1.0,
        _ => {}
    }
    let mut pairs: BTreeSet<(NodeId, NodeId)> = BTreeSet::new();
    for &node in members {
        for edge in graph.outgoing_edges(node) {
            if edge.target != node && members.contains(&edge.target) {
                pairs.insert((node.min(edge.target), node.max(edge.target)));
            }
        }
    }
    let possible = (n * (n - 1) / 2) as f64;
    pairs.len() as f64 / possible
}

/// One side of a pairwise comparison.
#[derive(Clone, Copy, Debug)]
pub struct MemberView<'a> {
    pub members: &'a BTreeMap<NodeId, f64>,
    /// Energy channel used for co-activation; `None` for a proposal that
    /// has no channel yet.
    pub channel: Option<EntityId>,
}

impl<'a> MemberView<'a> {
    pub fn new(members: &'a BTreeMap<NodeId, f64>, channel: Option<EntityId>) -> Self {
        Self { members, channel }
    }

    fn set(&self) -> BTreeSet<NodeId> {
        self.members.keys().copied().collect()
    }

    fn is_active(&self, graph: &Graph, node: NodeId, floor: f64) -> bool {
        self.channel.is_some_and(|c| {
            graph
                .node(node)
                .is_some_and(|n| n.is_open() && n.is_active(c, floor))
        })
    }
}

pub fn coactivation(graph: &Graph, a: MemberView<'_>, b: MemberView<'_>, floor: f64) -> f64 {
    let union: BTreeSet<NodeId> = a.set().union(&b.set()).copied().collect();
    let mut either = 0usize;
    let mut both = 0usize;
    for node in union {
        let in_a = a.is_active(graph, node, floor);
        let in_b = b.is_active(graph, node, floor);
        if in_a || in_b {
            either += 1;
        }
        if in_a && in_b {
            both += 1;
        }
    }
    if either == 0 {
        0.0
    } else {
        both as f64 / either as f64
    }
}

pub fn cooccurrence(history: &FrameHistory, a: MemberView<'_>, b: MemberView<'_>) -> f64 {
    let mut either = 0usize;
    let mut both = 0usize;
    for frame in history.iter() {
        let in_a = frame.nodes.iter().any(|n| a.members.contains_key(n));
        let in_b = frame.nodes.iter().any(|n| b.members.contains_key(n));
        if in_a || in_b {
            either += 1;
        }
        if in_a && in_b {
            both += 1;
        }
    }
    if either == 0 {
        0.0
    } else {
        both as f64 / either as f64
    }
}

pub fn membership_entropy(a: MemberView<'_>, b: MemberView<'_>) -> f64 {
    let mut only_a = 0.0;
    let mut only_b = 0.0;
    let mut shared = 0.0;
    for (node, &aff) in a.members {
        match b.members.get(node) {
            Some(&other) => shared += aff + other,
            None => only_a += aff,
        }
    }
    for (node, &aff) in b.members {
        if !a.members.contains_key(node) {
            only_b += aff;
        }
    }
    let total = only_a + only_b + shared;
    if total <= 0.0 {
        return 0.0;
    }
    let h: f64 = [only_a, shared, only_b]
        .iter()
        .filter(|&&m| m > 0.0)
        .map(|&m| {
            let p = m / total;
            -p * p.ln()
        })
        .sum();
    h / 3f64.ln()
}

fn context_vector(graph: &Graph, view: MemberView<'_>) -> HashMap<NodeId, f64> {
    let mut v = HashMap::new();
    for (&node, &aff) in view.members {
        for edge in graph.outgoing_edges(node) {
            *v.entry(edge.target).or_insert(0.0) += aff * edge.weight;
        }
        for edge in graph.incoming_edges(node) {
            *v.entry(edge.source).or_insert(0.0) += aff * edge.weight;
        }
    }
    v
}

pub fn context_divergence(graph: &Graph, a: MemberView<'_>, b: MemberView<'_>) -> f64 {
    let va = context_vector(graph, a);
    let vb = context_vector(graph, b);
    let norm_a = va.values().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = vb.values().map(|x| x * x).sum::<f64>().sqrt();
    match (norm_a > 0.0, norm_b > 0.0) {
        (false, false) => 0.0,
        (true, false) | (false, true) => 1.0,
        (true, true) => {
            let dot: f64 = va
                .iter()
                .filter_map(|(k, x)| vb.get(k).map(|y| x * y))
                .sum();
            (1.0 - dot / (norm_a * norm_b)).clamp(0.0, 1.0)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PairMetrics {
    pub jaccard: f64,
    pub coactivation: f64,
    pub cooccurrence: f64,
    pub entropy: f64,
    pub context_divergence: f64,
}

/// `s_red` is high for near-duplicates, `s_use` for complementary pairs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PairScores {
    pub s_red: f64,
    pub s_use: f64,
}

impl PairMetrics {
    pub fn compute(
        graph: &Graph,
        history: &FrameHistory,
        a: MemberView<'_>,
        b: MemberView<'_>,
        floor: f64,
    ) -> Self {
        Self {
            jaccard: jaccard(&a.set(), &b.set()),
            coactivation: coactivation(graph, a, b, floor),
            cooccurrence: cooccurrence(history, a, b),
            entropy: membership_entropy(a, b),
            context_divergence: context_divergence(graph, a, b),
        }
    }

    pub fn scores(&self) -> PairScores {
        let overlap = self.jaccard + self.coactivation;
        let spread = softplus(self.entropy + self.context_divergence);
        PairScores {
            s_red: softplus(overlap + self.cooccurrence) - spread,
            s_use: spread - softplus(overlap),
        }
    }
}
