//! Bitemporal graph partition for one tenant.
//!
//! Holds the current version of every node and edge plus superseded
//! versions. Key, edge and adjacency indexes cover open records only and are
//! rebuilt whenever a partition is loaded from a snapshot.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::bitemporal::{AsOf, Bitemporal};
use crate::edge::{Edge, EdgeKind, EdgeSpec};
use crate::error::{RecordRef, Result, SubstrateError};
use crate::ids::{EdgeId, IdAllocator, NodeId};
use crate::node::{Node, NodeSpec};
use crate::time::Timestamp;

/// Which side of an edge a neighbor sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// One hop away from a node over an open edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub node: NodeId,
    pub edge: EdgeId,
    pub kind: EdgeKind,
    pub weight: f64,
    pub direction: Direction,
}

/// Serializable form of a partition: current versions plus history.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub node_history: Vec<Node>,
    pub edge_history: Vec<Edge>,
}

#[derive(Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    node_history: Vec<Node>,
    edge_history: Vec<Edge>,
    node_ids: IdAllocator,
    edge_ids: IdAllocator,

    keys: HashMap<String, NodeId>,
    edge_index: HashMap<(NodeId, NodeId, EdgeKind), EdgeId>,
    outgoing: HashMap<NodeId, Vec<EdgeId>>,
    incoming: HashMap<NodeId, Vec<EdgeId>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a partition from persisted versions.
    pub fn from_parts(
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        node_history: Vec<Node>,
        edge_history: Vec<Edge>,
    ) -> Self {
        let mut graph = Self::new();
        for n in nodes.iter().chain(node_history.iter()) {
            graph.node_ids.observe(n.id.raw());
        }
        for e in edges.iter().chain(edge_history.iter()) {
            graph.edge_ids.observe(e.id.raw());
        }
        graph.nodes = nodes.into_iter().map(|n| (n.id, n)).collect();
        graph.edges = edges.into_iter().map(|e| (e.id, e)).collect();
        graph.node_history = node_history;
        graph.edge_history = edge_history;
        graph.rebuild_indexes();
        graph
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        Self::from_parts(
            snapshot.nodes,
            snapshot.edges,
            snapshot.node_history,
            snapshot.edge_history,
        )
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
            node_history: self.node_history.clone(),
            edge_history: self.edge_history.clone(),
        }
    }

    fn rebuild_indexes(&mut self) {
        self.keys.clear();
        self.edge_index.clear();
        self.outgoing.clear();
        self.incoming.clear();

        for node in self.nodes.values().filter(|n| n.is_open()) {
            self.keys.insert(node.key.clone(), node.id);
        }
        for edge in self.edges.values().filter(|e| e.is_open()) {
            self.edge_index
                .insert((edge.source, edge.target, edge.kind), edge.id);
            self.outgoing.entry(edge.source).or_default().push(edge.id);
            self.incoming.entry(edge.target).or_default().push(edge.id);
        }
    }

    /// Create or supersede the node registered under `spec.key`.
    ///
    /// A key whose node was closed is bound to a fresh node id.
    pub fn upsert_node(
        &mut self,
        spec: NodeSpec,
        valid_from: Timestamp,
        recorded_at: Timestamp,
    ) -> Result<NodeId> {
        validate_node_spec(&spec)?;
        let mut spec = spec;
        if spec.label.is_empty() {
            spec.label = spec.key.clone();
        }

        if let Some(&id) = self.keys.get(&spec.key)
            && let Some(current) = self.nodes.get_mut(&id)
            && current.is_open()
        {
            let mut retired = current.clone();
            retired.temporal.supersede(recorded_at);
            self.node_history.push(retired);

            current.label = spec.label;
            current.base_weight = spec.base_weight;
            current.decay_rate = spec.decay_rate;
            current.size = spec.size;
            current.embedding = spec.embedding;
            current.temporal = Bitemporal::open(valid_from, recorded_at);
            return Ok(id);
        }

        let id = NodeId(self.node_ids.next_raw());
        let node = Node {
            id,
            label: spec.label,
            key: spec.key,
            energies: BTreeMap::new(),
            base_weight: spec.base_weight,
            decay_rate: spec.decay_rate,
            size: spec.size,
            embedding: spec.embedding,
            temporal: Bitemporal::open(valid_from, recorded_at),
        };
        self.keys.insert(node.key.clone(), id);
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Create an edge, or supersede the open edge with the same endpoints
    /// and kind. The weight of an existing edge is never overwritten.
    pub fn upsert_edge(
        &mut self,
        spec: EdgeSpec,
        valid_from: Timestamp,
        recorded_at: Timestamp,
    ) -> Result<EdgeId> {
        if !(0.0..=1.0).contains(&spec.weight) {
            return Err(SubstrateError::InvalidInput(format!(
                "edge weight {} outside [0, 1]",
                spec.weight
            )));
        }
        for endpoint in [spec.source, spec.target] {
            if !self.nodes.get(&endpoint).is_some_and(Node::is_open) {
                return Err(SubstrateError::StaleReference(RecordRef::Node(endpoint)));
            }
        }

        let index_key = (spec.source, spec.target, spec.kind);
        if let Some(&id) = self.edge_index.get(&index_key)
            && let Some(current) = self.edges.get_mut(&id)
        {
            let mut retired = current.clone();
            retired.temporal.supersede(recorded_at);
            self.edge_history.push(retired);

            current.valence = spec.valence;
            current.temporal = Bitemporal::open(valid_from, recorded_at);
            return Ok(id);
        }

        let id = EdgeId(self.edge_ids.next_raw());
        self.edges.insert(
            id,
            Edge {
                id,
                source: spec.source,
                target: spec.target,
                kind: spec.kind,
                weight: spec.weight,
                valence: spec.valence,
                temporal: Bitemporal::open(valid_from, recorded_at),
            },
        );
        self.edge_index.insert(index_key, id);
        self.outgoing.entry(spec.source).or_default().push(id);
        self.incoming.entry(spec.target).or_default().push(id);
        Ok(id)
    }

    /// The version of `id` selected by `as_of`. Pure: never mutates.
    pub fn get_node(&self, id: NodeId, as_of: AsOf) -> Option<&Node> {
        if let Some(current) = self.nodes.get(&id)
            && current.temporal.matches(as_of)
        {
            return Some(current);
        }
        self.node_history
            .iter()
            .rev()
            .find(|n| n.id == id && n.temporal.matches(as_of))
    }

    pub fn get_edge(&self, id: EdgeId, as_of: AsOf) -> Option<&Edge> {
        if let Some(current) = self.edges.get(&id)
            && current.temporal.matches(as_of)
        {
            return Some(current);
        }
        self.edge_history
            .iter()
            .rev()
            .find(|e| e.id == id && e.temporal.matches(as_of))
    }

    /// Current version regardless of closure.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    /// Open node currently bound to `key`.
    pub fn node_by_key(&self, key: &str) -> Option<NodeId> {
        self.keys.get(key).copied()
    }

    /// Resolve a key or fail with `UnknownNode`.
    pub fn resolve(&self, key: &str) -> Result<NodeId> {
        self.node_by_key(key)
            .ok_or_else(|| SubstrateError::UnknownNode(key.to_string()))
    }

    /// Open neighbors of an open node, optionally filtered by edge kind.
    pub fn query_neighbors(&self, id: NodeId, kind: Option<EdgeKind>) -> Result<Vec<Neighbor>> {
        if !self.nodes.get(&id).is_some_and(Node::is_open) {
            return Err(SubstrateError::StaleReference(RecordRef::Node(id)));
        }
        let wanted = |e: &&Edge| kind.is_none_or(|k| e.kind == k);
        let mut out: Vec<Neighbor> = self
            .outgoing_edges(id)
            .filter(wanted)
            .map(|e| Neighbor {
                node: e.target,
                edge: e.id,
                kind: e.kind,
                weight: e.weight,
                direction: Direction::Outgoing,
            })
            .collect();
        out.extend(self.incoming_edges(id).filter(wanted).map(|e| Neighbor {
            node: e.source,
            edge: e.id,
            kind: e.kind,
            weight: e.weight,
            direction: Direction::Incoming,
        }));
        Ok(out)
    }

    /// Soft-delete a node and every open edge touching it.
    /// Returns the edges closed along with it.
    pub fn close_node(&mut self, id: NodeId, at: Timestamp) -> Result<Vec<EdgeId>> {
        let node = self
            .nodes
            .get_mut(&id)
            .filter(|n| n.is_open())
            .ok_or(SubstrateError::StaleReference(RecordRef::Node(id)))?;
        node.temporal.close(at);
        let key = node.key.clone();
        if self.keys.get(&key) == Some(&id) {
            self.keys.remove(&key);
        }

        let incident: Vec<EdgeId> = self
            .outgoing
            .get(&id)
            .into_iter()
            .chain(self.incoming.get(&id))
            .flatten()
            .copied()
            .collect();
        let mut closed = Vec::new();
        for edge_id in incident {
            if self.close_edge(edge_id, at).is_ok() {
                closed.push(edge_id);
            }
        }
        Ok(closed)
    }

    pub fn close_edge(&mut self, id: EdgeId, at: Timestamp) -> Result<()> {
        let edge = self
            .edges
            .get_mut(&id)
            .filter(|e| e.is_open())
            .ok_or(SubstrateError::StaleReference(RecordRef::Edge(id)))?;
        edge.temporal.close(at);
        let (source, target, kind) = (edge.source, edge.target, edge.kind);
        self.edge_index.remove(&(source, target, kind));
        if let Some(list) = self.outgoing.get_mut(&source) {
            list.retain(|e| *e != id);
        }
        if let Some(list) = self.incoming.get_mut(&target) {
            list.retain(|e| *e != id);
        }
        Ok(())
    }

    /// Close a node or an edge. Entities are retired only by the lifecycle
    /// manager.
    pub fn close_record(&mut self, record: RecordRef, at: Timestamp) -> Result<()> {
        match record {
            RecordRef::Node(id) => self.close_node(id, at).map(|_| ()),
            RecordRef::Edge(id) => self.close_edge(id, at),
            RecordRef::Entity(id) => Err(SubstrateError::InvalidInput(format!(
                "entity {id} cannot be closed through the graph"
            ))),
        }
    }

    /// Open outgoing edges of `id` whose target is also open.
    pub fn outgoing_edges(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.adjacent(&self.outgoing, id)
            .filter(|e| self.nodes.get(&e.target).is_some_and(Node::is_open))
    }

    /// Open incoming edges of `id` whose source is also open.
    pub fn incoming_edges(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.adjacent(&self.incoming, id)
            .filter(|e| self.nodes.get(&e.source).is_some_and(Node::is_open))
    }

    fn adjacent<'a>(
        &'a self,
        index: &'a HashMap<NodeId, Vec<EdgeId>>,
        id: NodeId,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        index
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|eid| self.edges.get(eid))
            .filter(|e| e.is_open())
    }

    /// All open nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.is_open())
    }

    /// All open edges in id order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values().filter(|e| e.is_open())
    }

    /// Every current version, open or closed.
    pub fn current_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn current_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn node_history(&self) -> &[Node] {
        &self.node_history
    }

    pub fn edge_history(&self) -> &[Edge] {
        &self.edge_history
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn edge_count(&self) -> usize {
        self.edges().count()
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id).filter(|n| n.is_open())
    }

    pub(crate) fn edge_mut(&mut self, id: EdgeId) -> Option<&mut Edge> {
        self.edges.get_mut(&id).filter(|e| e.is_open())
    }
}

fn validate_node_spec(spec: &NodeSpec) -> Result<()> {
    if spec.key.is_empty() {
        return Err(SubstrateError::InvalidInput("node key is empty".into()));
    }
    if !(0.0..=1.0).contains(&spec.base_weight) {
        return Err(SubstrateError::InvalidInput(format!(
            "base_weight {} outside [0, 1]",
            spec.base_weight
        )));
    }
    if !spec.decay_rate.is_finite() || spec.decay_rate < 0.0 {
        return Err(SubstrateError::InvalidInput(format!(
            "decay_rate {} must be finite and non-negative",
            spec.decay_rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_pair() -> (Graph, NodeId, NodeId, EdgeId) {
        let mut g = Graph::new();
        let a = g.upsert_node(NodeSpec::new("a"), 0, 10).unwrap();
        let b = g.upsert_node(NodeSpec::new("b"), 0, 10).unwrap();
        let e = g.upsert_edge(EdgeSpec::new(a, b, 0.8), 0, 10).unwrap();
        (g, a, b, e)
    }

    #[test]
    fn test_upsert_same_key_supersedes() {
        let mut g = Graph::new();
        let id = g.upsert_node(NodeSpec::new("a"), 0, 10).unwrap();
        let mut spec = NodeSpec::new("a");
        spec.label = "renamed".into();
        let again = g.upsert_node(spec, 0, 20).unwrap();
        assert_eq!(id, again);
        assert_eq!(g.node_history().len(), 1);

        assert_eq!(g.get_node(id, AsOf::at(15)).unwrap().label, "a");
        assert_eq!(g.get_node(id, AsOf::at(25)).unwrap().label, "renamed");
        assert!(g.get_node(id, AsOf::at(5)).is_none());
    }

    #[test]
    fn test_upsert_edge_keeps_weight() {
        let (mut g, a, b, e) = graph_with_pair();
        let again = g.upsert_edge(EdgeSpec::new(a, b, 0.1), 0, 20).unwrap();
        assert_eq!(e, again);
        assert!((g.edge(e).unwrap().weight - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_edge_to_closed_node_is_stale() {
        let (mut g, a, b, _) = graph_with_pair();
        g.close_node(b, 30).unwrap();
        let err = g
            .upsert_edge(EdgeSpec::new(a, b, 0.5).kind(EdgeKind::Causal), 0, 40)
            .unwrap_err();
        assert_eq!(err, SubstrateError::StaleReference(RecordRef::Node(b)));
    }

    #[test]
    fn test_close_node_closes_incident_edges() {
        let (mut g, a, b, e) = graph_with_pair();
        let closed = g.close_node(a, 30).unwrap();
        assert_eq!(closed, vec![e]);
        assert!(!g.edge(e).unwrap().is_open());
        assert!(g.query_neighbors(b, None).unwrap().is_empty());
        assert!(g.node_by_key("a").is_none());
    }

    #[test]
    fn test_close_twice_is_stale() {
        let (mut g, a, _, _) = graph_with_pair();
        g.close_node(a, 30).unwrap();
        assert!(matches!(
            g.close_node(a, 40),
            Err(SubstrateError::StaleReference(_))
        ));
    }

    #[test]
    fn test_reupsert_closed_key_gets_new_id() {
        let (mut g, a, _, _) = graph_with_pair();
        g.close_node(a, 30).unwrap();
        let fresh = g.upsert_node(NodeSpec::new("a"), 40, 40).unwrap();
        assert_ne!(a, fresh);
        assert_eq!(g.node_by_key("a"), Some(fresh));
    }

    #[test]
    fn test_query_neighbors_filter_and_direction() {
        let (mut g, a, b, _) = graph_with_pair();
        g.upsert_edge(EdgeSpec::new(b, a, 0.3).kind(EdgeKind::Causal), 0, 10)
            .unwrap();

        let all = g.query_neighbors(a, None).unwrap();
        assert_eq!(all.len(), 2);
        let causal = g.query_neighbors(a, Some(EdgeKind::Causal)).unwrap();
        assert_eq!(causal.len(), 1);
        assert_eq!(causal[0].direction, Direction::Incoming);
        assert_eq!(causal[0].node, b);
    }

    #[test]
    fn test_get_node_is_pure() {
        let (g, a, _, _) = graph_with_pair();
        let first = g.get_node(a, AsOf::at(100)).cloned();
        let second = g.get_node(a, AsOf::at(100)).cloned();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_specs_rejected() {
        let mut g = Graph::new();
        assert!(g.upsert_node(NodeSpec::new(""), 0, 0).is_err());
        assert!(g.upsert_node(NodeSpec::new("x").with_decay(-1.0), 0, 0).is_err());
        let a = g.upsert_node(NodeSpec::new("a"), 0, 0).unwrap();
        assert!(g.upsert_edge(EdgeSpec::new(a, a, 1.5), 0, 0).is_err());
    }

    #[test]
    fn test_from_parts_rebuilds_indexes() {
        let (g, a, b, e) = graph_with_pair();
        let nodes: Vec<Node> = g.current_nodes().cloned().collect();
        let edges: Vec<Edge> = g.current_edges().cloned().collect();
        let rebuilt = Graph::from_parts(nodes, edges, Vec::new(), Vec::new());
        assert_eq!(rebuilt.node_by_key("b"), Some(b));
        assert_eq!(rebuilt.outgoing_edges(a).map(|x| x.id).collect::<Vec<_>>(), vec![e]);

        let mut rebuilt = rebuilt;
        let c = rebuilt.upsert_node(NodeSpec::new("c"), 0, 0).unwrap();
        assert!(c.raw() > b.raw());
    }
}
