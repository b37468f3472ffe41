use serde::{Deserialize, Serialize};

use crate::bitemporal::Bitemporal;
use crate::ids::{EdgeId, NodeId};

/// Relationship type of a directed edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Default: plain association.
    #[default]
    Association,
    /// Source tends to bring about target.
    Causal,
    /// Source precedes target.
    Temporal,
    /// Source is a component of target.
    PartOf,
    /// Source replaces target.
    Supersedes,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Association => "association",
            Self::Causal => "causal",
            Self::Temporal => "temporal",
            Self::PartOf => "part_of",
            Self::Supersedes => "supersedes",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "causal" => Self::Causal,
            "temporal" => Self::Temporal,
            "part_of" => Self::PartOf,
            "supersedes" => Self::Supersedes,
            _ => Self::Association,
        }
    }
}

/// A directed, typed, weighted edge.
///
/// `weight` is written only by the propagator's strengthening rule after
/// creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    pub weight: f64,
    #[serde(default)]
    pub valence: Option<Vec<f64>>,
    pub temporal: Bitemporal,
}

impl Edge {
    pub fn is_open(&self) -> bool {
        self.temporal.is_open()
    }

    /// The endpoint opposite `node`, if `node` is an endpoint.
    pub fn other(&self, node: NodeId) -> Option<NodeId> {
        if self.source == node {
            Some(self.target)
        } else if self.target == node {
            Some(self.source)
        } else {
            None
        }
    }
}

/// Upsert payload for an edge. `weight` is honored only on creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub kind: EdgeKind,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub valence: Option<Vec<f64>>,
}

fn default_weight() -> f64 {
    0.5
}

impl EdgeSpec {
    pub fn new(source: NodeId, target: NodeId, weight: f64) -> Self {
        Self {
            source,
            target,
            kind: EdgeKind::default(),
            weight,
            valence: None,
        }
    }

    pub fn kind(mut self, kind: EdgeKind) -> Self {
        self.kind = kind;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip_str() {
        for kind in [
            EdgeKind::Association,
            EdgeKind::Causal,
            EdgeKind::Temporal,
            EdgeKind::PartOf,
            EdgeKind::Supersedes,
        ] {
            assert_eq!(EdgeKind::from_str_lossy(kind.as_str()), kind);
        }
        assert_eq!(EdgeKind::from_str_lossy("???"), EdgeKind::Association);
    }

    #[test]
    fn test_other_endpoint() {
        let e = Edge {
            id: EdgeId(0),
            source: NodeId(1),
            target: NodeId(2),
            kind: EdgeKind::Causal,
            weight: 0.5,
            valence: None,
            temporal: Bitemporal::open(0, 0),
        };
        assert_eq!(e.other(NodeId(1)), Some(NodeId(2)));
        assert_eq!(e.other(NodeId(2)), Some(NodeId(1)));
        assert_eq!(e.other(NodeId(3)), None);
    }

    #[test]
    fn test_spec_kind_serde_snake_case() {
        let spec: EdgeSpec =
            serde_json::from_str(r#"{"source":1,"target":2,"kind":"part_of"}"#).unwrap();
        assert_eq!(spec.kind, EdgeKind::PartOf);
        assert!((spec.weight - 0.5).abs() < 1e-12);
    }
}
