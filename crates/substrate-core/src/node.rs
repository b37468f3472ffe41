use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bitemporal::Bitemporal;
use crate::constants::DEFAULT_DECAY_RATE;
use crate::ids::{EntityId, NodeId};

/// A graph node carrying one energy value per entity channel.
///
/// The same node can be salient to several entities at different strengths.
/// Energies are runtime state owned by the propagator; everything else is
/// structural and versioned through `temporal`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Caller-facing stable key, unique within a partition.
    pub key: String,
    pub label: String,
    pub energies: BTreeMap<EntityId, f64>,
    /// Importance at creation. Never decays.
    pub base_weight: f64,
    pub decay_rate: f64,
    /// Workspace cost in capacity units.
    pub size: u32,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub temporal: Bitemporal,
}

impl Node {
    pub fn energy(&self, entity: EntityId) -> f64 {
        self.energies.get(&entity).copied().unwrap_or(0.0)
    }

    pub fn total_energy(&self) -> f64 {
        self.energies.values().sum()
    }

    pub fn is_active(&self, entity: EntityId, floor: f64) -> bool {
        self.energy(entity) > floor
    }

    /// Workspace cost, at least one unit.
    pub fn cost(&self) -> u32 {
        self.size.max(1)
    }

    pub fn is_open(&self) -> bool {
        self.temporal.is_open()
    }
}

/// Upsert payload for a node. Everything but `key` has a default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    pub key: String,
    pub label: String,
    pub base_weight: f64,
    pub decay_rate: f64,
    pub size: u32,
    pub embedding: Option<Vec<f32>>,
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self {
            key: String::new(),
            label: String::new(),
            base_weight: 0.5,
            decay_rate: DEFAULT_DECAY_RATE,
            size: 1,
            embedding: None,
        }
    }
}

impl NodeSpec {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            label: key.clone(),
            key,
            ..Self::default()
        }
    }

    pub fn with_decay(mut self, decay_rate: f64) -> Self {
        self.decay_rate = decay_rate;
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}
