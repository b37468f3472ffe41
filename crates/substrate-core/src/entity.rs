//! Entity records: emergent weighted clusters of nodes.
//!
//! Entities refer to nodes by id only. The registry is owned by the
//! lifecycle manager, which is the only code path allowed to mutate it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::bitemporal::{AsOf, Bitemporal};
use crate::error::{Result, SubstrateError};
use crate::ids::{EntityId, IdAllocator, NodeId};
use crate::time::Timestamp;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Provisional,
    Established,
    Merged { successor: EntityId },
    Split { successors: Vec<EntityId> },
}

/// What a lifecycle state permits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatePolicy {
    /// Counted as a live entity for clustering, metrics and redirects.
    pub live: bool,
    pub accepts_members: bool,
    /// Has an energy channel that ticks.
    pub accepts_energy: bool,
    pub merge_eligible: bool,
    pub split_eligible: bool,
    pub promotable: bool,
    pub terminal: bool,
}

const PROVISIONAL: StatePolicy = StatePolicy {
    live: true,
    accepts_members: true,
    accepts_energy: true,
    merge_eligible: true,
    split_eligible: true,
    promotable: true,
    terminal: false,
};

const ESTABLISHED: StatePolicy = StatePolicy {
    live: true,
    accepts_members: true,
    accepts_energy: true,
    merge_eligible: true,
    split_eligible: true,
    promotable: false,
    terminal: false,
};

const RETIRED: StatePolicy = StatePolicy {
    live: false,
    accepts_members: false,
    accepts_energy: false,
    merge_eligible: false,
    split_eligible: false,
    promotable: false,
    terminal: true,
};

impl LifecycleState {
    pub fn policy(&self) -> &'static StatePolicy {
        match self {
            Self::Provisional => &PROVISIONAL,
            Self::Established => &ESTABLISHED,
            Self::Merged { .. } | Self::Split { .. } => &RETIRED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisional => "provisional",
            Self::Established => "established",
            Self::Merged { .. } => "merged",
            Self::Split { .. } => "split",
        }
    }

    pub fn successors(&self) -> Vec<EntityId> {
        match self {
            Self::Merged { successor } => vec![*successor],
            Self::Split { successors } => successors.clone(),
            _ => Vec::new(),
        }
    }
}

/// How an entity came to exist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum Provenance {
    Created,
    Merged { from: Vec<EntityId> },
    Split { from: EntityId },
}

/// One proposal folded into an existing entity instead of creating a twin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RedirectRecord {
    pub at: Timestamp,
    pub seeds: Vec<NodeId>,
    /// Affinity the seeds were offered; existing members keep their own.
    pub affinity: f64,
    pub jaccard: f64,
}

/// One learned change to a member weight. `None` means not a member.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub node: NodeId,
    pub before: Option<f64>,
    pub after: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub role: String,
    /// Member node → affinity in [0, 1].
    pub members: BTreeMap<NodeId, f64>,
    pub coherence: f64,
    #[serde(default)]
    pub quality: Option<f64>,
    pub state: LifecycleState,
    pub provenance: Provenance,
    #[serde(default)]
    pub redirects: Vec<RedirectRecord>,
    pub temporal: Bitemporal,
}

impl Entity {
    pub fn policy(&self) -> &'static StatePolicy {
        self.state.policy()
    }

    pub fn is_live(&self) -> bool {
        self.policy().live && self.temporal.is_open()
    }

    pub fn affinity(&self, node: NodeId) -> f64 {
        self.members.get(&node).copied().unwrap_or(0.0)
    }

    pub fn member_set(&self) -> BTreeSet<NodeId> {
        self.members.keys().copied().collect()
    }

    /// The `k` strongest members, ties broken by node id.
    pub fn top_members(&self, k: usize) -> Vec<NodeId> {
        let mut ranked: Vec<(NodeId, f64)> = self.members.iter().map(|(&n, &a)| (n, a)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.into_iter().take(k).map(|(n, _)| n).collect()
    }
}

/// Serializable form of the registry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entities: Vec<Entity>,
    pub history: Vec<Entity>,
}

#[derive(Clone, Debug, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<EntityId, Entity>,
    history: Vec<Entity>,
    ids: IdAllocator,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: EntitySnapshot) -> Self {
        let mut ids = IdAllocator::default();
        for e in snapshot.entities.iter().chain(snapshot.history.iter()) {
            ids.observe(e.id.raw());
        }
        Self {
            entities: snapshot.entities.into_iter().map(|e| (e.id, e)).collect(),
            history: snapshot.history,
            ids,
        }
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            entities: self.entities.values().cloned().collect(),
            history: self.history.clone(),
        }
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_as_of(&self, id: EntityId, as_of: AsOf) -> Option<&Entity> {
        if let Some(current) = self.entities.get(&id)
            && current.temporal.matches(as_of)
        {
            return Some(current);
        }
        self.history
            .iter()
            .rev()
            .find(|e| e.id == id && e.temporal.matches(as_of))
    }

    /// Live entities in id order.
    pub fn live(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(|e| e.is_live())
    }

    pub fn live_ids(&self) -> Vec<EntityId> {
        self.live().map(|e| e.id).collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn history(&self) -> &[Entity] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Live entities containing `node`, with the node's affinity.
    pub fn memberships(&self, node: NodeId) -> Vec<(EntityId, f64)> {
        self.live()
            .filter_map(|e| e.members.get(&node).map(|&a| (e.id, a)))
            .collect()
    }

    fn live_mut(&mut self, id: EntityId) -> Result<&mut Entity> {
        self.entities
            .get_mut(&id)
            .filter(|e| e.is_live())
            .ok_or(SubstrateError::UnknownEntity(id))
    }

    /// Push the current version into history and open a new one at `at`.
    fn supersede(&mut self, id: EntityId, at: Timestamp) -> Result<&mut Entity> {
        let current = self.live_mut(id)?;
        let mut retired = current.clone();
        retired.temporal.supersede(at);
        let valid_from = current.temporal.valid_from;
        current.temporal = Bitemporal::open(valid_from, at);
        self.history.push(retired);
        self.live_mut(id)
    }

    pub(crate) fn create(
        &mut self,
        role: String,
        members: BTreeMap<NodeId, f64>,
        coherence: f64,
        state: LifecycleState,
        provenance: Provenance,
        at: Timestamp,
    ) -> &Entity {
        let id = EntityId(self.ids.next_raw());
        self.entities.entry(id).or_insert(Entity {
            id,
            role,
            members,
            coherence,
            quality: None,
            state,
            provenance,
            redirects: Vec::new(),
            temporal: Bitemporal::open(at, at),
        })
    }

    /// Add new `seeds` at `affinity`. Existing members keep their weight.
    /// Returns the nodes that were not members before.
    pub(crate) fn redirect_into(
        &mut self,
        id: EntityId,
        seeds: &[NodeId],
        affinity: f64,
        jaccard: f64,
        at: Timestamp,
    ) -> Result<Vec<NodeId>> {
        if !self.live_mut(id)?.policy().accepts_members {
            return Err(SubstrateError::UnknownEntity(id));
        }
        let entity = self.supersede(id, at)?;
        let mut added = Vec::new();
        for &seed in seeds {
            if let std::collections::btree_map::Entry::Vacant(slot) = entity.members.entry(seed) {
                slot.insert(affinity);
                added.push(seed);
            }
        }
        entity.redirects.push(RedirectRecord {
            at,
            seeds: seeds.to_vec(),
            affinity,
            jaccard,
        });
        Ok(added)
    }

    /// Apply learned weight changes as one new version. A change with no
    /// `after` removes the member; the last member is never removed.
    pub(crate) fn adjust_members(
        &mut self,
        id: EntityId,
        changes: &[MembershipChange],
        at: Timestamp,
    ) -> Result<()> {
        let current = self.live_mut(id)?;
        let removed = changes
            .iter()
            .filter(|c| c.after.is_none() && current.members.contains_key(&c.node))
            .count();
        if removed >= current.members.len() {
            return Err(SubstrateError::InvalidInput(format!(
                "adjustment would leave {id} without members"
            )));
        }
        let entity = self.supersede(id, at)?;
        for change in changes {
            match change.after {
                Some(weight) => {
                    entity.members.insert(change.node, weight.clamp(0.0, 1.0));
                }
                None => {
                    entity.members.remove(&change.node);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn promote(&mut self, id: EntityId, quality: f64, at: Timestamp) -> Result<()> {
        let entity = self.supersede(id, at)?;
        entity.state = LifecycleState::Established;
        entity.quality = Some(quality);
        Ok(())
    }

    /// Close an entity into a terminal state. History keeps the last live
    /// version; the closed current version carries the successor pointers.
    pub(crate) fn retire(&mut self, id: EntityId, state: LifecycleState, at: Timestamp) -> Result<()> {
        if !state.policy().terminal {
            return Err(SubstrateError::InvalidInput(format!(
                "{} is not a terminal state",
                state.as_str()
            )));
        }
        let entity = self.supersede(id, at)?;
        entity.state = state;
        entity.temporal.close(at);
        Ok(())
    }

    /// Runtime statistics; not versioned.
    pub(crate) fn set_coherence(&mut self, id: EntityId, coherence: f64) {
        if let Some(e) = self.entities.get_mut(&id) {
            e.coherence = coherence;
        }
    }

    pub(crate) fn set_quality(&mut self, id: EntityId, quality: f64) {
        if let Some(e) = self.entities.get_mut(&id) {
            e.quality = Some(quality);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(pairs: &[(u64, f64)]) -> BTreeMap<NodeId, f64> {
        pairs.iter().map(|&(n, a)| (NodeId(n), a)).collect()
    }

    fn provisional(reg: &mut EntityRegistry, members: BTreeMap<NodeId, f64>) -> EntityId {
        reg.create(
            "test".into(),
            members,
            1.0,
            LifecycleState::Provisional,
            Provenance::Created,
            0,
        )
        .id
    }

    #[test]
    fn test_policy_table() {
        assert!(LifecycleState::Provisional.policy().promotable);
        assert!(!LifecycleState::Established.policy().promotable);
        let merged = LifecycleState::Merged {
            successor: EntityId(9),
        };
        assert!(merged.policy().terminal);
        assert!(!merged.policy().live);
        assert_eq!(merged.successors(), vec![EntityId(9)]);
    }

    #[test]
    fn test_redirect_keeps_existing_member_weights() {
        let mut reg = EntityRegistry::new();
        let id = reg.create(
            "y".into(),
            members(&[(1, 0.9), (2, 0.1)]),
            1.0,
            LifecycleState::Provisional,
            Provenance::Created,
            0,
        )
        .id;
        let added = reg
            .redirect_into(id, &[NodeId(1), NodeId(2), NodeId(3)], 0.3, 0.6, 10)
            .unwrap();
        assert_eq!(added, vec![NodeId(3)]);
        let e = reg.get(id).unwrap();
        assert_eq!(e.affinity(NodeId(1)), 0.9);
        assert_eq!(e.affinity(NodeId(2)), 0.1);
        assert_eq!(e.affinity(NodeId(3)), 0.3);
        assert_eq!(e.redirects.len(), 1);
        assert_eq!(reg.history().len(), 1);
        assert_eq!(reg.get_as_of(id, AsOf::at(5)).unwrap().members.len(), 2);
    }

    #[test]
    fn test_adjust_members_versions_and_keeps_one_member() {
        let mut reg = EntityRegistry::new();
        let id = provisional(&mut reg, members(&[(1, 1.0), (2, 0.3)]));
        let raise = MembershipChange {
            node: NodeId(2),
            before: Some(0.3),
            after: Some(0.4),
        };
        let join = MembershipChange {
            node: NodeId(3),
            before: None,
            after: Some(0.2),
        };
        reg.adjust_members(id, &[raise, join], 10).unwrap();
        let e = reg.get(id).unwrap();
        assert_eq!(e.affinity(NodeId(2)), 0.4);
        assert_eq!(e.affinity(NodeId(3)), 0.2);
        assert_eq!(reg.history().len(), 1);
        assert_eq!(reg.history()[0].affinity(NodeId(2)), 0.3);

        let drop_all: Vec<MembershipChange> = [1, 2, 3]
            .into_iter()
            .map(|n| MembershipChange {
                node: NodeId(n),
                before: Some(1.0),
                after: None,
            })
            .collect();
        assert!(reg.adjust_members(id, &drop_all, 20).is_err());
        assert_eq!(reg.get(id).unwrap().members.len(), 3);
        assert_eq!(reg.history().len(), 1);
    }

    #[test]
    fn test_retire_closes_and_points_to_successor() {
        let mut reg = EntityRegistry::new();
        let a = provisional(&mut reg, members(&[(1, 1.0)]));
        reg.retire(a, LifecycleState::Merged { successor: EntityId(7) }, 50)
            .unwrap();
        let e = reg.get(a).unwrap();
        assert!(!e.is_live());
        assert_eq!(e.temporal.recorded_to, Some(50));
        assert_eq!(reg.live().count(), 0);
        assert!(matches!(
            reg.redirect_into(a, &[NodeId(2)], 0.3, 0.5, 60),
            Err(SubstrateError::UnknownEntity(_))
        ));
        assert_eq!(
            reg.get_as_of(a, AsOf::at(40)).unwrap().state,
            LifecycleState::Provisional
        );
    }

    #[test]
    fn test_retire_rejects_live_state() {
        let mut reg = EntityRegistry::new();
        let a = provisional(&mut reg, members(&[(1, 1.0)]));
        assert!(reg.retire(a, LifecycleState::Established, 5).is_err());
    }

    #[test]
    fn test_top_members_order() {
        let mut reg = EntityRegistry::new();
        let a = reg.create(
            "a".into(),
            members(&[(3, 0.5), (1, 0.5), (2, 0.9)]),
            1.0,
            LifecycleState::Provisional,
            Provenance::Created,
            0,
        )
        .id;
        assert_eq!(
            reg.get(a).unwrap().top_members(2),
            vec![NodeId(2), NodeId(1)]
        );
    }

    #[test]
    fn test_snapshot_restores_allocator() {
        let mut reg = EntityRegistry::new();
        provisional(&mut reg, members(&[(1, 1.0)]));
        let mut restored = EntityRegistry::from_snapshot(reg.snapshot());
        let next = provisional(&mut restored, BTreeMap::new());
        assert_eq!(next, EntityId(1));
    }
}
