//! One engine instance per tenant.
//!
//! The instance exclusively owns its partition: the graph, the entity
//! registry (through the lifecycle manager), workspace frames, goals and
//! scheduler state. Nothing here is shared across tenants.
//!
//! Every change is also queued as a [`Delta`] or [`LifecycleEvent`]. Callers
//! drain the queue as a [`Batch`], persist it, and only then publish it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bitemporal::AsOf;
use crate::config::EngineConfig;
use crate::edge::{Edge, EdgeKind, EdgeSpec};
use crate::entity::{Entity, EntityRegistry, EntitySnapshot};
use crate::error::{RecordRef, Result, SubstrateError};
use crate::graph::{Graph, GraphSnapshot, Neighbor};
use crate::ids::{EdgeId, EntityId, NodeId};
use crate::lifecycle::{Cohorts, LifecycleEvent, LifecycleEventKind, LifecycleManager, ProposalOutcome};
use crate::node::{Node, NodeSpec};
use crate::propagation::{ChannelDiagnostics, CommitSummary, EnergyChange, Propagator, WeightChange};
use crate::scheduler::{
    ActivitySignal, StimulusEffect, TickDecision, TickScheduler, projected_crossing,
};
use crate::time::Timestamp;
use crate::workspace::{EmbeddingAlignment, WorkspaceFrame, WorkspaceSelector};

/// One observable change to a partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    NodeUpserted { node: Node },
    NodeClosed { node: NodeId, edges: Vec<EdgeId>, at: Timestamp },
    EdgeUpserted { edge: Edge },
    EdgeClosed { edge: EdgeId, at: Timestamp },
    Energy(EnergyChange),
    Weight(WeightChange),
    Workspace(WorkspaceFrame),
    Entity(Entity),
}

impl Delta {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeUpserted { .. } => "node_upserted",
            Self::NodeClosed { .. } => "node_closed",
            Self::EdgeUpserted { .. } => "edge_upserted",
            Self::EdgeClosed { .. } => "edge_closed",
            Self::Energy(_) => "energy",
            Self::Weight(_) => "weight",
            Self::Workspace(_) => "workspace",
            Self::Entity(_) => "entity",
        }
    }
}

/// Everything that changed since the last drain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub tenant: String,
    pub tick: u64,
    pub deltas: Vec<Delta>,
    pub events: Vec<LifecycleEvent>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.events.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    pub batch: Batch,
    pub dt: f64,
    pub capped: bool,
    pub diagnostics: Vec<ChannelDiagnostics>,
    /// Lifecycle decisions postponed for lack of cohort data.
    pub deferred: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Injection {
    pub energy: f64,
    pub effect: StimulusEffect,
}

/// Persistable state of one tenant partition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartitionState {
    pub tenant: String,
    pub tick: u64,
    pub graph: GraphSnapshot,
    pub entities: EntitySnapshot,
    #[serde(default)]
    pub cohorts: Option<Cohorts>,
    #[serde(default)]
    pub goals: BTreeMap<EntityId, Vec<f32>>,
}

pub struct EngineInstance {
    tenant: String,
    config: EngineConfig,
    graph: Graph,
    propagator: Propagator,
    selector: WorkspaceSelector,
    lifecycle: LifecycleManager,
    scheduler: TickScheduler,
    goals: BTreeMap<EntityId, Vec<f32>>,
    tick: u64,
    signal: ActivitySignal,
    deltas: Vec<Delta>,
    events: Vec<LifecycleEvent>,
}

impl EngineInstance {
    pub fn new(tenant: impl Into<String>, config: EngineConfig) -> Self {
        Self::restore(
            config,
            PartitionState {
                tenant: tenant.into(),
                ..PartitionState::default()
            },
        )
    }

    /// Rebuild an instance from persisted state. Workspace frames and
    /// scheduler timing are not persisted and start fresh.
    pub fn restore(config: EngineConfig, state: PartitionState) -> Self {
        let lifecycle = LifecycleManager::restore(
            config.lifecycle.clone(),
            EntityRegistry::from_snapshot(state.entities),
            state.cohorts,
        );
        Self {
            tenant: state.tenant,
            propagator: Propagator::new(config.propagation.clone()),
            selector: WorkspaceSelector::new(config.workspace.clone()),
            scheduler: TickScheduler::new(config.scheduler.clone()),
            graph: Graph::from_snapshot(state.graph),
            lifecycle,
            goals: state.goals,
            tick: state.tick,
            signal: ActivitySignal::default(),
            deltas: Vec::new(),
            events: Vec::new(),
            config,
        }
    }

    pub fn state(&self) -> PartitionState {
        PartitionState {
            tenant: self.tenant.clone(),
            tick: self.tick,
            graph: self.graph.snapshot(),
            entities: self.lifecycle.registry().snapshot(),
            cohorts: Some(self.lifecycle.cohorts().clone()),
            goals: self.goals.clone(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn registry(&self) -> &EntityRegistry {
        self.lifecycle.registry()
    }

    pub fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    // Mutations

    pub fn upsert_node(
        &mut self,
        spec: NodeSpec,
        valid_from: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<NodeId> {
        let id = self.graph.upsert_node(spec, valid_from.unwrap_or(now), now)?;
        if let Some(node) = self.graph.node(id) {
            self.deltas.push(Delta::NodeUpserted { node: node.clone() });
        }
        Ok(id)
    }

    pub fn upsert_edge(
        &mut self,
        spec: EdgeSpec,
        valid_from: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<EdgeId> {
        let id = self.graph.upsert_edge(spec, valid_from.unwrap_or(now), now)?;
        if let Some(edge) = self.graph.edge(id) {
            self.deltas.push(Delta::EdgeUpserted { edge: edge.clone() });
        }
        Ok(id)
    }

    pub fn close_node(&mut self, id: NodeId, now: Timestamp) -> Result<Vec<EdgeId>> {
        let edges = self.graph.close_node(id, now)?;
        self.deltas.push(Delta::NodeClosed {
            node: id,
            edges: edges.clone(),
            at: now,
        });
        Ok(edges)
    }

    pub fn close_edge(&mut self, id: EdgeId, now: Timestamp) -> Result<()> {
        self.graph.close_edge(id, now)?;
        self.deltas.push(Delta::EdgeClosed { edge: id, at: now });
        Ok(())
    }

    fn energy_channel(&self, entity: EntityId) -> Result<&Entity> {
        self.lifecycle
            .registry()
            .get(entity)
            .filter(|e| e.is_live() && e.policy().accepts_energy)
            .ok_or(SubstrateError::UnknownEntity(entity))
    }

    /// External stimulus: add energy to one node in one entity channel.
    pub fn inject_energy(
        &mut self,
        entity: EntityId,
        node: NodeId,
        amount: f64,
        source: &str,
        now: Timestamp,
    ) -> Result<Injection> {
        self.energy_channel(entity)?;
        let before = self
            .graph
            .node(node)
            .filter(|n| n.is_open())
            .ok_or(SubstrateError::StaleReference(RecordRef::Node(node)))?
            .energy(entity);
        let energy = self.propagator.inject(&mut self.graph, entity, node, amount)?;
        self.deltas.push(Delta::Energy(EnergyChange {
            node,
            entity,
            before,
            after: energy,
        }));
        let effect = self.scheduler.on_stimulus(now);
        debug!(tenant = %self.tenant, %entity, %node, amount, source, "energy injected");
        Ok(Injection { energy, effect })
    }

    /// Set or clear (empty vector) the goal embedding of an entity.
    pub fn set_goal(&mut self, entity: EntityId, goal: Vec<f32>) -> Result<()> {
        self.energy_channel(entity)?;
        if goal.is_empty() {
            self.goals.remove(&entity);
        } else {
            self.goals.insert(entity, goal);
        }
        Ok(())
    }

    pub fn propose_entity(
        &mut self,
        role: &str,
        seeds: &[NodeId],
        now: Timestamp,
    ) -> Result<ProposalOutcome> {
        let (outcome, event) = self.lifecycle.propose_entity(
            &self.graph,
            self.selector.history(),
            role,
            seeds,
            now,
        )?;
        self.record_event(event);
        Ok(outcome)
    }

    fn record_event(&mut self, event: LifecycleEvent) {
        let touched: Vec<Entity> = match &event.kind {
            LifecycleEventKind::Created { entity, .. } => vec![entity.clone()],
            LifecycleEventKind::Redirected { after, .. }
            | LifecycleEventKind::Promoted { after, .. }
            | LifecycleEventKind::MembershipAdjusted { after, .. } => vec![after.clone()],
            LifecycleEventKind::Merged { after, merged, .. } => {
                let mut all = after.clone();
                all.push(merged.clone());
                all
            }
            LifecycleEventKind::Split { after, parts, .. } => {
                let mut all = vec![after.clone()];
                all.extend(parts.iter().cloned());
                all
            }
        };
        self.deltas.extend(touched.into_iter().map(Delta::Entity));
        self.events.push(event);
    }

    // Queries

    pub fn get_node(&self, id: NodeId, as_of: AsOf) -> Option<&Node> {
        self.graph.get_node(id, as_of)
    }

    pub fn resolve(&self, key: &str) -> Result<NodeId> {
        self.graph.resolve(key)
    }

    pub fn neighbors(&self, id: NodeId, kind: Option<EdgeKind>) -> Result<Vec<Neighbor>> {
        self.graph.query_neighbors(id, kind)
    }

    pub fn entity(&self, id: EntityId, as_of: Option<AsOf>) -> Option<&Entity> {
        match as_of {
            Some(as_of) => self.lifecycle.registry().get_as_of(id, as_of),
            None => self.lifecycle.registry().get(id),
        }
    }

    pub fn workspace(&self, entity: EntityId) -> Option<&WorkspaceFrame> {
        self.selector.current(entity)
    }

    // Ticking

    /// Decide when the next tick is due.
    pub fn schedule(&mut self, now: Timestamp) -> TickDecision {
        self.scheduler.schedule(now, self.signal)
    }

    /// Queued changes since the last drain.
    pub fn drain(&mut self) -> Batch {
        Batch {
            tenant: self.tenant.clone(),
            tick: self.tick,
            deltas: std::mem::take(&mut self.deltas),
            events: std::mem::take(&mut self.events),
        }
    }

    /// Run one tick: propagate, then select workspaces, then (every
    /// `lifecycle_every_ticks`) evaluate entities. Propagation either
    /// commits whole or the tick is aborted with nothing applied.
    pub fn run_tick(&mut self, now: Timestamp) -> Result<TickReport> {
        let start = self.scheduler.begin_tick(now)?;
        let channels: Vec<EntityId> = self
            .lifecycle
            .registry()
            .live()
            .filter(|e| e.policy().accepts_energy)
            .map(|e| e.id)
            .collect();

        let committed = {
            let selector = &self.selector;
            self.propagator
                .stage(&self.graph, &channels, start.dt, |e, n| {
                    selector.in_workspace(e, n)
                })
                .and_then(|staged| {
                    let diagnostics = staged.diagnostics.clone();
                    self.propagator
                        .commit(&mut self.graph, staged)
                        .map(|summary| (summary, diagnostics))
                })
        };
        let (summary, diagnostics) = match committed {
            Ok(ok) => ok,
            Err(e) => {
                self.scheduler.abort_tick();
                warn!(tenant = %self.tenant, error = %e, "tick aborted");
                return Err(e);
            }
        };
        self.tick += 1;
        self.queue_commit(&summary);

        for &entity in &channels {
            let goal = self.goals.get(&entity).map(Vec::as_slice);
            let frame = self.selector.select(
                &self.graph,
                self.lifecycle.registry(),
                entity,
                self.tick,
                &EmbeddingAlignment { goal },
            );
            self.deltas.push(Delta::Workspace(frame));
        }
        self.lifecycle.observe(&self.graph);

        let mut deferred = 0;
        if self.tick % self.config.lifecycle_every_ticks == 0 {
            let outcome = self.lifecycle.scan(
                &self.graph,
                self.selector.history(),
                &self.config.workspace,
                now,
            );
            for remap in &outcome.remaps {
                let moved = self.propagator.remap_channels(&mut self.graph, remap);
                self.queue_commit(&moved);
            }
            for retired in &outcome.retired {
                self.selector.forget(*retired);
                self.goals.remove(retired);
            }
            deferred = outcome.deferred.len();
            if !outcome.events.is_empty() {
                info!(
                    tenant = %self.tenant,
                    tick = self.tick,
                    events = outcome.events.len(),
                    "lifecycle decisions applied"
                );
            }
            for event in outcome.events {
                self.record_event(event);
            }
        }

        let floor = self.config.workspace.peripheral_floor;
        self.signal = ActivitySignal {
            time_to_cross: projected_crossing(
                &summary.energy,
                start.dt,
                self.config.scheduler.entry_threshold,
            ),
            active_energy: self
                .graph
                .nodes()
                .flat_map(|n| n.energies.values())
                .filter(|&&e| e > floor)
                .sum(),
        };
        self.scheduler.end_tick(now);

        debug!(
            tenant = %self.tenant,
            tick = self.tick,
            dt = start.dt,
            capped = start.capped,
            channels = channels.len(),
            "tick complete"
        );
        Ok(TickReport {
            batch: self.drain(),
            dt: start.dt,
            capped: start.capped,
            diagnostics,
            deferred,
        })
    }

    fn queue_commit(&mut self, summary: &CommitSummary) {
        self.deltas
            .extend(summary.energy.iter().cloned().map(Delta::Energy));
        self.deltas
            .extend(summary.weights.iter().cloned().map(Delta::Weight));
    }
}
