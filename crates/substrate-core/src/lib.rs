//! Energy-based spreading-activation substrate.
//!
//! A continuously ticking simulation over a weighted, bitemporal graph:
//! energy diffuses, decays and strengthens the edges it flows through; a
//! capacity-bounded workspace picks the salient clusters for each entity;
//! entities are created, redirected, merged and split from pairwise
//! redundancy and usefulness scores against cohort-learned thresholds, and
//! their member weights follow co-activation.
//!
//! Zero I/O. Persistence and transport live in `substrate-store` and
//! `substrate-cli`.

pub mod bitemporal;
pub mod cohort;
pub mod config;
pub mod constants;
pub mod edge;
pub mod engine;
pub mod entity;
pub mod error;
pub mod graph;
pub mod ids;
pub mod lifecycle;
pub mod membership;
pub mod metrics;
pub mod node;
pub mod propagation;
pub mod scheduler;
pub mod time;
pub mod workspace;

pub use bitemporal::{AsOf, Bitemporal};
pub use cohort::{CohortConfig, CohortMetric, CohortQuantile};
pub use config::EngineConfig;
pub use constants::{CLEANUP_THRESHOLD, ENERGY_CEILING, EPSILON};
pub use edge::{Edge, EdgeKind, EdgeSpec};
pub use engine::{Batch, Delta, EngineInstance, Injection, PartitionState, TickReport};
pub use entity::{
    Entity, EntityRegistry, EntitySnapshot, LifecycleState, MembershipChange, Provenance,
    StatePolicy,
};
pub use error::{RecordRef, Result, SubstrateError};
pub use graph::{Direction, Graph, GraphSnapshot, Neighbor};
pub use ids::{EdgeId, EntityId, NodeId};
pub use lifecycle::{
    Cohorts, Gate, LifecycleConfig, LifecycleEvent, LifecycleEventKind, LifecycleManager,
    ProposalOutcome, ScanOutcome,
};
pub use membership::{MembershipConfig, MembershipLearner};
pub use metrics::{PairMetrics, PairScores};
pub use node::{Node, NodeSpec};
pub use propagation::{
    ChannelDiagnostics, ChannelRemap, CommitSummary, EnergyChange, PropagationConfig, Propagator,
    StagedTick, WeightChange,
};
pub use scheduler::{
    ActivitySignal, SchedulerConfig, SchedulerState, StimulusEffect, TickDecision, TickFactor,
    TickScheduler,
};
pub use time::{Timestamp, now_millis};
pub use workspace::{
    Cluster, ClusterKey, EmbeddingAlignment, FrameHistory, GoalAlignment, Unaligned,
    WorkspaceConfig, WorkspaceFrame, WorkspaceSelector, select_workspace,
};
