//! JSON-lines wire format of `substrate serve`.
//!
//! One request per stdin line, tagged by `op` and addressed to a `tenant`.
//! stdout carries three kinds of line: replies (`ok` set), deltas and
//! lifecycle events. Deltas and events are written only after the batch
//! that produced them is durable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use substrate_core::{
    AsOf, Batch, Delta, EdgeId, EdgeKind, EdgeSpec, EntityId, LifecycleEvent, NodeId, NodeSpec,
    SubstrateError, Timestamp,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Echoed back in the reply for correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub tenant: String,
    #[serde(flatten)]
    pub op: Op,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    UpsertNode {
        node: NodeSpec,
        #[serde(default)]
        valid_from: Option<Timestamp>,
    },
    UpsertEdge {
        edge: EdgeSpec,
        #[serde(default)]
        valid_from: Option<Timestamp>,
    },
    CloseNode {
        node: NodeId,
    },
    CloseEdge {
        edge: EdgeId,
    },
    InjectEnergy {
        entity: EntityId,
        node: NodeId,
        amount: f64,
        #[serde(default = "default_source")]
        source: String,
    },
    SetGoal {
        entity: EntityId,
        goal: Vec<f32>,
    },
    ProposeEntity {
        role: String,
        seeds: Vec<NodeId>,
    },
    GetNode {
        node: NodeId,
        #[serde(default)]
        as_of: Option<AsOf>,
    },
    Resolve {
        key: String,
    },
    Neighbors {
        node: NodeId,
        #[serde(default)]
        kind: Option<EdgeKind>,
    },
    GetEntity {
        entity: EntityId,
        #[serde(default)]
        as_of: Option<AsOf>,
    },
    Workspace {
        entity: EntityId,
    },
    /// Run a tick now instead of waiting for the scheduler.
    Tick,
}

fn default_source() -> String {
    "external".to_string()
}

impl Op {
    /// Ops that change the partition and must be persisted before replying.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Op::UpsertNode { .. }
                | Op::UpsertEdge { .. }
                | Op::CloseNode { .. }
                | Op::CloseEdge { .. }
                | Op::InjectEnergy { .. }
                | Op::SetGoal { .. }
                | Op::ProposeEntity { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::UpsertNode { .. } => "upsert_node",
            Op::UpsertEdge { .. } => "upsert_edge",
            Op::CloseNode { .. } => "close_node",
            Op::CloseEdge { .. } => "close_edge",
            Op::InjectEnergy { .. } => "inject_energy",
            Op::SetGoal { .. } => "set_goal",
            Op::ProposeEntity { .. } => "propose_entity",
            Op::GetNode { .. } => "get_node",
            Op::Resolve { .. } => "resolve",
            Op::Neighbors { .. } => "neighbors",
            Op::GetEntity { .. } => "get_entity",
            Op::Workspace { .. } => "workspace",
            Op::Tick => "tick",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    /// The caller may resend the same request unchanged.
    pub retryable: bool,
}

impl ErrorBody {
    pub fn from_core(e: &SubstrateError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }

    pub fn new(kind: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub tenant: String,
    pub op: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn ok(request: &Request, result: Value) -> Self {
        Self {
            id: request.id.clone(),
            tenant: request.tenant.clone(),
            op: request.op.name().to_string(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(request: &Request, error: ErrorBody) -> Self {
        Self {
            id: request.id.clone(),
            tenant: request.tenant.clone(),
            op: request.op.name().to_string(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    /// Reply to a line that could not be parsed into a request.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            id: None,
            tenant: String::new(),
            op: String::new(),
            ok: false,
            result: None,
            error: Some(ErrorBody::new("malformed_request", message, false)),
        }
    }
}

#[derive(Serialize)]
struct DeltaLine<'a> {
    tenant: &'a str,
    tick: u64,
    delta: &'a Delta,
}

#[derive(Serialize)]
struct EventLine<'a> {
    tenant: &'a str,
    tick: u64,
    event: &'a LifecycleEvent,
}

pub fn parse_request(line: &str) -> Result<Request, Reply> {
    serde_json::from_str(line).map_err(|e| Reply::malformed(format!("invalid request: {e}")))
}

pub fn reply_line(reply: &Reply) -> String {
    serde_json::to_string(reply).unwrap_or_else(|e| {
        format!(r#"{{"ok":false,"error":{{"kind":"internal","message":"{e}","retryable":false}}}}"#)
    })
}

/// Output lines for a durable batch: every delta, then every event.
pub fn batch_lines(batch: &Batch) -> Vec<String> {
    let deltas = batch.deltas.iter().filter_map(|delta| {
        serde_json::to_string(&DeltaLine {
            tenant: &batch.tenant,
            tick: batch.tick,
            delta,
        })
        .ok()
    });
    let events = batch.events.iter().filter_map(|event| {
        serde_json::to_string(&EventLine {
            tenant: &batch.tenant,
            tick: batch.tick,
            event,
        })
        .ok()
    });
    deltas.chain(events).collect()
}
