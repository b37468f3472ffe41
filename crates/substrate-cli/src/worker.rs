//! One tokio task per tenant.
//!
//! The task exclusively owns the tenant's `EngineInstance` and store handle.
//! Ticks and request groups run fully in memory first; the resulting
//! partition and batch are then committed in one SQLite transaction on the
//! blocking pool under a timeout. Only a durable batch is written to stdout.
//! If the commit fails or times out, the engine is rebuilt from the store,
//! which discards the in-memory work.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use substrate_core::{
    AsOf, Batch, EngineConfig, EngineInstance, PartitionState, ProposalOutcome, StimulusEffect,
    TickReport, Timestamp, now_millis,
};
use substrate_store::{Store, StoreError, TenantDirectory};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{ErrorBody, Op, Reply, Request, batch_lines, reply_line};

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub engine: EngineConfig,
    pub persist_timeout: Duration,
    pub max_group: usize,
    pub journal_ticks: Option<u64>,
}

/// What a tick reply and `simulate` report.
#[derive(Clone, Debug, Serialize)]
pub struct TickSummary {
    pub tenant: String,
    pub tick: u64,
    pub dt: f64,
    pub capped: bool,
    pub deltas: usize,
    pub events: Vec<&'static str>,
    pub deferred: usize,
    pub active_energy: f64,
}

impl TickSummary {
    pub fn new(engine: &EngineInstance, report: &TickReport) -> Self {
        Self {
            tenant: engine.tenant().to_string(),
            tick: report.batch.tick,
            dt: report.dt,
            capped: report.capped,
            deltas: report.batch.deltas.len(),
            events: report.batch.events.iter().map(|e| e.name()).collect(),
            deferred: report.deferred,
            active_energy: report.diagnostics.iter().map(|d| d.energy_after).sum(),
        }
    }
}

pub struct Worker {
    tenant: String,
    engine: EngineInstance,
    store: Arc<Mutex<Store>>,
    /// Commit sequence of the last batch known to be durable.
    seq: u64,
    options: WorkerOptions,
    out: mpsc::Sender<String>,
}

/// Open the tenant's database and rebuild its engine. Blocking.
pub fn load(
    dir: &TenantDirectory,
    tenant: &str,
    options: WorkerOptions,
    out: mpsc::Sender<String>,
) -> substrate_store::Result<Worker> {
    let store = dir.open(tenant)?;
    let mut state = store.load_partition()?;
    state.tenant = tenant.to_string();
    let seq = store.commit_seq()?;
    info!(
        tenant,
        tick = state.tick,
        nodes = state.graph.nodes.len(),
        entities = state.entities.entities.len(),
        "tenant loaded"
    );
    Ok(Worker {
        tenant: tenant.to_string(),
        engine: EngineInstance::restore(options.engine.clone(), state),
        store: Arc::new(Mutex::new(store)),
        seq,
        options,
        out,
    })
}

fn lock(store: &Mutex<Store>) -> substrate_store::Result<std::sync::MutexGuard<'_, Store>> {
    store
        .lock()
        .map_err(|_| StoreError::InvalidData("store lock poisoned".into()))
}

fn until(due_at: Timestamp) -> Duration {
    Duration::from_millis((due_at - now_millis()).max(0) as u64)
}

impl Worker {
    pub async fn run(mut self, mut rx: mpsc::Receiver<Request>, cancel: CancellationToken) {
        let mut next = self.engine.schedule(now_millis());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    let stimulated = self.handle_group(request, &mut rx).await;
                    if stimulated {
                        let fresh = self.engine.schedule(now_millis());
                        if fresh.due_at < next.due_at {
                            next = fresh;
                        }
                    }
                }
                _ = tokio::time::sleep(until(next.due_at)) => {
                    // failures are logged inside; the next tick integrates the gap
                    let _ = self.tick(now_millis()).await;
                    next = self.engine.schedule(now_millis());
                }
            }
        }
        info!(tenant = %self.tenant, tick = self.engine.tick_count(), "tenant stopped");
    }

    /// Apply `first` and whatever else is already queued, then commit once.
    /// Returns whether any request was a stimulus.
    async fn handle_group(&mut self, first: Request, rx: &mut mpsc::Receiver<Request>) -> bool {
        let mut group = vec![first];
        while group.len() < self.options.max_group {
            match rx.try_recv() {
                Ok(request) => group.push(request),
                Err(_) => break,
            }
        }

        let mut pending: Vec<(Reply, bool)> = Vec::new();
        let mut stimulated = false;
        for request in group {
            let now = now_millis();
            if request.op == Op::Tick {
                self.flush(&mut pending).await;
                let reply = match self.tick(now).await {
                    Ok(summary) => match serde_json::to_value(&summary) {
                        Ok(value) => Reply::ok(&request, value),
                        Err(e) => Reply::err(&request, ErrorBody::new("internal", e.to_string(), false)),
                    },
                    Err(body) => Reply::err(&request, body),
                };
                self.emit(reply_line(&reply)).await;
                continue;
            }
            stimulated |= matches!(request.op, Op::InjectEnergy { .. });
            let mutation = request.op.is_mutation();
            let reply = match self.apply(&request.op, now) {
                Ok(value) => Reply::ok(&request, value),
                Err(body) => Reply::err(&request, body),
            };
            let durable_needed = mutation && reply.ok;
            pending.push((reply, durable_needed));
        }
        self.flush(&mut pending).await;
        stimulated
    }

    /// Commit queued mutations, then send their replies. Replies to
    /// mutations that did not become durable are turned into errors.
    async fn flush(&mut self, pending: &mut Vec<(Reply, bool)>) {
        if pending.iter().any(|(_, needs)| *needs) {
            let batch = self.engine.drain();
            if let Err(reason) = self.persist(batch).await {
                for (reply, needs) in pending.iter_mut() {
                    if *needs {
                        reply.ok = false;
                        reply.result = None;
                        reply.error = Some(ErrorBody::new("persist_failed", reason.clone(), true));
                    }
                }
            }
        }
        for (reply, _) in pending.drain(..) {
            self.emit(reply_line(&reply)).await;
        }
    }

    fn apply(&mut self, op: &Op, now: Timestamp) -> Result<Value, ErrorBody> {
        let engine = &mut self.engine;
        let core = |e: substrate_core::SubstrateError| ErrorBody::from_core(&e);
        let value = match op {
            Op::UpsertNode { node, valid_from } => {
                json!({ "node": engine.upsert_node(node.clone(), *valid_from, now).map_err(core)? })
            }
            Op::UpsertEdge { edge, valid_from } => {
                json!({ "edge": engine.upsert_edge(edge.clone(), *valid_from, now).map_err(core)? })
            }
            Op::CloseNode { node } => {
                json!({ "closed_edges": engine.close_node(*node, now).map_err(core)? })
            }
            Op::CloseEdge { edge } => {
                engine.close_edge(*edge, now).map_err(core)?;
                json!({})
            }
            Op::InjectEnergy {
                entity,
                node,
                amount,
                source,
            } => {
                let injection = engine
                    .inject_energy(*entity, *node, *amount, source, now)
                    .map_err(core)?;
                let effect = match injection.effect {
                    StimulusEffect::Preempt => "preempt",
                    StimulusEffect::Recorded => "recorded",
                };
                json!({ "energy": injection.energy, "effect": effect })
            }
            Op::SetGoal { entity, goal } => {
                engine.set_goal(*entity, goal.clone()).map_err(core)?;
                json!({})
            }
            Op::ProposeEntity { role, seeds } => {
                match engine.propose_entity(role, seeds, now).map_err(core)? {
                    ProposalOutcome::Created(id) => json!({ "outcome": "created", "entity": id }),
                    ProposalOutcome::Redirected { target, added } => {
                        json!({ "outcome": "redirected", "entity": target, "added": added })
                    }
                }
            }
            Op::GetNode { node, as_of } => {
                to_value(engine.get_node(*node, as_of.unwrap_or(AsOf::at(now))))?
            }
            Op::Resolve { key } => json!({ "node": engine.resolve(key).map_err(core)? }),
            Op::Neighbors { node, kind } => to_value(engine.neighbors(*node, *kind).map_err(core)?)?,
            Op::GetEntity { entity, as_of } => to_value(engine.entity(*entity, *as_of))?,
            Op::Workspace { entity } => to_value(engine.workspace(*entity))?,
            Op::Tick => {
                return Err(ErrorBody::new(
                    "invalid_input",
                    "tick is not applied inline",
                    false,
                ));
            }
        };
        Ok(value)
    }

    /// Run one tick and make it durable.
    async fn tick(&mut self, now: Timestamp) -> Result<TickSummary, ErrorBody> {
        let report = match self.engine.run_tick(now) {
            Ok(report) => report,
            Err(e) => {
                if e.is_retryable() {
                    warn!(tenant = %self.tenant, error = %e, "tick aborted, will retry");
                } else {
                    error!(tenant = %self.tenant, error = %e, "tick failed");
                }
                return Err(ErrorBody::from_core(&e));
            }
        };
        let summary = TickSummary::new(&self.engine, &report);
        self.persist(report.batch)
            .await
            .map_err(|reason| ErrorBody::new("tick_aborted", reason, true))?;
        Ok(summary)
    }

    /// Commit the current partition with `batch`; publish on success.
    /// On failure the engine is rebuilt from the store.
    async fn persist(&mut self, batch: Batch) -> Result<(), String> {
        let state = self.engine.state();
        let store = Arc::clone(&self.store);
        let journal_ticks = self.options.journal_ticks;
        let job_batch = batch.clone();
        let job = tokio::task::spawn_blocking(move || -> substrate_store::Result<u64> {
            let store = lock(&store)?;
            let seq = store.commit(&state, &job_batch)?;
            if let Some(keep) = journal_ticks
                && state.tick > keep
            {
                store.prune_deltas(state.tick - keep)?;
            }
            Ok(seq)
        });

        let failure = match tokio::time::timeout(self.options.persist_timeout, job).await {
            Ok(Ok(Ok(seq))) => {
                self.seq = seq;
                self.publish(&batch).await;
                return Ok(());
            }
            Ok(Ok(Err(e))) => format!("store commit failed: {e}"),
            Ok(Err(e)) => format!("store task failed: {e}"),
            Err(_) => format!(
                "store commit timed out after {}ms",
                self.options.persist_timeout.as_millis()
            ),
        };
        warn!(tenant = %self.tenant, tick = batch.tick, reason = %failure, "commit not confirmed");
        self.resync(batch).await.map_err(|()| failure)
    }

    /// Reload from the store after an unconfirmed commit. The store lock
    /// serializes this behind a commit that is still running, so the result
    /// says definitively whether it landed.
    async fn resync(&mut self, batch: Batch) -> Result<(), ()> {
        let expected = self.seq + 1;
        let store = Arc::clone(&self.store);
        let loaded = tokio::task::spawn_blocking(
            move || -> substrate_store::Result<(PartitionState, u64)> {
                let store = lock(&store)?;
                Ok((store.load_partition()?, store.commit_seq()?))
            },
        )
        .await;

        match loaded {
            Ok(Ok((_, seq))) if seq == expected => {
                info!(tenant = %self.tenant, seq, "late commit landed; publishing");
                self.seq = seq;
                self.publish(&batch).await;
                Ok(())
            }
            Ok(Ok((mut state, seq))) => {
                state.tenant = self.tenant.clone();
                self.engine = EngineInstance::restore(self.options.engine.clone(), state);
                self.seq = seq;
                warn!(
                    tenant = %self.tenant,
                    tick = self.engine.tick_count(),
                    "in-memory changes discarded; resynced from store"
                );
                Err(())
            }
            Ok(Err(e)) => {
                error!(tenant = %self.tenant, error = %e, "resync failed; keeping in-memory state");
                Err(())
            }
            Err(e) => {
                error!(tenant = %self.tenant, error = %e, "resync task failed");
                Err(())
            }
        }
    }

    async fn publish(&self, batch: &Batch) {
        debug!(
            tenant = %self.tenant,
            tick = batch.tick,
            deltas = batch.deltas.len(),
            events = batch.events.len(),
            "publishing batch"
        );
        for line in batch_lines(batch) {
            self.emit(line).await;
        }
    }

    async fn emit(&self, line: String) {
        // a closed writer means shutdown is under way
        let _ = self.out.send(line).await;
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ErrorBody> {
    serde_json::to_value(value).map_err(|e| ErrorBody::new("internal", e.to_string(), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_request;

    fn options() -> WorkerOptions {
        WorkerOptions {
            engine: EngineConfig::default(),
            persist_timeout: Duration::from_secs(5),
            max_group: 16,
            journal_ticks: None,
        }
    }

    fn worker(dir: &TenantDirectory) -> (Worker, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(1024);
        (load(dir, "alice", options(), tx).unwrap(), rx)
    }

    fn request(line: &str) -> Request {
        parse_request(line).unwrap()
    }

    fn drain_lines(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(serde_json::from_str(&line).unwrap());
        }
        lines
    }

    #[tokio::test]
    async fn test_group_commits_before_replying() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = TenantDirectory::new(Some(tmp.path()));
        let (mut w, mut out) = worker(&dir);
        let (tx, mut rx) = mpsc::channel(16);

        tx.send(request(r#"{"tenant":"alice","op":"upsert_node","node":{"key":"b"}}"#))
            .await
            .unwrap();
        let first = request(r#"{"id":1,"tenant":"alice","op":"upsert_node","node":{"key":"a"}}"#);
        w.handle_group(first, &mut rx).await;

        let lines = drain_lines(&mut out);
        let deltas = lines.iter().filter(|l| l.get("delta").is_some()).count();
        let replies: Vec<&Value> = lines.iter().filter(|l| l.get("ok").is_some()).collect();
        assert_eq!(deltas, 2);
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r["ok"] == true));
        // deltas precede replies
        assert!(lines[0].get("delta").is_some());

        let store = dir.open("alice").unwrap();
        assert_eq!(store.stats().unwrap().open_nodes, 2);
        assert_eq!(store.commit_seq().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_op_replies_error_without_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = TenantDirectory::new(Some(tmp.path()));
        let (mut w, mut out) = worker(&dir);
        let (_tx, mut rx) = mpsc::channel(1);

        let bad = request(r#"{"tenant":"alice","op":"close_node","node":42}"#);
        w.handle_group(bad, &mut rx).await;

        let lines = drain_lines(&mut out);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["ok"], false);
        assert_eq!(lines[0]["error"]["kind"], "stale_reference");
        assert_eq!(dir.open("alice").unwrap().commit_seq().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tick_request_is_durable() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = TenantDirectory::new(Some(tmp.path()));
        let (mut w, mut out) = worker(&dir);
        let (tx, mut rx) = mpsc::channel(16);

        for line in [
            r#"{"tenant":"alice","op":"upsert_node","node":{"key":"b"}}"#,
            r#"{"tenant":"alice","op":"upsert_edge","edge":{"source":0,"target":1,"weight":0.8}}"#,
            r#"{"tenant":"alice","op":"propose_entity","role":"focus","seeds":[0,1]}"#,
            r#"{"tenant":"alice","op":"inject_energy","entity":0,"node":0,"amount":0.9}"#,
            r#"{"id":"t","tenant":"alice","op":"tick"}"#,
        ] {
            tx.send(request(line)).await.unwrap();
        }
        let first = request(r#"{"tenant":"alice","op":"upsert_node","node":{"key":"a"}}"#);
        assert!(w.handle_group(first, &mut rx).await);

        let lines = drain_lines(&mut out);
        let tick_reply = lines.iter().find(|l| l["id"] == "t").unwrap();
        assert_eq!(tick_reply["ok"], true, "{tick_reply}");
        assert_eq!(tick_reply["result"]["tick"], 1);
        assert!(lines.iter().any(|l| l["event"]["type"] == "entity.created"));

        let store = dir.open("alice").unwrap();
        assert_eq!(store.tick().unwrap(), 1);
        assert_eq!(store.commit_seq().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resync_discards_unconfirmed_work() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = TenantDirectory::new(Some(tmp.path()));
        let (mut w, _out) = worker(&dir);

        w.engine
            .upsert_node(substrate_core::NodeSpec::new("ghost"), None, 0)
            .unwrap();
        let batch = w.engine.drain();
        assert!(w.resync(batch).await.is_err());
        assert!(w.engine.resolve("ghost").is_err());
    }
}
