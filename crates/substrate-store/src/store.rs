use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use substrate_core::{
    AsOf, Batch, Bitemporal, Cohorts, Delta, Edge, EdgeKind, EdgeId, Entity, EntityId,
    EntitySnapshot, GraphSnapshot, LifecycleEvent, Node, NodeId, PartitionState,
};

use crate::error::{Result, StoreError};
use crate::schema;

const NODE_COLUMNS: &str = "id, key, label, energies, base_weight, decay_rate, size, embedding, \
     valid_from, valid_to, recorded_from, recorded_to";
const EDGE_COLUMNS: &str =
    "id, source, target, kind, weight, valence, valid_from, valid_to, recorded_from, recorded_to";

// Mirrors `Bitemporal::matches`: half-open intervals on both axes.
const AS_OF_CLAUSE: &str = "valid_from <= ?2 AND (valid_to IS NULL OR ?2 < valid_to) \
     AND recorded_from <= ?3 AND (recorded_to IS NULL OR ?3 < recorded_to)";

/// Row counts for `substrate stats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub tenant: String,
    pub tick: u64,
    pub open_nodes: u64,
    pub open_edges: u64,
    pub live_entities: u64,
    pub node_versions: u64,
    pub edge_versions: u64,
    pub entity_versions: u64,
    pub deltas: u64,
    pub lifecycle_events: u64,
    pub schema_version: i64,
}

/// One tenant partition in one SQLite file.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let result = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(result)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata_on(&self.conn, key, value)
    }

    pub fn tick(&self) -> Result<u64> {
        self.metadata_u64("tick")
    }

    fn metadata_u64(&self, key: &str) -> Result<u64> {
        match self.get_metadata(key)? {
            Some(v) => v
                .parse()
                .map_err(|e| StoreError::InvalidData(format!("invalid {key} '{v}': {e}"))),
            None => Ok(0),
        }
    }

    // --- Save ---

    /// Replace the stored partition with `state`.
    pub fn save_partition(&self, state: &PartitionState) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        write_partition(&tx, state)?;
        tx.commit()?;
        Ok(())
    }

    /// Persist a tick: the partition after the tick plus the batch it
    /// produced, in one transaction. Either both land or neither does.
    ///
    /// Returns the new commit sequence number, which lets a caller that
    /// gave up waiting find out later whether the commit landed.
    pub fn commit(&self, state: &PartitionState, batch: &Batch) -> Result<u64> {
        let seq = self.commit_seq()? + 1;
        let tx = self.conn.unchecked_transaction()?;
        write_partition(&tx, state)?;
        append_journal(&tx, batch)?;
        set_metadata_on(&tx, "commit_seq", &seq.to_string())?;
        tx.commit()?;
        tracing::debug!(
            tenant = %state.tenant,
            tick = state.tick,
            seq,
            deltas = batch.deltas.len(),
            events = batch.events.len(),
            "partition committed"
        );
        Ok(seq)
    }

    /// Number of successful `commit` calls over the life of this database.
    pub fn commit_seq(&self) -> Result<u64> {
        self.metadata_u64("commit_seq")
    }

    // --- Load ---

    pub fn load_partition(&self) -> Result<PartitionState> {
        let tenant = self.get_metadata("tenant")?.unwrap_or_default();
        let tick = self.tick()?;
        let cohorts = match self.get_metadata("cohorts")? {
            Some(json) => Some(serde_json::from_str::<Cohorts>(&json)?),
            None => None,
        };

        let graph = GraphSnapshot {
            nodes: self.load_nodes(true)?,
            edges: self.load_edges(true)?,
            node_history: self.load_nodes(false)?,
            edge_history: self.load_edges(false)?,
        };
        let entities = EntitySnapshot {
            entities: self.load_entities(true)?,
            history: self.load_entities(false)?,
        };

        Ok(PartitionState {
            tenant,
            tick,
            graph,
            entities,
            cohorts,
            goals: self.load_goals()?,
        })
    }

    fn load_nodes(&self, current: bool) -> Result<Vec<Node>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE is_current = ?1 ORDER BY row_id"
        ))?;
        let raw: Vec<RawNode> = stmt
            .query_map([current as i32], RawNode::from_row)?
            .collect::<std::result::Result<_, _>>()?;
        raw.into_iter().map(RawNode::into_node).collect()
    }

    fn load_edges(&self, current: bool) -> Result<Vec<Edge>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM edges WHERE is_current = ?1 ORDER BY row_id"
        ))?;
        let raw: Vec<RawEdge> = stmt
            .query_map([current as i32], RawEdge::from_row)?
            .collect::<std::result::Result<_, _>>()?;
        raw.into_iter().map(RawEdge::into_edge).collect()
    }

    fn load_entities(&self, current: bool) -> Result<Vec<Entity>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM entities WHERE is_current = ?1 ORDER BY row_id")?;
        let bodies: Vec<String> = stmt
            .query_map([current as i32], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    fn load_goals(&self) -> Result<BTreeMap<EntityId, Vec<f32>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_id, embedding FROM goals ORDER BY entity_id")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter()
            .map(|(id, json)| -> Result<(EntityId, Vec<f32>)> {
                Ok((EntityId(id as u64), serde_json::from_str(&json)?))
            })
            .collect()
    }

    // --- Point-in-time reads ---

    /// The version of node `id` selected by `as_of`, answered in SQL.
    pub fn get_node_as_of(&self, id: NodeId, as_of: AsOf) -> Result<Option<Node>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1 AND {AS_OF_CLAUSE} \
             ORDER BY is_current DESC, row_id DESC LIMIT 1"
        ))?;
        let raw = stmt
            .query_row(
                params![id.raw() as i64, as_of.valid, as_of.recorded],
                RawNode::from_row,
            )
            .optional()?;
        raw.map(RawNode::into_node).transpose()
    }

    /// The node bound to `key` at `as_of`. A key can be rebound to a new id
    /// after its node was closed, so this may differ from the current binding.
    pub fn get_node_by_key_as_of(&self, key: &str, as_of: AsOf) -> Result<Option<Node>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE key = ?1 AND {AS_OF_CLAUSE} \
             ORDER BY is_current DESC, row_id DESC LIMIT 1"
        ))?;
        let raw = stmt
            .query_row(params![key, as_of.valid, as_of.recorded], RawNode::from_row)
            .optional()?;
        raw.map(RawNode::into_node).transpose()
    }

    pub fn get_edge_as_of(&self, id: EdgeId, as_of: AsOf) -> Result<Option<Edge>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM edges WHERE id = ?1 AND {AS_OF_CLAUSE} \
             ORDER BY is_current DESC, row_id DESC LIMIT 1"
        ))?;
        let raw = stmt
            .query_row(
                params![id.raw() as i64, as_of.valid, as_of.recorded],
                RawEdge::from_row,
            )
            .optional()?;
        raw.map(RawEdge::into_edge).transpose()
    }

    pub fn get_entity_as_of(&self, id: EntityId, as_of: AsOf) -> Result<Option<Entity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT body FROM entities WHERE id = ?1 AND {AS_OF_CLAUSE} \
             ORDER BY is_current DESC, row_id DESC LIMIT 1"
        ))?;
        let body: Option<String> = stmt
            .query_row(params![id.raw() as i64, as_of.valid, as_of.recorded], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    // --- Journal ---

    /// Most recent lifecycle events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<LifecycleEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM lifecycle_events ORDER BY rowid DESC LIMIT ?1")?;
        let bodies: Vec<String> = stmt
            .query_map([limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    /// Journaled deltas from ticks after `tick`, in emission order.
    pub fn deltas_since(&self, tick: u64) -> Result<Vec<(u64, Delta)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tick, body FROM deltas WHERE tick > ?1 ORDER BY seq")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map([tick as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter()
            .map(|(t, body)| -> Result<(u64, Delta)> { Ok((t as u64, serde_json::from_str(&body)?)) })
            .collect()
    }

    /// Drop journaled deltas older than `before_tick`. Lifecycle events are
    /// an audit trail and are never pruned.
    pub fn prune_deltas(&self, before_tick: u64) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM deltas WHERE tick < ?1", [before_tick as i64])?;
        if removed > 0 {
            tracing::debug!(removed, before_tick, "pruned delta journal");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            tenant: self.get_metadata("tenant")?.unwrap_or_default(),
            tick: self.tick()?,
            open_nodes: count(
                "SELECT COUNT(*) FROM nodes WHERE is_current = 1 AND recorded_to IS NULL",
            )?,
            open_edges: count(
                "SELECT COUNT(*) FROM edges WHERE is_current = 1 AND recorded_to IS NULL",
            )?,
            live_entities: count(
                "SELECT COUNT(*) FROM entities WHERE is_current = 1 \
                 AND state IN ('provisional', 'established')",
            )?,
            node_versions: count("SELECT COUNT(*) FROM nodes")?,
            edge_versions: count("SELECT COUNT(*) FROM edges")?,
            entity_versions: count("SELECT COUNT(*) FROM entities")?,
            deltas: count("SELECT COUNT(*) FROM deltas")?,
            lifecycle_events: count("SELECT COUNT(*) FROM lifecycle_events")?,
            schema_version: schema::get_schema_version(&self.conn)?.unwrap_or(0),
        })
    }
}

fn set_metadata_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn write_partition(conn: &Connection, state: &PartitionState) -> Result<()> {
    conn.execute_batch(
        "DELETE FROM nodes; DELETE FROM edges; DELETE FROM entities; DELETE FROM goals;",
    )?;

    set_metadata_on(conn, "tenant", &state.tenant)?;
    set_metadata_on(conn, "tick", &state.tick.to_string())?;
    match &state.cohorts {
        Some(cohorts) => set_metadata_on(conn, "cohorts", &serde_json::to_string(cohorts)?)?,
        None => {
            conn.execute("DELETE FROM metadata WHERE key = 'cohorts'", [])?;
        }
    }

    for node in &state.graph.nodes {
        insert_node(conn, node, true)?;
    }
    for node in &state.graph.node_history {
        insert_node(conn, node, false)?;
    }
    for edge in &state.graph.edges {
        insert_edge(conn, edge, true)?;
    }
    for edge in &state.graph.edge_history {
        insert_edge(conn, edge, false)?;
    }
    for entity in &state.entities.entities {
        insert_entity(conn, entity, true)?;
    }
    for entity in &state.entities.history {
        insert_entity(conn, entity, false)?;
    }

    let mut goal_stmt =
        conn.prepare_cached("INSERT INTO goals (entity_id, embedding) VALUES (?1, ?2)")?;
    for (entity, goal) in &state.goals {
        goal_stmt.execute(params![entity.raw() as i64, serde_json::to_string(goal)?])?;
    }
    Ok(())
}

fn insert_node(conn: &Connection, node: &Node, current: bool) -> Result<()> {
    let embedding = node
        .embedding
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO nodes (id, key, label, energies, base_weight, decay_rate, size, embedding,
                            valid_from, valid_to, recorded_from, recorded_to, is_current)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )?;
    stmt.execute(params![
        node.id.raw() as i64,
        node.key,
        node.label,
        serde_json::to_string(&node.energies)?,
        node.base_weight,
        node.decay_rate,
        node.size,
        embedding,
        node.temporal.valid_from,
        node.temporal.valid_to,
        node.temporal.recorded_from,
        node.temporal.recorded_to,
        current as i32,
    ])?;
    Ok(())
}

fn insert_edge(conn: &Connection, edge: &Edge, current: bool) -> Result<()> {
    let valence = edge
        .valence
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO edges (id, source, target, kind, weight, valence,
                            valid_from, valid_to, recorded_from, recorded_to, is_current)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    stmt.execute(params![
        edge.id.raw() as i64,
        edge.source.raw() as i64,
        edge.target.raw() as i64,
        edge.kind.as_str(),
        edge.weight,
        valence,
        edge.temporal.valid_from,
        edge.temporal.valid_to,
        edge.temporal.recorded_from,
        edge.temporal.recorded_to,
        current as i32,
    ])?;
    Ok(())
}

fn insert_entity(conn: &Connection, entity: &Entity, current: bool) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO entities (id, role, state, body,
                               valid_from, valid_to, recorded_from, recorded_to, is_current)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    stmt.execute(params![
        entity.id.raw() as i64,
        entity.role,
        entity.state.as_str(),
        serde_json::to_string(entity)?,
        entity.temporal.valid_from,
        entity.temporal.valid_to,
        entity.temporal.recorded_from,
        entity.temporal.recorded_to,
        current as i32,
    ])?;
    Ok(())
}

fn append_journal(conn: &Connection, batch: &Batch) -> Result<()> {
    let mut delta_stmt =
        conn.prepare_cached("INSERT INTO deltas (tick, kind, body) VALUES (?1, ?2, ?3)")?;
    for delta in &batch.deltas {
        delta_stmt.execute(params![
            batch.tick as i64,
            delta.kind(),
            serde_json::to_string(delta)?
        ])?;
    }

    let mut event_stmt = conn.prepare_cached(
        "INSERT INTO lifecycle_events (id, tick, name, at, body) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for event in &batch.events {
        event_stmt.execute(params![
            event.id.to_string(),
            batch.tick as i64,
            event.name(),
            event.at,
            serde_json::to_string(event)?
        ])?;
    }
    Ok(())
}

fn read_temporal(row: &Row<'_>, offset: usize) -> rusqlite::Result<Bitemporal> {
    Ok(Bitemporal {
        valid_from: row.get(offset)?,
        valid_to: row.get(offset + 1)?,
        recorded_from: row.get(offset + 2)?,
        recorded_to: row.get(offset + 3)?,
    })
}

/// Column values before JSON decoding, which cannot fail inside a rusqlite
/// row closure.
struct RawNode {
    id: i64,
    key: String,
    label: String,
    energies: String,
    base_weight: f64,
    decay_rate: f64,
    size: u32,
    embedding: Option<String>,
    temporal: Bitemporal,
}

impl RawNode {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            key: row.get(1)?,
            label: row.get(2)?,
            energies: row.get(3)?,
            base_weight: row.get(4)?,
            decay_rate: row.get(5)?,
            size: row.get(6)?,
            embedding: row.get(7)?,
            temporal: read_temporal(row, 8)?,
        })
    }

    fn into_node(self) -> Result<Node> {
        Ok(Node {
            id: NodeId(self.id as u64),
            key: self.key,
            label: self.label,
            energies: serde_json::from_str(&self.energies)?,
            base_weight: self.base_weight,
            decay_rate: self.decay_rate,
            size: self.size,
            embedding: self
                .embedding
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            temporal: self.temporal,
        })
    }
}

struct RawEdge {
    id: i64,
    source: i64,
    target: i64,
    kind: String,
    weight: f64,
    valence: Option<String>,
    temporal: Bitemporal,
}

impl RawEdge {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            target: row.get(2)?,
            kind: row.get(3)?,
            weight: row.get(4)?,
            valence: row.get(5)?,
            temporal: read_temporal(row, 6)?,
        })
    }

    fn into_edge(self) -> Result<Edge> {
        Ok(Edge {
            id: EdgeId(self.id as u64),
            source: NodeId(self.source as u64),
            target: NodeId(self.target as u64),
            kind: EdgeKind::from_str_lossy(&self.kind),
            weight: self.weight,
            valence: self
                .valence
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            temporal: self.temporal,
        })
    }
}
