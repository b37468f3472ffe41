use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // Checkpoint every ~400KB; each tick rewrites the partition
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Fold any stale WAL into the main file. Fails harmlessly in memory.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::info!("startup WAL checkpoint complete");
    }

    // Every versioned record carries the four bitemporal columns. `is_current`
    // marks the version held in the live partition; 0 rows are superseded
    // versions kept for point-in-time reads.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS nodes (
            row_id        INTEGER PRIMARY KEY AUTOINCREMENT,
            id            INTEGER NOT NULL,
            key           TEXT NOT NULL,
            label         TEXT NOT NULL DEFAULT '',
            energies      TEXT NOT NULL DEFAULT '{}',
            base_weight   REAL NOT NULL,
            decay_rate    REAL NOT NULL,
            size          INTEGER NOT NULL DEFAULT 1,
            embedding     TEXT,
            valid_from    INTEGER NOT NULL,
            valid_to      INTEGER,
            recorded_from INTEGER NOT NULL,
            recorded_to   INTEGER,
            is_current    INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS edges (
            row_id        INTEGER PRIMARY KEY AUTOINCREMENT,
            id            INTEGER NOT NULL,
            source        INTEGER NOT NULL,
            target        INTEGER NOT NULL,
            kind          TEXT NOT NULL,
            weight        REAL NOT NULL,
            valence       TEXT,
            valid_from    INTEGER NOT NULL,
            valid_to      INTEGER,
            recorded_from INTEGER NOT NULL,
            recorded_to   INTEGER,
            is_current    INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS entities (
            row_id        INTEGER PRIMARY KEY AUTOINCREMENT,
            id            INTEGER NOT NULL,
            role          TEXT NOT NULL,
            state         TEXT NOT NULL,
            body          TEXT NOT NULL,
            valid_from    INTEGER NOT NULL,
            valid_to      INTEGER,
            recorded_from INTEGER NOT NULL,
            recorded_to   INTEGER,
            is_current    INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS goals (
            entity_id INTEGER PRIMARY KEY,
            embedding TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS deltas (
            seq  INTEGER PRIMARY KEY AUTOINCREMENT,
            tick INTEGER NOT NULL,
            kind TEXT NOT NULL,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS lifecycle_events (
            id   TEXT PRIMARY KEY,
            tick INTEGER NOT NULL,
            name TEXT NOT NULL,
            at   INTEGER NOT NULL,
            body TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_nodes_id ON nodes(id);
        CREATE INDEX IF NOT EXISTS idx_nodes_key ON nodes(key);
        CREATE INDEX IF NOT EXISTS idx_edges_id ON edges(id);
        CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target);
        CREATE INDEX IF NOT EXISTS idx_entities_id ON entities(id);
        CREATE INDEX IF NOT EXISTS idx_deltas_tick ON deltas(tick);
        CREATE INDEX IF NOT EXISTS idx_events_tick ON lifecycle_events(tick);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        for table in &[
            "metadata",
            "nodes",
            "edges",
            "entities",
            "goals",
            "deltas",
            "lifecycle_events",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "table {table} should exist and be empty");
        }
    }

    #[test]
    fn test_schema_version_set() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_idempotent_initialize() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
    }

    #[test]
    fn test_pragmas() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        // in-memory databases report "memory"
        assert!(mode == "memory" || mode == "wal", "got mode: {mode}");

        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 5000);

        let threshold: i64 = conn
            .query_row("PRAGMA wal_autocheckpoint", [], |row| row.get(0))
            .unwrap();
        assert_eq!(threshold, 100);
    }
}
