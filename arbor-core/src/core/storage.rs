//! SQLite connection and schema management for a replica database.

use crate::{ArborError, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

/// Tables every replica database must contain.
const REQUIRED_TABLES: [&str; 9] = [
    "notes",
    "branches",
    "attributes",
    "revisions",
    "attachments",
    "blobs",
    "options",
    "entity_changes",
    "replica_meta",
];

pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Validate database structure
        let placeholders = vec!["?"; REQUIRED_TABLES.len()].join(", ");
        let table_count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ({placeholders})"
            ),
            rusqlite::params_from_iter(REQUIRED_TABLES.iter()),
            |row| row.get(0),
        )?;

        if table_count != REQUIRED_TABLES.len() as i64 {
            return Err(ArborError::InvalidReplica(
                "Not a valid Arbor replica database".to_string(),
            ));
        }

        // Migrate: older replicas kept no index on entity ids
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_entity_changes_entity_id ON entity_changes (entity_id)",
            [],
        )?;

        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Reads a value from the `replica_meta` table.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM replica_meta WHERE key = ?",
            [key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

/// Inserts or replaces a value in the `replica_meta` table.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO replica_meta (key, value) VALUES (?, ?)",
        [key, value],
    )?;
    Ok(())
}
