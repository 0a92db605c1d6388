//! The entity change log: one ledger row per replicated entity.
//!
//! Every mutation of a replicated row records (or replaces) its ledger row in
//! the same transaction, assigning a fresh `sequence_id`. The ledger is what
//! push and pull walk, and what the content hash verifier digests.

use crate::core::entity::{self, EntityKind, EntityRow};
use crate::Result;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Default serialised size at which a wire batch stops accumulating.
pub const DEFAULT_WIRE_BUDGET: usize = 1_000_000;

/// Maximum number of ledger rows read for one outgoing batch.
pub const CHANGE_BATCH_SIZE: usize = 1_000;

/// The latest known mutation of one replicated entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    /// Local, strictly increasing position in the ledger; never reused.
    pub sequence_id: i64,
    pub entity_type: EntityKind,
    pub entity_id: String,
    /// Hash of the stored row; frozen once the entity is erased.
    pub content_hash: String,
    /// Replica that produced this version.
    pub origin_instance_id: String,
    /// Whether the row replicates at all (local-only options do not).
    pub is_synced: bool,
    /// Tombstone flag: the content is gone, the row stays.
    pub is_erased: bool,
    /// Unix timestamp (milliseconds) of the mutation.
    pub changed_at: i64,
}

/// Everything needed to record a ledger row except its sequence id.
#[derive(Debug, Clone)]
pub struct NewChange<'a> {
    pub entity_type: EntityKind,
    pub entity_id: &'a str,
    pub content_hash: &'a str,
    pub origin_instance_id: &'a str,
    pub is_synced: bool,
    pub is_erased: bool,
    pub changed_at: i64,
}

/// A ledger row ready for transfer, with the entity inlined unless erased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChange {
    pub change: EntityChange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRow>,
}

/// Output of [`ChangeLog::project_for_wire`].
#[derive(Debug, Clone, Default)]
pub struct WireBatch {
    pub records: Vec<WireChange>,
    /// Sequence id of the last change examined, sent or skipped.
    pub last_sequence_id: Option<i64>,
    /// Whether the batch stopped early because it reached the size budget.
    pub truncated: bool,
    /// Serialised size of the accumulated records, in bytes.
    pub size: usize,
}

/// Changes ready to send to one peer, see [`ChangeLog::outgoing`].
#[derive(Debug, Clone, Default)]
pub struct Outgoing {
    pub records: Vec<WireChange>,
    /// Sequence id the sender's watermark advances to once `records` are delivered.
    pub last_sequence_id: i64,
    /// Replicated rows still waiting after `last_sequence_id`.
    pub outstanding_count: i64,
}

const CHANGE_COLUMNS: &str = "sequence_id, entity_type, entity_id, content_hash, \
     origin_instance_id, is_synced, is_erased, changed_at";

fn map_change_row(row: &Row) -> rusqlite::Result<EntityChange> {
    let entity_type: String = row.get(1)?;
    let entity_type = entity_type.parse::<EntityKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(EntityChange {
        sequence_id: row.get(0)?,
        entity_type,
        entity_id: row.get(2)?,
        content_hash: row.get(3)?,
        origin_instance_id: row.get(4)?,
        is_synced: row.get::<_, i64>(5)? != 0,
        is_erased: row.get::<_, i64>(6)? != 0,
        changed_at: row.get(7)?,
    })
}

/// Reads and writes the `entity_changes` table.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    wire_budget: usize,
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeLog {
    /// Creates a change log with the default 1 MB wire budget.
    pub fn new() -> Self {
        Self {
            wire_budget: DEFAULT_WIRE_BUDGET,
        }
    }

    /// Creates a change log whose wire batches stop at `wire_budget` bytes.
    pub fn with_wire_budget(wire_budget: usize) -> Self {
        Self { wire_budget }
    }

    /// Records the latest state of an entity, replacing its previous row.
    ///
    /// The replacement always receives a new, larger sequence id. Call this in
    /// the same transaction as the entity mutation it describes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ArborError::Database`] if the INSERT fails.
    pub fn record_change(&self, conn: &Connection, change: &NewChange<'_>) -> Result<EntityChange> {
        conn.execute(
            "INSERT OR REPLACE INTO entity_changes
                (entity_type, entity_id, content_hash, origin_instance_id, is_synced, is_erased, changed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                change.entity_type.as_str(),
                change.entity_id,
                change.content_hash,
                change.origin_instance_id,
                change.is_synced,
                change.is_erased,
                change.changed_at,
            ],
        )?;

        Ok(EntityChange {
            sequence_id: conn.last_insert_rowid(),
            entity_type: change.entity_type,
            entity_id: change.entity_id.to_string(),
            content_hash: change.content_hash.to_string(),
            origin_instance_id: change.origin_instance_id.to_string(),
            is_synced: change.is_synced,
            is_erased: change.is_erased,
            changed_at: change.changed_at,
        })
    }

    /// Returns the ledger row of one entity, if any.
    pub fn get(&self, conn: &Connection, kind: EntityKind, entity_id: &str) -> Result<Option<EntityChange>> {
        let change = conn
            .query_row(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM entity_changes WHERE entity_type = ? AND entity_id = ?"
                ),
                [kind.as_str(), entity_id],
                map_change_row,
            )
            .optional()?;
        Ok(change)
    }

    /// Returns up to `limit` replicated rows with a sequence id above `sequence_id`, ascending.
    pub fn changes_since(&self, conn: &Connection, sequence_id: i64, limit: usize) -> Result<Vec<EntityChange>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM entity_changes
             WHERE is_synced = 1 AND sequence_id > ?
             ORDER BY sequence_id ASC LIMIT ?"
        ))?;
        let changes = stmt
            .query_map(rusqlite::params![sequence_id, limit as i64], map_change_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    /// Highest sequence id among replicated rows, or 0 for an empty ledger.
    pub fn max_sequence_id(&self, conn: &Connection) -> Result<i64> {
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(sequence_id) FROM entity_changes WHERE is_synced = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// Number of replicated rows with a sequence id above `sequence_id`.
    pub fn outstanding_after(&self, conn: &Connection, sequence_id: i64) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM entity_changes WHERE is_synced = 1 AND sequence_id > ?",
            [sequence_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Turns the rows of `entity_ids` into tombstones.
    ///
    /// The content hash is preserved; `changed_at` is stamped with `now` and
    /// the row is re-sequenced so the tombstone itself replicates. Returns the
    /// number of rows that were transitioned.
    pub fn mark_erased(
        &self,
        conn: &Connection,
        kind: EntityKind,
        entity_ids: &[String],
        origin_instance_id: &str,
        now: i64,
    ) -> Result<usize> {
        let mut erased = 0;
        for entity_id in entity_ids {
            let Some(existing) = self.get(conn, kind, entity_id)? else {
                continue;
            };
            if existing.is_erased {
                continue;
            }
            self.record_change(
                conn,
                &NewChange {
                    entity_type: kind,
                    entity_id,
                    content_hash: &existing.content_hash,
                    origin_instance_id,
                    is_synced: existing.is_synced,
                    is_erased: true,
                    changed_at: now,
                },
            )?;
            erased += 1;
        }
        Ok(erased)
    }

    /// Removes a ledger row entirely. Only used for content-addressed blobs.
    pub fn remove(&self, conn: &Connection, kind: EntityKind, entity_id: &str) -> Result<bool> {
        let removed = conn.execute(
            "DELETE FROM entity_changes WHERE entity_type = ? AND entity_id = ?",
            [kind.as_str(), entity_id],
        )?;
        Ok(removed > 0)
    }

    /// Serialises `changes` into transferable records.
    ///
    /// Live entities are inlined as rows (binary columns base64 encoded);
    /// erased ones travel as bare tombstones. Accumulation stops after the
    /// record that pushes the batch past the wire budget, and the caller
    /// resumes from the following sequence id. A change whose entity has
    /// vanished (erased concurrently) is logged and skipped.
    pub fn project_for_wire(&self, conn: &Connection, changes: &[EntityChange]) -> Result<WireBatch> {
        let mut batch = WireBatch::default();

        for (idx, change) in changes.iter().enumerate() {
            batch.last_sequence_id = Some(change.sequence_id);

            let entity = if change.is_erased {
                None
            } else {
                match entity::load_row(conn, change.entity_type, &change.entity_id)? {
                    Some(row) => Some(row),
                    None => {
                        log::warn!(
                            "Skipping change {} : {} {} no longer exists",
                            change.sequence_id,
                            change.entity_type,
                            change.entity_id
                        );
                        continue;
                    }
                }
            };

            let record = WireChange {
                change: change.clone(),
                entity,
            };
            batch.size += serde_json::to_vec(&record)?.len();
            batch.records.push(record);

            if batch.size > self.wire_budget {
                batch.truncated = idx + 1 < changes.len();
                break;
            }
        }

        Ok(batch)
    }

    /// Collects the next batch to send past `since`.
    ///
    /// Reads up to `limit` rows, drops those originating from `peer_instance_id`
    /// (the peer already has them) and projects the rest. The returned
    /// watermark covers every row read, dropped ones included, unless the wire
    /// budget cut the batch short, in which case it stops at the last row
    /// projected. An empty ledger tail yields `since` itself.
    pub fn outgoing(
        &self,
        conn: &Connection,
        since: i64,
        peer_instance_id: Option<&str>,
        limit: usize,
    ) -> Result<Outgoing> {
        let changes = self.changes_since(conn, since, limit)?;
        let last_read = changes.last().map_or(since, |c| c.sequence_id);

        let to_send: Vec<EntityChange> = changes
            .into_iter()
            .filter(|c| Some(c.origin_instance_id.as_str()) != peer_instance_id)
            .collect();
        let batch = self.project_for_wire(conn, &to_send)?;

        let last_sequence_id = match batch.last_sequence_id {
            Some(last) if batch.truncated => last,
            _ => last_read,
        };
        Ok(Outgoing {
            records: batch.records,
            last_sequence_id,
            outstanding_count: self.outstanding_after(conn, last_sequence_id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn new_change<'a>(kind: EntityKind, id: &'a str, hash: &'a str) -> NewChange<'a> {
        NewChange {
            entity_type: kind,
            entity_id: id,
            content_hash: hash,
            origin_instance_id: "inst-local",
            is_synced: true,
            is_erased: false,
            changed_at: 1_000,
        }
    }

    #[test]
    fn test_record_replaces_and_advances_sequence() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let log = ChangeLog::new();

        let first = log.record_change(conn, &new_change(EntityKind::Note, "n1", "h1")).unwrap();
        let other = log.record_change(conn, &new_change(EntityKind::Note, "n2", "hx")).unwrap();
        let second = log.record_change(conn, &new_change(EntityKind::Note, "n1", "h2")).unwrap();

        assert!(other.sequence_id > first.sequence_id);
        assert!(second.sequence_id > other.sequence_id);

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entity_changes WHERE entity_id = 'n1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(log.get(conn, EntityKind::Note, "n1").unwrap().unwrap().content_hash, "h2");
    }

    #[test]
    fn test_sequence_ids_are_never_reused() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let log = ChangeLog::new();

        let a = log.record_change(conn, &new_change(EntityKind::Blob, "b1", "h")).unwrap();
        log.remove(conn, EntityKind::Blob, "b1").unwrap();
        let b = log.record_change(conn, &new_change(EntityKind::Blob, "b2", "h")).unwrap();
        assert!(b.sequence_id > a.sequence_id);
    }

    #[test]
    fn test_changes_since_is_ordered_and_skips_local_only_rows() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let log = ChangeLog::new();

        let a = log.record_change(conn, &new_change(EntityKind::Note, "a", "h")).unwrap();
        let mut local_only = new_change(EntityKind::Option, "syncProxy", "h");
        local_only.is_synced = false;
        log.record_change(conn, &local_only).unwrap();
        let c = log.record_change(conn, &new_change(EntityKind::Note, "c", "h")).unwrap();

        let all = log.changes_since(conn, 0, 10).unwrap();
        assert_eq!(
            all.iter().map(|c| c.entity_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        let after_a = log.changes_since(conn, a.sequence_id, 10).unwrap();
        assert_eq!(after_a.len(), 1);
        assert_eq!(after_a[0].sequence_id, c.sequence_id);
        assert_eq!(log.changes_since(conn, 0, 1).unwrap().len(), 1);
        assert_eq!(log.max_sequence_id(conn).unwrap(), c.sequence_id);
        assert_eq!(log.outstanding_after(conn, a.sequence_id).unwrap(), 1);
    }

    #[test]
    fn test_mark_erased_preserves_hash() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let log = ChangeLog::new();

        let before = log.record_change(conn, &new_change(EntityKind::Note, "n1", "frozen")).unwrap();
        let erased = log
            .mark_erased(conn, EntityKind::Note, &["n1".to_string(), "ghost".to_string()], "inst-local", 5_000)
            .unwrap();
        assert_eq!(erased, 1);

        let after = log.get(conn, EntityKind::Note, "n1").unwrap().unwrap();
        assert!(after.is_erased);
        assert_eq!(after.content_hash, "frozen");
        assert_eq!(after.changed_at, 5_000);
        assert!(after.sequence_id > before.sequence_id);

        // Already a tombstone: nothing changes.
        assert_eq!(
            log.mark_erased(conn, EntityKind::Note, &["n1".to_string()], "inst-local", 9_000).unwrap(),
            0
        );
    }

    #[test]
    fn test_project_for_wire_skips_missing_entities() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let log = ChangeLog::new();

        let row = json!({ "blob_id": "b1", "content": "aGVsbG8=", "date_modified": 1 });
        entity::store_row(conn, EntityKind::Blob, row.as_object().unwrap()).unwrap();
        log.record_change(conn, &new_change(EntityKind::Blob, "b1", "h")).unwrap();
        log.record_change(conn, &new_change(EntityKind::Blob, "gone", "h")).unwrap();
        let mut tombstone = new_change(EntityKind::Note, "dead", "h");
        tombstone.is_erased = true;
        log.record_change(conn, &tombstone).unwrap();

        let changes = log.changes_since(conn, 0, 10).unwrap();
        let batch = log.project_for_wire(conn, &changes).unwrap();

        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].entity.as_ref().unwrap()["content"], "aGVsbG8=");
        assert!(batch.records[1].entity.is_none());
        assert!(batch.records[1].change.is_erased);
        assert_eq!(batch.last_sequence_id, Some(changes[2].sequence_id));
        assert!(!batch.truncated);
    }

    #[test]
    fn test_outgoing_suppresses_echo_but_advances_past_it() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let log = ChangeLog::new();

        let mut tombstone = new_change(EntityKind::Note, "mine", "h");
        tombstone.is_erased = true;
        log.record_change(conn, &tombstone).unwrap();
        let mut echoed = new_change(EntityKind::Note, "theirs", "h");
        echoed.is_erased = true;
        echoed.origin_instance_id = "inst-peer";
        let last = log.record_change(conn, &echoed).unwrap();

        let out = log.outgoing(conn, 0, Some("inst-peer"), CHANGE_BATCH_SIZE).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].change.entity_id, "mine");
        assert_eq!(out.last_sequence_id, last.sequence_id);
        assert_eq!(out.outstanding_count, 0);

        let nothing = log.outgoing(conn, last.sequence_id, Some("inst-peer"), CHANGE_BATCH_SIZE).unwrap();
        assert!(nothing.records.is_empty());
        assert_eq!(nothing.last_sequence_id, last.sequence_id);
    }

    #[test]
    fn test_outgoing_respects_row_limit() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let log = ChangeLog::new();

        let ids: Vec<String> = (0..5).map(|i| format!("t{i}")).collect();
        for id in &ids {
            let mut c = new_change(EntityKind::Note, id, "h");
            c.is_erased = true;
            log.record_change(conn, &c).unwrap();
        }
        let out = log.outgoing(conn, 0, None, 2).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.outstanding_count, 3);
    }

    #[test]
    fn test_project_for_wire_stops_at_budget() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let log = ChangeLog::with_wire_budget(500);

        let payload = "x".repeat(200);
        for id in ["a", "b", "c"] {
            let row = json!({ "name": id, "value": payload, "is_synced": 1, "date_modified": 1 });
            entity::store_row(conn, EntityKind::Option, row.as_object().unwrap()).unwrap();
            log.record_change(conn, &new_change(EntityKind::Option, id, "h")).unwrap();
        }

        let changes = log.changes_since(conn, 0, 10).unwrap();
        let batch = log.project_for_wire(conn, &changes).unwrap();

        assert_eq!(batch.records.len(), 2);
        assert!(batch.truncated);
        assert_eq!(batch.last_sequence_id, Some(changes[1].sequence_id));
    }
}
