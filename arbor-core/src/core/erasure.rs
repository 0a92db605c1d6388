//! Hard purging of soft-deleted entities.
//!
//! A soft-deleted note stays in its table (with `is_deleted = 1`) until the
//! retention window passes. Erasing it deletes the row together with
//! everything hanging off it:
//!
//! - branches that place it in the tree or place a child under it,
//! - its attributes, revisions and attachments.
//!
//! Every erased row keeps its ledger row as a tombstone (`is_erased`, fresh
//! `changed_at`, unchanged `content_hash`) so the erasure replicates. Blobs
//! nothing references any more are deleted too, but their ledger rows are
//! removed outright: a replica that lacks an unused blob is already
//! consistent.
//!
//! ## Examples
//!
//! ```rust
//! use arbor_core::ErasureReport;
//!
//! let report = ErasureReport { notes: 1, branches: 2, ..Default::default() };
//! let json = serde_json::to_string(&report).unwrap();
//! assert!(json.contains("blobsRemoved"));
//! ```

use crate::core::entity::{self, EntityKind};
use crate::core::entity_change::ChangeLog;
use crate::core::guard::ExclusiveSection;
use crate::core::replica::{now_millis, Replica};
use crate::Result;
use rusqlite::{Connection, Params};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How long soft-deleted entities are kept before they are erased.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Number of rows erased per kind by one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErasureReport {
    pub notes: usize,
    pub branches: usize,
    pub attributes: usize,
    pub revisions: usize,
    pub attachments: usize,
    /// Unused blobs deleted together with their ledger rows.
    pub blobs_removed: usize,
}

impl ErasureReport {
    /// Total number of rows removed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.notes + self.branches + self.attributes + self.revisions + self.attachments + self.blobs_removed
    }
}

/// Erases soft-deleted entities inside the exclusive section.
pub struct Eraser {
    retention: Duration,
    guard: Arc<ExclusiveSection>,
}

impl Eraser {
    /// Creates an eraser with the default seven-day retention window.
    pub fn new(guard: Arc<ExclusiveSection>) -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            guard,
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Erases entities soft-deleted longer ago than the retention window.
    pub fn erase_expired(&self, replica: &mut Replica) -> Result<ErasureReport> {
        let window = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(window);
        self.guard.run(|| erase_deleted_before(replica, cutoff))
    }

    /// Erases every soft-deleted entity regardless of its age.
    pub fn erase_deleted_now(&self, replica: &mut Replica) -> Result<ErasureReport> {
        self.guard.run(|| erase_deleted_before(replica, i64::MAX))
    }

    /// Erases the given notes and their dependents, deleted or not.
    pub fn erase_notes(&self, replica: &mut Replica, note_ids: &[String]) -> Result<ErasureReport> {
        self.guard.run(|| {
            replica.transact(|conn, ledger, instance_id| {
                let mut pass = ErasurePass::new(conn, ledger, instance_id);
                pass.erase_notes(note_ids)?;
                pass.remove_unused_blobs()?;
                Ok(pass.finish())
            })
        })
    }
}

fn erase_deleted_before(replica: &mut Replica, cutoff: i64) -> Result<ErasureReport> {
    replica.transact(|conn, ledger, instance_id| {
        let mut pass = ErasurePass::new(conn, ledger, instance_id);

        let notes = pass.ids(
            "SELECT note_id FROM notes WHERE is_deleted = 1 AND date_modified <= ?",
            [cutoff],
        )?;
        pass.erase_notes(&notes)?;

        for kind in [EntityKind::Branch, EntityKind::Attribute, EntityKind::Attachment] {
            let sql = format!(
                "SELECT {} FROM {} WHERE is_deleted = 1 AND date_modified <= ?",
                kind.key_column(),
                kind.table()
            );
            let ids = pass.ids(&sql, [cutoff])?;
            pass.erase(kind, ids)?;
        }

        pass.remove_unused_blobs()?;
        Ok(pass.finish())
    })
}

struct ErasurePass<'a> {
    conn: &'a Connection,
    ledger: &'a ChangeLog,
    instance_id: &'a str,
    now: i64,
    report: ErasureReport,
}

impl<'a> ErasurePass<'a> {
    fn new(conn: &'a Connection, ledger: &'a ChangeLog, instance_id: &'a str) -> Self {
        Self {
            conn,
            ledger,
            instance_id,
            now: now_millis(),
            report: ErasureReport::default(),
        }
    }

    fn ids<P: Params>(&self, sql: &str, params: P) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Deletes the rows and tombstones their ledger rows.
    fn erase(&mut self, kind: EntityKind, ids: Vec<String>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut deleted = 0;
        for id in &ids {
            if entity::delete_row(self.conn, kind, id)? {
                deleted += 1;
            }
        }
        self.ledger.mark_erased(self.conn, kind, &ids, self.instance_id, self.now)?;

        match kind {
            EntityKind::Note => self.report.notes += deleted,
            EntityKind::Branch => self.report.branches += deleted,
            EntityKind::Attribute => self.report.attributes += deleted,
            EntityKind::Revision => self.report.revisions += deleted,
            EntityKind::Attachment => self.report.attachments += deleted,
            EntityKind::Blob | EntityKind::Option => {}
        }
        Ok(deleted)
    }

    fn erase_notes(&mut self, note_ids: &[String]) -> Result<()> {
        for note_id in note_ids {
            let branches = self.ids(
                "SELECT branch_id FROM branches WHERE note_id = ?1 OR parent_note_id = ?1",
                [note_id],
            )?;
            self.erase(EntityKind::Branch, branches)?;

            let attributes = self.ids("SELECT attribute_id FROM attributes WHERE note_id = ?", [note_id])?;
            self.erase(EntityKind::Attribute, attributes)?;

            let revisions = self.ids("SELECT revision_id FROM revisions WHERE note_id = ?", [note_id])?;
            self.erase(EntityKind::Revision, revisions)?;

            let attachments = self.ids("SELECT attachment_id FROM attachments WHERE owner_id = ?", [note_id])?;
            self.erase(EntityKind::Attachment, attachments)?;

            self.erase(EntityKind::Note, vec![note_id.clone()])?;
        }
        Ok(())
    }

    fn remove_unused_blobs(&mut self) -> Result<()> {
        let unused = self.ids(
            "SELECT blob_id FROM blobs WHERE blob_id NOT IN (
                 SELECT blob_id FROM notes WHERE blob_id IS NOT NULL
                 UNION SELECT blob_id FROM revisions WHERE blob_id IS NOT NULL
                 UNION SELECT blob_id FROM attachments WHERE blob_id IS NOT NULL
             )",
            [],
        )?;
        for blob_id in &unused {
            entity::delete_row(self.conn, EntityKind::Blob, blob_id)?;
            self.ledger.remove(self.conn, EntityKind::Blob, blob_id)?;
        }
        self.report.blobs_removed += unused.len();
        Ok(())
    }

    fn finish(self) -> ErasureReport {
        if self.report.total() > 0 {
            log::info!(
                "Erased {} notes, {} branches, {} attributes, {} revisions, {} attachments; removed {} unused blobs",
                self.report.notes,
                self.report.branches,
                self.report.attributes,
                self.report.revisions,
                self.report.attachments,
                self.report.blobs_removed
            );
        }
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::EntityRow;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn row(value: serde_json::Value) -> EntityRow {
        value.as_object().cloned().unwrap()
    }

    fn seed_note(replica: &mut Replica, note_id: &str, blob_id: &str) {
        replica
            .put_entity(EntityKind::Blob, row(json!({ "blob_id": blob_id, "content": "aGk=", "date_modified": 1 })))
            .unwrap();
        replica
            .put_entity(
                EntityKind::Note,
                row(json!({
                    "note_id": note_id, "title": "t", "note_type": "text", "mime": "text/html",
                    "blob_id": blob_id, "is_protected": 0, "is_deleted": 0, "delete_id": null,
                    "date_modified": 1,
                })),
            )
            .unwrap();
        replica
            .put_entity(
                EntityKind::Branch,
                row(json!({
                    "branch_id": format!("br-{note_id}"), "note_id": note_id, "parent_note_id": "root",
                    "position": 0, "prefix": null, "is_expanded": 0, "is_deleted": 0, "delete_id": null,
                    "date_modified": 1,
                })),
            )
            .unwrap();
        replica
            .put_entity(
                EntityKind::Attribute,
                row(json!({
                    "attribute_id": format!("at-{note_id}"), "note_id": note_id, "attr_type": "label",
                    "name": "todo", "value": "", "position": 0, "is_inheritable": 0, "is_deleted": 0,
                    "delete_id": null, "date_modified": 1,
                })),
            )
            .unwrap();
        replica
            .put_entity(
                EntityKind::Revision,
                row(json!({
                    "revision_id": format!("rv-{note_id}"), "note_id": note_id, "title": "t",
                    "blob_id": blob_id, "is_protected": 0, "date_created": 1,
                })),
            )
            .unwrap();
    }

    #[test]
    fn test_erase_notes_cascades_and_keeps_hashes() {
        let temp = NamedTempFile::new().unwrap();
        let mut replica = Replica::create(temp.path()).unwrap();
        seed_note(&mut replica, "n1", "b1");
        let hash_before = replica.get_change(EntityKind::Note, "n1").unwrap().unwrap().content_hash;

        let eraser = Eraser::new(Arc::new(ExclusiveSection::new()));
        let report = eraser.erase_notes(&mut replica, &["n1".to_string()]).unwrap();
        assert_eq!(
            report,
            ErasureReport { notes: 1, branches: 1, attributes: 1, revisions: 1, attachments: 0, blobs_removed: 1 }
        );

        assert!(replica.get_entity(EntityKind::Note, "n1").unwrap().is_none());
        let tomb = replica.get_change(EntityKind::Note, "n1").unwrap().unwrap();
        assert!(tomb.is_erased);
        assert_eq!(tomb.content_hash, hash_before);
        for (kind, id) in [
            (EntityKind::Branch, "br-n1"),
            (EntityKind::Attribute, "at-n1"),
            (EntityKind::Revision, "rv-n1"),
        ] {
            assert!(replica.get_change(kind, id).unwrap().unwrap().is_erased);
        }

        // Unused blobs leave no tombstone behind.
        assert!(replica.get_entity(EntityKind::Blob, "b1").unwrap().is_none());
        assert!(replica.get_change(EntityKind::Blob, "b1").unwrap().is_none());
    }

    #[test]
    fn test_retention_window_is_respected() {
        let temp = NamedTempFile::new().unwrap();
        let mut replica = Replica::create(temp.path()).unwrap();
        seed_note(&mut replica, "n1", "b1");
        replica.soft_delete(EntityKind::Note, "n1", "del-1").unwrap();

        let eraser = Eraser::new(Arc::new(ExclusiveSection::new()));
        assert_eq!(eraser.retention(), DEFAULT_RETENTION);
        assert_eq!(eraser.erase_expired(&mut replica).unwrap(), ErasureReport::default());
        assert!(replica.get_entity(EntityKind::Note, "n1").unwrap().is_some());

        let report = eraser.erase_deleted_now(&mut replica).unwrap();
        assert_eq!(report.notes, 1);
        assert!(replica.get_entity(EntityKind::Note, "n1").unwrap().is_none());
    }

    #[test]
    fn test_zero_retention_erases_deleted_attributes_only() {
        let temp = NamedTempFile::new().unwrap();
        let mut replica = Replica::create(temp.path()).unwrap();
        seed_note(&mut replica, "n1", "b1");
        replica.soft_delete(EntityKind::Attribute, "at-n1", "del-2").unwrap();

        let eraser = Eraser::new(Arc::new(ExclusiveSection::new())).with_retention(Duration::ZERO);
        let report = eraser.erase_expired(&mut replica).unwrap();
        assert_eq!(report, ErasureReport { attributes: 1, ..Default::default() });
        assert!(replica.get_entity(EntityKind::Note, "n1").unwrap().is_some());
        assert!(replica.get_entity(EntityKind::Blob, "b1").unwrap().is_some());
    }

    #[test]
    fn test_erased_entity_cannot_be_rewritten() {
        let temp = NamedTempFile::new().unwrap();
        let mut replica = Replica::create(temp.path()).unwrap();
        seed_note(&mut replica, "n1", "b1");
        Eraser::new(Arc::new(ExclusiveSection::new()))
            .erase_notes(&mut replica, &["n1".to_string()])
            .unwrap();

        let revived = row(json!({
            "note_id": "n1", "title": "again", "note_type": "text", "mime": "text/html",
            "blob_id": null, "is_protected": 0, "is_deleted": 0, "delete_id": null, "date_modified": 2,
        }));
        assert!(replica.put_entity(EntityKind::Note, revived).is_err());
    }
}
