//! Applying incoming changes from a peer.
//!
//! ## Conflict policy
//!
//! When both replicas changed the same entity before reconnecting, every
//! replica must pick the same winner no matter which side applies first:
//!
//! 1. no local ledger row: the incoming change is applied;
//! 2. local tombstone, incoming live row: ignored, erasure is final;
//! 3. incoming tombstone, local live row: applied, the entity is erased here too;
//! 4. otherwise the incoming change wins iff `(changed_at, content_hash)` is
//!    strictly greater than the local pair. Equal pairs are no-ops, which makes
//!    replaying an already applied change harmless.

use crate::core::entity;
use crate::core::entity_change::{ChangeLog, EntityChange, NewChange, WireChange};
use crate::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// What happened to an incoming batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    /// Changes written to the local store.
    pub applied: usize,
    /// Changes that lost against a newer or equal local version.
    pub ignored: usize,
    /// Changes that could not be applied and were logged.
    pub skipped: usize,
}

/// The decision taken for one incoming change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Apply,
    Ignore,
}

/// Decides whether `incoming` replaces the local version `local`.
#[must_use]
pub fn resolve(local: Option<&EntityChange>, incoming: &EntityChange) -> Resolution {
    let Some(local) = local else {
        return Resolution::Apply;
    };
    match (local.is_erased, incoming.is_erased) {
        (true, false) => Resolution::Ignore,
        (false, true) => Resolution::Apply,
        _ => {
            let ours = (local.changed_at, local.content_hash.as_str());
            let theirs = (incoming.changed_at, incoming.content_hash.as_str());
            if theirs > ours {
                Resolution::Apply
            } else {
                Resolution::Ignore
            }
        }
    }
}

/// Applies a batch of incoming changes.
///
/// Meant to run inside one transaction: a database error aborts the whole
/// batch, while a single malformed or incomplete change is logged and
/// skipped. Applied changes keep their origin instance and `changed_at`, and
/// receive a fresh local sequence id.
pub fn apply_changes(conn: &Connection, ledger: &ChangeLog, changes: &[WireChange]) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();

    for wire in changes {
        let incoming = &wire.change;
        let local = ledger.get(conn, incoming.entity_type, &incoming.entity_id)?;
        if resolve(local.as_ref(), incoming) == Resolution::Ignore {
            report.ignored += 1;
            continue;
        }

        if incoming.is_erased {
            erase_locally(conn, ledger, incoming)?;
            report.applied += 1;
            continue;
        }

        let Some(row) = &wire.entity else {
            log::warn!(
                "Incoming change for {} {} carries no entity; skipping",
                incoming.entity_type,
                incoming.entity_id
            );
            report.skipped += 1;
            continue;
        };

        let key_matches = row.get(incoming.entity_type.key_column()).and_then(|v| v.as_str())
            == Some(incoming.entity_id.as_str());
        if !key_matches {
            log::warn!(
                "Incoming {} row does not match entity id {}; skipping",
                incoming.entity_type,
                incoming.entity_id
            );
            report.skipped += 1;
            continue;
        }

        if let Err(e) = entity::store_row(conn, incoming.entity_type, row) {
            if matches!(e, crate::ArborError::InvalidEntity(_)) {
                log::warn!("Skipping {} {}: {e}", incoming.entity_type, incoming.entity_id);
                report.skipped += 1;
                continue;
            }
            return Err(e);
        }

        let hash = entity::content_hash(row);
        if hash != incoming.content_hash {
            log::warn!(
                "Content hash of {} {} differs after apply ({} vs {})",
                incoming.entity_type,
                incoming.entity_id,
                hash,
                incoming.content_hash
            );
        }
        ledger.record_change(
            conn,
            &NewChange {
                entity_type: incoming.entity_type,
                entity_id: &incoming.entity_id,
                content_hash: &hash,
                origin_instance_id: &incoming.origin_instance_id,
                is_synced: incoming.is_synced,
                is_erased: false,
                changed_at: incoming.changed_at,
            },
        )?;
        report.applied += 1;
    }

    log::debug!(
        "Applied {} changes, ignored {}, skipped {}",
        report.applied,
        report.ignored,
        report.skipped
    );
    Ok(report)
}

fn erase_locally(conn: &Connection, ledger: &ChangeLog, incoming: &EntityChange) -> Result<()> {
    // Dependents arrive as their own tombstones.
    entity::delete_row(conn, incoming.entity_type, &incoming.entity_id)?;
    ledger.record_change(
        conn,
        &NewChange {
            entity_type: incoming.entity_type,
            entity_id: &incoming.entity_id,
            content_hash: &incoming.content_hash,
            origin_instance_id: &incoming.origin_instance_id,
            is_synced: incoming.is_synced,
            is_erased: true,
            changed_at: incoming.changed_at,
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::EntityKind;
    use crate::Storage;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn change(id: &str, hash: &str, changed_at: i64, erased: bool) -> EntityChange {
        EntityChange {
            sequence_id: 1,
            entity_type: EntityKind::Attribute,
            entity_id: id.to_string(),
            content_hash: hash.to_string(),
            origin_instance_id: "inst-peer".to_string(),
            is_synced: true,
            is_erased: erased,
            changed_at,
        }
    }

    fn attribute_wire(id: &str, value: &str, changed_at: i64) -> WireChange {
        let row = json!({
            "attribute_id": id,
            "note_id": "n1",
            "attr_type": "label",
            "name": "color",
            "value": value,
            "position": 0,
            "is_inheritable": 0,
            "is_deleted": 0,
            "delete_id": null,
            "date_modified": changed_at,
        });
        let row = row.as_object().cloned().unwrap();
        WireChange {
            change: change(id, &entity::content_hash(&row), changed_at, false),
            entity: Some(row),
        }
    }

    #[test]
    fn test_resolve_prefers_newer_then_larger_hash() {
        let local = change("a", "hash-m", 100, false);
        assert_eq!(resolve(None, &local), Resolution::Apply);
        assert_eq!(resolve(Some(&local), &change("a", "hash-a", 101, false)), Resolution::Apply);
        assert_eq!(resolve(Some(&local), &change("a", "hash-z", 99, false)), Resolution::Ignore);
        assert_eq!(resolve(Some(&local), &change("a", "hash-z", 100, false)), Resolution::Apply);
        assert_eq!(resolve(Some(&local), &change("a", "hash-a", 100, false)), Resolution::Ignore);
        assert_eq!(resolve(Some(&local), &local.clone()), Resolution::Ignore);
    }

    #[test]
    fn test_resolve_is_symmetric_for_concurrent_edits() {
        let x = change("a", "h-x", 100, false);
        let y = change("a", "h-y", 100, false);
        // Exactly one side adopts the other's version.
        let x_takes_y = resolve(Some(&x), &y) == Resolution::Apply;
        let y_takes_x = resolve(Some(&y), &x) == Resolution::Apply;
        assert!(x_takes_y ^ y_takes_x);
    }

    #[test]
    fn test_tombstones_are_final() {
        let tomb = change("a", "h", 100, true);
        assert_eq!(resolve(Some(&tomb), &change("a", "h2", 500, false)), Resolution::Ignore);
        assert_eq!(resolve(Some(&change("a", "h2", 500, false)), &tomb), Resolution::Apply);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let ledger = ChangeLog::new();
        let batch = vec![attribute_wire("attr1", "red", 100)];

        let first = apply_changes(conn, &ledger, &batch).unwrap();
        assert_eq!(first.applied, 1);
        let after_first = ledger.get(conn, EntityKind::Attribute, "attr1").unwrap().unwrap();

        let second = apply_changes(conn, &ledger, &batch).unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.ignored, 1);
        let after_second = ledger.get(conn, EntityKind::Attribute, "attr1").unwrap().unwrap();
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.origin_instance_id, "inst-peer");
    }

    #[test]
    fn test_apply_incoming_tombstone_erases_row() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let ledger = ChangeLog::new();

        let live = attribute_wire("attr1", "red", 100);
        apply_changes(conn, &ledger, &[live.clone()]).unwrap();

        let tomb = WireChange {
            change: EntityChange {
                is_erased: true,
                changed_at: 50,
                ..live.change.clone()
            },
            entity: None,
        };
        let report = apply_changes(conn, &ledger, &[tomb]).unwrap();
        assert_eq!(report.applied, 1);
        assert!(entity::load_row(conn, EntityKind::Attribute, "attr1").unwrap().is_none());
        let row = ledger.get(conn, EntityKind::Attribute, "attr1").unwrap().unwrap();
        assert!(row.is_erased);
        assert_eq!(row.content_hash, live.change.content_hash);
    }

    #[test]
    fn test_malformed_change_is_skipped_not_fatal() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();
        let conn = storage.connection();
        let ledger = ChangeLog::new();

        let mut missing_entity = attribute_wire("attr1", "red", 100);
        missing_entity.entity = None;
        let mut wrong_key = attribute_wire("attr2", "blue", 100);
        wrong_key.change.entity_id = "attr3".to_string();
        let good = attribute_wire("attr4", "green", 100);

        let report = apply_changes(conn, &ledger, &[missing_entity, wrong_key, good]).unwrap();
        assert_eq!(report, ApplyReport { applied: 1, ignored: 0, skipped: 2 });
    }
}
