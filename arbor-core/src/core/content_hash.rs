//! Sector digests used to detect silent divergence between replicas.
//!
//! Ledger rows are grouped by entity type and sector (first character of the
//! entity id). Each sector is reduced to one digest, so two replicas compare
//! a few dozen hashes per type instead of every row, and a mismatch points at
//! the sector to re-send.

use crate::core::entity::{self, sector_of, EntityKind};
use crate::core::entity_change::{ChangeLog, NewChange};
use crate::Result;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};

/// Sector digests per entity type.
pub type SectorHashes = BTreeMap<EntityKind, BTreeMap<String, String>>;

/// Marker mixed into the digest for tombstones.
const ERASED_MARKER: &str = "|erased";

/// Separates the fields of one ledger row in the digest input.
const FIELD_SEPARATOR: &[u8] = b"\x1f";

/// Terminates one ledger row in the digest input.
const ROW_SEPARATOR: &[u8] = b"\x1e";

/// Computes the digest of every sector of every replicated entity type.
pub fn sector_hashes(conn: &Connection) -> Result<SectorHashes> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, entity_id, content_hash, is_erased FROM entity_changes
         WHERE is_synced = 1
         ORDER BY entity_type, entity_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? != 0,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut hashers: BTreeMap<EntityKind, BTreeMap<String, blake3::Hasher>> = BTreeMap::new();
    for (entity_type, entity_id, content_hash, is_erased) in rows {
        let Ok(kind) = entity_type.parse::<EntityKind>() else {
            log::warn!("Ignoring ledger row with unknown entity type {entity_type}");
            continue;
        };
        let hasher = hashers
            .entry(kind)
            .or_default()
            .entry(sector_of(&entity_id))
            .or_insert_with(blake3::Hasher::new);
        hasher.update(entity_id.as_bytes());
        hasher.update(FIELD_SEPARATOR);
        hasher.update(content_hash.as_bytes());
        if is_erased {
            hasher.update(FIELD_SEPARATOR);
            hasher.update(ERASED_MARKER.as_bytes());
        }
        hasher.update(ROW_SEPARATOR);
    }

    Ok(hashers
        .into_iter()
        .map(|(kind, sectors)| {
            let digests = sectors
                .into_iter()
                .map(|(sector, hasher)| (sector, hasher.finalize().to_hex().to_string()))
                .collect();
            (kind, digests)
        })
        .collect())
}

/// Lists every (type, sector) whose digest differs or exists on one side only.
#[must_use]
pub fn find_mismatches(local: &SectorHashes, remote: &SectorHashes) -> Vec<(EntityKind, String)> {
    let empty = BTreeMap::new();
    let kinds: BTreeSet<&EntityKind> = local.keys().chain(remote.keys()).collect();

    let mut mismatches = Vec::new();
    for kind in kinds {
        let ours = local.get(kind).unwrap_or(&empty);
        let theirs = remote.get(kind).unwrap_or(&empty);
        let sectors: BTreeSet<&String> = ours.keys().chain(theirs.keys()).collect();
        for sector in sectors {
            if ours.get(sector) != theirs.get(sector) {
                mismatches.push((*kind, sector.clone()));
            }
        }
    }
    mismatches
}

/// Re-records every entity of `kind` in `sector` so it is sent again.
///
/// Live rows get their hash recomputed from current content and are attributed
/// to this replica; tombstones keep their frozen hash. `changed_at` is kept so
/// conflict resolution on the peer sees the original mutation time. Rows
/// present in the table but missing from the ledger are added. Returns the
/// number of re-queued entities.
pub fn requeue_sector(
    conn: &Connection,
    ledger: &ChangeLog,
    kind: EntityKind,
    sector: &str,
    instance_id: &str,
    now: i64,
) -> Result<usize> {
    let mut ids: BTreeSet<String> = entity::ids_in_sector(conn, kind, sector)?.into_iter().collect();
    {
        let mut stmt = conn.prepare(
            "SELECT entity_id FROM entity_changes WHERE entity_type = ? AND substr(entity_id, 1, 1) = ?",
        )?;
        let ledger_ids = stmt
            .query_map([kind.as_str(), sector], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids.extend(ledger_ids);
    }

    let mut requeued = 0;
    for entity_id in &ids {
        let existing = ledger.get(conn, kind, entity_id)?;
        match (existing, entity::load_row(conn, kind, entity_id)?) {
            (Some(change), _) if change.is_erased => {
                ledger.record_change(
                    conn,
                    &NewChange {
                        entity_type: kind,
                        entity_id,
                        content_hash: &change.content_hash,
                        origin_instance_id: instance_id,
                        is_synced: change.is_synced,
                        is_erased: true,
                        changed_at: change.changed_at,
                    },
                )?;
            }
            (existing, Some(row)) => {
                let hash = entity::content_hash(&row);
                ledger.record_change(
                    conn,
                    &NewChange {
                        entity_type: kind,
                        entity_id,
                        content_hash: &hash,
                        origin_instance_id: instance_id,
                        is_synced: entity::is_synced(kind, &row),
                        is_erased: false,
                        changed_at: existing.map_or(now, |c| c.changed_at),
                    },
                )?;
            }
            (Some(_), None) => {
                log::warn!("Ledger row for {kind} {entity_id} has no entity and is not erased; leaving it");
                continue;
            }
            (None, None) => continue,
        }
        requeued += 1;
    }

    log::info!("Re-queued {requeued} {kind} entities in sector '{sector}'");
    Ok(requeued)
}
