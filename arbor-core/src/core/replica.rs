//! An open replica database and the mutation API its collaborators use.

use crate::core::apply::{self, ApplyReport};
use crate::core::content_hash::{self, SectorHashes};
use crate::core::entity::{self, EntityKind, EntityRow};
use crate::core::entity_change::{ChangeLog, EntityChange, NewChange, WireChange};
use crate::core::instance::{generate_document_secret, generate_instance_id};
use crate::core::protection::ProtectionKey;
use crate::core::storage::{get_meta, set_meta};
use crate::{ArborError, Result, Storage};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::Path;

const META_INSTANCE_ID: &str = "instance_id";
const META_DOCUMENT_SECRET: &str = "document_secret";
const META_PROTECTION_SALT: &str = "protection_salt";
const META_LAST_PUSHED: &str = "last_pushed_sequence_id";
const META_LAST_PULLED: &str = "last_pulled_sequence_id";
const META_BOOTSTRAP_COMPLETE: &str = "bootstrap_complete";

/// Current time as Unix milliseconds; the unit of every `changed_at`.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One replica of the note database.
///
/// External collaborators (the editor, importers, maintenance jobs) mutate
/// replicated rows through [`put_entity`](Self::put_entity) and
/// [`soft_delete`](Self::soft_delete), which write the row and its ledger entry
/// in one transaction. The sync driver and handler use the watermark and
/// apply methods.
pub struct Replica {
    storage: Storage,
    ledger: ChangeLog,
    instance_id: String,
}

impl Replica {
    /// Creates a new replica database at `path` with a fresh instance id,
    /// document secret and protection salt.
    ///
    /// # Errors
    ///
    /// Returns [`ArborError::Database`] for any SQLite failure.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = Storage::create(&path)?;
        let instance_id = generate_instance_id();
        let salt: [u8; 16] = rand::random();

        let conn = storage.connection();
        set_meta(conn, META_INSTANCE_ID, &instance_id)?;
        set_meta(conn, META_DOCUMENT_SECRET, &generate_document_secret())?;
        set_meta(conn, META_PROTECTION_SALT, &hex::encode(salt))?;
        set_meta(conn, META_LAST_PUSHED, "0")?;
        set_meta(conn, META_LAST_PULLED, "0")?;

        log::info!("Created replica {instance_id}");
        Ok(Self {
            storage,
            ledger: ChangeLog::new(),
            instance_id,
        })
    }

    /// Opens an existing replica database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ArborError::InvalidReplica`] if the file is not a replica or
    /// has no instance id.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = Storage::open(&path)?;
        let instance_id = get_meta(storage.connection(), META_INSTANCE_ID)?
            .ok_or_else(|| ArborError::InvalidReplica("Replica has no instance id".to_string()))?;

        Ok(Self {
            storage,
            ledger: ChangeLog::new(),
            instance_id,
        })
    }

    /// Replaces the change log, e.g. to use a different wire budget.
    #[must_use]
    pub fn with_change_log(mut self, ledger: ChangeLog) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.ledger
    }

    /// Returns the underlying SQLite connection.
    pub fn connection(&self) -> &Connection {
        self.storage.connection()
    }

    /// Secret shared by all replicas of one document; signs sync logins.
    pub fn document_secret(&self) -> Result<String> {
        get_meta(self.connection(), META_DOCUMENT_SECRET)?
            .ok_or_else(|| ArborError::InvalidReplica("Replica has no document secret".to_string()))
    }

    /// Adopts the document secret received with a seed.
    pub fn set_document_secret(&mut self, secret: &str) -> Result<()> {
        set_meta(self.connection(), META_DOCUMENT_SECRET, secret)
    }

    /// Salt for deriving this document's [`ProtectionKey`].
    pub fn protection_salt(&self) -> Result<Vec<u8>> {
        let salt = get_meta(self.connection(), META_PROTECTION_SALT)?
            .ok_or_else(|| ArborError::InvalidReplica("Replica has no protection salt".to_string()))?;
        hex::decode(salt).map_err(|e| ArborError::InvalidReplica(format!("Corrupt protection salt: {e}")))
    }

    /// Adopts the protection salt received with a seed.
    pub fn set_protection_salt(&mut self, salt: &[u8]) -> Result<()> {
        set_meta(self.connection(), META_PROTECTION_SALT, &hex::encode(salt))
    }

    /// Whether a peer has completed a first sync cycle against this replica.
    pub fn is_bootstrap_complete(&self) -> Result<bool> {
        Ok(get_meta(self.connection(), META_BOOTSTRAP_COMPLETE)?.as_deref() == Some("true"))
    }

    pub fn mark_bootstrap_complete(&mut self) -> Result<()> {
        if !self.is_bootstrap_complete()? {
            log::info!("Replica {} finished its first sync cycle", self.instance_id);
            set_meta(self.connection(), META_BOOTSTRAP_COMPLETE, "true")?;
        }
        Ok(())
    }

    // ── Entities ─────────────────────────────────────────────────────────

    /// Fetches a row by kind and id.
    pub fn get_entity(&self, kind: EntityKind, entity_id: &str) -> Result<Option<EntityRow>> {
        entity::load_row(self.connection(), kind, entity_id)
    }

    /// Returns the ledger row of an entity.
    pub fn get_change(&self, kind: EntityKind, entity_id: &str) -> Result<Option<EntityChange>> {
        self.ledger.get(self.connection(), kind, entity_id)
    }

    /// Inserts or replaces a row and records its change in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ArborError::InvalidEntity`] for a malformed row, or
    /// [`ArborError::EntityNotFound`] if the entity has already been erased.
    pub fn put_entity(&mut self, kind: EntityKind, row: EntityRow) -> Result<EntityChange> {
        let entity_id = row
            .get(kind.key_column())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ArborError::InvalidEntity(format!("{kind} row has no {}", kind.key_column())))?;

        let tx = self.storage.connection_mut().transaction()?;
        if let Some(existing) = self.ledger.get(&tx, kind, &entity_id)? {
            if existing.is_erased {
                return Err(ArborError::EntityNotFound(format!("{kind} {entity_id} has been erased")));
            }
        }

        entity::store_row(&tx, kind, &row)?;
        let hash = entity::content_hash(&row);
        let change = self.ledger.record_change(
            &tx,
            &NewChange {
                entity_type: kind,
                entity_id: &entity_id,
                content_hash: &hash,
                origin_instance_id: &self.instance_id,
                is_synced: entity::is_synced(kind, &row),
                is_erased: false,
                changed_at: now_millis(),
            },
        )?;
        tx.commit()?;
        Ok(change)
    }

    /// Marks a row as deleted without removing it; erasure happens later.
    ///
    /// # Errors
    ///
    /// Returns [`ArborError::InvalidEntity`] if `kind` has no soft-delete flag,
    /// or [`ArborError::EntityNotFound`] if the row does not exist.
    pub fn soft_delete(&mut self, kind: EntityKind, entity_id: &str, delete_id: &str) -> Result<EntityChange> {
        if !kind.is_soft_deletable() {
            return Err(ArborError::InvalidEntity(format!("{kind} rows cannot be soft-deleted")));
        }
        let mut row = self
            .get_entity(kind, entity_id)?
            .ok_or_else(|| ArborError::EntityNotFound(format!("{kind} {entity_id}")))?;
        row.insert("is_deleted".to_string(), json!(1));
        row.insert("delete_id".to_string(), json!(delete_id));
        row.insert("date_modified".to_string(), json!(now_millis()));
        self.put_entity(kind, row)
    }

    /// Encrypts `plaintext` and stores it as a blob; the ledger hashes the ciphertext.
    pub fn put_protected_blob(&mut self, blob_id: &str, plaintext: &[u8], key: &ProtectionKey) -> Result<EntityChange> {
        let ciphertext = key.encrypt(plaintext)?;
        let row = json!({
            "blob_id": blob_id,
            "content": BASE64.encode(ciphertext),
            "date_modified": now_millis(),
        });
        let row = row.as_object().cloned().unwrap_or_default();
        self.put_entity(EntityKind::Blob, row)
    }

    /// Reads and decrypts a blob written by [`put_protected_blob`](Self::put_protected_blob).
    pub fn read_protected_blob(&self, blob_id: &str, key: &ProtectionKey) -> Result<Vec<u8>> {
        let ciphertext: Vec<u8> = self.connection().query_row(
            "SELECT content FROM blobs WHERE blob_id = ?",
            [blob_id],
            |row| row.get(0),
        )?;
        key.decrypt(&ciphertext)
    }

    /// Reads an option value.
    pub fn option(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .get_entity(EntityKind::Option, name)?
            .and_then(|row| row.get("value").and_then(Value::as_str).map(str::to_string)))
    }

    /// Writes an option; `synced` decides whether it replicates.
    pub fn set_option(&mut self, name: &str, value: &str, synced: bool) -> Result<EntityChange> {
        let row = json!({
            "name": name,
            "value": value,
            "is_synced": i64::from(synced),
            "date_modified": now_millis(),
        });
        self.put_entity(EntityKind::Option, row.as_object().cloned().unwrap_or_default())
    }

    // ── Replication state ────────────────────────────────────────────────

    fn watermark(&self, key: &str) -> Result<i64> {
        Ok(get_meta(self.connection(), key)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// Highest local sequence id already delivered to the peer.
    pub fn last_pushed(&self) -> Result<i64> {
        self.watermark(META_LAST_PUSHED)
    }

    pub fn set_last_pushed(&mut self, sequence_id: i64) -> Result<()> {
        set_meta(self.connection(), META_LAST_PUSHED, &sequence_id.to_string())
    }

    /// Highest peer sequence id already applied locally.
    pub fn last_pulled(&self) -> Result<i64> {
        self.watermark(META_LAST_PULLED)
    }

    pub fn set_last_pulled(&mut self, sequence_id: i64) -> Result<()> {
        set_meta(self.connection(), META_LAST_PULLED, &sequence_id.to_string())
    }

    /// Highest replicated sequence id in the local ledger.
    pub fn max_sequence_id(&self) -> Result<i64> {
        self.ledger.max_sequence_id(self.connection())
    }

    /// Applies a pulled batch and advances the pull watermark in one transaction.
    pub fn apply_pulled(&mut self, changes: &[WireChange], last_sequence_id: i64) -> Result<ApplyReport> {
        let tx = self.storage.connection_mut().transaction()?;
        let report = apply::apply_changes(&tx, &self.ledger, changes)?;
        set_meta(&tx, META_LAST_PULLED, &last_sequence_id.to_string())?;
        tx.commit()?;
        Ok(report)
    }

    /// Applies a batch pushed by a peer in one transaction.
    pub fn apply_pushed(&mut self, changes: &[WireChange]) -> Result<ApplyReport> {
        let tx = self.storage.connection_mut().transaction()?;
        let report = apply::apply_changes(&tx, &self.ledger, changes)?;
        tx.commit()?;
        Ok(report)
    }

    /// Sector digests of the local ledger.
    pub fn sector_hashes(&self) -> Result<SectorHashes> {
        content_hash::sector_hashes(self.connection())
    }

    /// Re-queues one sector so its entities are sent again.
    pub fn requeue_sector(&mut self, kind: EntityKind, sector: &str) -> Result<usize> {
        let tx = self.storage.connection_mut().transaction()?;
        let count =
            content_hash::requeue_sector(&tx, &self.ledger, kind, sector, &self.instance_id, now_millis())?;
        tx.commit()?;
        Ok(count)
    }

    /// Runs `f` in one transaction together with the change log and instance id.
    pub(crate) fn transact<T>(
        &mut self,
        f: impl FnOnce(&Connection, &ChangeLog, &str) -> Result<T>,
    ) -> Result<T> {
        let tx = self.storage.connection_mut().transaction()?;
        let value = f(&tx, &self.ledger, &self.instance_id)?;
        tx.commit()?;
        Ok(value)
    }
}
