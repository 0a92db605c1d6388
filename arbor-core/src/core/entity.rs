//! Replicated entity kinds and generic row access.
//!
//! The replication core does not interpret notes, branches or attributes. It
//! moves whole rows between replicas: a row is loaded as a JSON object keyed by
//! column name, hashed, shipped, and written back verbatim on the other side.
//! Binary columns travel as base64 text.

use crate::{ArborError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A serialised entity row: column name to value.
pub type EntityRow = Map<String, Value>;

/// Number of hex characters kept from an entity content hash.
const CONTENT_HASH_LENGTH: usize = 20;

/// The kinds of rows that take part in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Note,
    Branch,
    Attribute,
    Revision,
    Attachment,
    Blob,
    /// A row of the `options` table; only options flagged `is_synced` replicate.
    Option,
}

impl EntityKind {
    /// Every kind, in the order sector hashes are reported.
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Note,
        EntityKind::Branch,
        EntityKind::Attribute,
        EntityKind::Revision,
        EntityKind::Attachment,
        EntityKind::Blob,
        EntityKind::Option,
    ];

    /// Name stored in `entity_changes.entity_type` and used on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Branch => "branch",
            Self::Attribute => "attribute",
            Self::Revision => "revision",
            Self::Attachment => "attachment",
            Self::Blob => "blob",
            Self::Option => "option",
        }
    }

    /// Backing table.
    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::Note => "notes",
            Self::Branch => "branches",
            Self::Attribute => "attributes",
            Self::Revision => "revisions",
            Self::Attachment => "attachments",
            Self::Blob => "blobs",
            Self::Option => "options",
        }
    }

    /// Primary key column of the backing table.
    #[must_use]
    pub fn key_column(self) -> &'static str {
        match self {
            Self::Note => "note_id",
            Self::Branch => "branch_id",
            Self::Attribute => "attribute_id",
            Self::Revision => "revision_id",
            Self::Attachment => "attachment_id",
            Self::Blob => "blob_id",
            Self::Option => "name",
        }
    }

    /// Columns holding raw bytes, base64 encoded on the wire.
    #[must_use]
    pub fn binary_columns(self) -> &'static [&'static str] {
        match self {
            Self::Blob => &["content"],
            _ => &[],
        }
    }

    /// Whether rows of this kind carry an `is_deleted` soft-delete flag.
    #[must_use]
    pub fn is_soft_deletable(self) -> bool {
        matches!(self, Self::Note | Self::Branch | Self::Attribute | Self::Attachment)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ArborError::InvalidEntity(format!("Unknown entity type: {s}")))
    }
}

/// Returns the sector an entity id belongs to: its first character.
#[must_use]
pub fn sector_of(entity_id: &str) -> String {
    entity_id.chars().next().map(String::from).unwrap_or_default()
}

/// Hashes a serialised row.
///
/// `serde_json::Map` is ordered by key, so both replicas hash the same bytes
/// for the same row. Protected content is stored encrypted, so the hash is
/// always computed over ciphertext.
#[must_use]
pub fn content_hash(row: &EntityRow) -> String {
    let bytes = serde_json::to_vec(row).unwrap_or_default();
    let mut hash = blake3::hash(&bytes).to_hex().to_string();
    hash.truncate(CONTENT_HASH_LENGTH);
    hash
}

/// Loads one row as an [`EntityRow`], or `None` if it does not exist.
pub fn load_row(conn: &Connection, kind: EntityKind, entity_id: &str) -> Result<Option<EntityRow>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = ?",
        kind.table(),
        kind.key_column()
    );
    let mut stmt = conn.prepare(&sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let binary = kind.binary_columns();

    let row = stmt
        .query_row([entity_id], |row| {
            let mut map = EntityRow::new();
            for (idx, name) in columns.iter().enumerate() {
                let value = match row.get_ref(idx)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(i) => Value::from(i),
                    ValueRef::Real(f) => Value::from(f),
                    ValueRef::Text(t) => {
                        let text = String::from_utf8_lossy(t).into_owned();
                        if binary.contains(&name.as_str()) {
                            Value::String(BASE64.encode(text.as_bytes()))
                        } else {
                            Value::String(text)
                        }
                    }
                    ValueRef::Blob(b) => Value::String(BASE64.encode(b)),
                };
                map.insert(name.clone(), value);
            }
            Ok(map)
        })
        .optional()?;
    Ok(row)
}

/// Returns the column names of a kind's table.
fn table_columns(conn: &Connection, kind: EntityKind) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?)")?;
    let columns = stmt
        .query_map([kind.table()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Writes a row, replacing any existing row with the same key.
///
/// Every column name is checked against the table definition, so rows coming
/// from a peer cannot address anything outside the entity's own table.
///
/// # Errors
///
/// Returns [`ArborError::InvalidEntity`] if the row lacks its key, names an
/// unknown column, or carries malformed base64 in a binary column.
pub fn store_row(conn: &Connection, kind: EntityKind, row: &EntityRow) -> Result<()> {
    if !matches!(row.get(kind.key_column()), Some(Value::String(_))) {
        return Err(ArborError::InvalidEntity(format!(
            "{} row is missing its key column {}",
            kind,
            kind.key_column()
        )));
    }

    let known = table_columns(conn, kind)?;
    let mut names = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (name, value) in row {
        if !known.iter().any(|c| c == name) {
            return Err(ArborError::InvalidEntity(format!(
                "{} has no column named {}",
                kind.table(),
                name
            )));
        }
        let sql_value = if kind.binary_columns().contains(&name.as_str()) {
            match value {
                Value::Null => SqlValue::Null,
                Value::String(encoded) => SqlValue::Blob(BASE64.decode(encoded).map_err(|e| {
                    ArborError::InvalidEntity(format!("Column {name} is not valid base64: {e}"))
                })?),
                other => {
                    return Err(ArborError::InvalidEntity(format!(
                        "Column {name} must be base64 text, got {other}"
                    )))
                }
            }
        } else {
            json_to_sql(value)
        };
        names.push(name.as_str());
        values.push(sql_value);
    }

    let placeholders = vec!["?"; names.len()].join(", ");
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
        kind.table(),
        names.join(", "),
        placeholders
    );
    conn.execute(&sql, rusqlite::params_from_iter(values))?;
    Ok(())
}

/// Deletes a row; returns whether it existed.
pub fn delete_row(conn: &Connection, kind: EntityKind, entity_id: &str) -> Result<bool> {
    let sql = format!("DELETE FROM {} WHERE {} = ?", kind.table(), kind.key_column());
    Ok(conn.execute(&sql, [entity_id])? > 0)
}

/// Lists the keys of all rows whose key falls into `sector`.
pub fn ids_in_sector(conn: &Connection, kind: EntityKind, sector: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT {key} FROM {table} WHERE substr({key}, 1, 1) = ? ORDER BY {key}",
        key = kind.key_column(),
        table = kind.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([sector], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Whether a row takes part in replication.
///
/// Options decide per row; every other kind always replicates.
#[must_use]
pub fn is_synced(kind: EntityKind, row: &EntityRow) -> bool {
    match kind {
        EntityKind::Option => matches!(row.get("is_synced"), Some(v) if v.as_i64() == Some(1) || v.as_bool() == Some(true)),
        _ => true,
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
