//! Durable record persistence backed by `SQLite`.
//!
//! The `judgments` table holds one row per record, including the anchor
//! metadata: the anchor type, an optional backend reference, the opaque proof
//! blob, and the processed-at timestamp that is set exactly once when the
//! anchor reaches its terminal confirmed state. The idempotency key column is
//! nullable with a UNIQUE constraint, so any number of keyless records coexist
//! while a present key is globally unique; the constraint is what serializes
//! concurrent create races on the same key.
//!
//! Blocking `SQLite` work called from async context goes through
//! `tokio::task::spawn_blocking` wrappers.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use judgment_core::record::{AnchorType, Record, rfc3339};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

/// Record table schema.
const RECORD_SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS judgments (
        id TEXT PRIMARY KEY,
        entity TEXT NOT NULL,
        action TEXT NOT NULL,
        scope TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        recorded_at TEXT NOT NULL,
        anchor_type TEXT NOT NULL,
        anchor_reference TEXT,
        anchor_proof BLOB,
        anchor_processed_at TEXT,
        idempotency_key TEXT UNIQUE
    );

    CREATE INDEX IF NOT EXISTS idx_judgments_entity_recorded
        ON judgments(entity, recorded_at);

    CREATE INDEX IF NOT EXISTS idx_judgments_pending_upgrade
        ON judgments(anchor_processed_at)
        WHERE anchor_proof IS NOT NULL AND anchor_processed_at IS NULL;
";

/// Errors from the record store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Another record already carries this idempotency key. The create path
    /// handles this by falling back to lookup-and-replay.
    #[error("idempotency key already in use: {key}")]
    IdempotencyConflict {
        /// The conflicting key.
        key: String,
    },

    /// A stored row could not be decoded back into a record.
    #[error("corrupt record row {id}: {message}")]
    CorruptRow {
        /// Record id of the undecodable row.
        id: String,
        /// What failed to decode.
        message: String,
    },

    /// Underlying database failure.
    #[error("record store database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// A record awaiting proof confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpgrade {
    /// Record id.
    pub id: String,
    /// The pending proof blob.
    pub proof: Vec<u8>,
}

/// `SQLite`-backed record store.
#[derive(Clone)]
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl RecordStore {
    /// Creates the store and initializes its schema.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self, StoreError> {
        {
            let guard = lock(&conn)?;
            guard.execute_batch(RECORD_SCHEMA_SQL)?;
        }
        Ok(Self { conn })
    }

    /// Inserts a freshly created record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IdempotencyConflict`] when the record carries an
    /// idempotency key that another row already holds, or
    /// [`StoreError::Database`] on any other failure.
    pub fn insert_record(&self, record: &Record) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        insert_record_tx(&conn, record)
    }

    /// Fetches a record by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub fn get(&self, id: &str) -> Result<Option<Record>, StoreError> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM judgments WHERE id = ?1"),
            params![id],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
        .and_then(decode_optional)
    }

    /// Fetches the record carrying an idempotency key, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM judgments WHERE idempotency_key = ?1"),
            params![key],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
        .and_then(decode_optional)
    }

    /// Lists records for one entity, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub fn list_by_entity(
        &self,
        entity: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Record>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM judgments WHERE entity = ?1 \
             ORDER BY recorded_at DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![entity, limit, offset], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Selects records whose anchor is upgradeable: a proof is present and
    /// the anchor has not reached its terminal confirmed state.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn pending_upgrades(&self, limit: u32) -> Result<Vec<PendingUpgrade>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, anchor_proof FROM judgments \
             WHERE anchor_proof IS NOT NULL AND anchor_processed_at IS NULL \
             ORDER BY recorded_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(PendingUpgrade {
                id: row.get(0)?,
                proof: row.get(1)?,
            })
        })?;
        let mut pending = Vec::new();
        for row in rows {
            pending.push(row?);
        }
        Ok(pending)
    }

    /// Persists an upgraded proof and marks the anchor terminally processed.
    ///
    /// The `anchor_processed_at IS NULL` guard makes this transition
    /// exactly-once: a record already processed is never touched again.
    /// Returns whether a row was updated.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn apply_upgraded_proof(
        &self,
        id: &str,
        proof: &[u8],
        processed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = lock(&self.conn)?;
        let updated = conn.execute(
            "UPDATE judgments SET anchor_proof = ?1, anchor_processed_at = ?2 \
             WHERE id = ?3 AND anchor_processed_at IS NULL",
            params![proof, rfc3339(processed_at), id],
        )?;
        Ok(updated > 0)
    }

    /// Async wrapper around [`Self::find_by_idempotency_key`].
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn find_by_idempotency_key_async(
        &self,
        key: &str,
    ) -> Result<Option<Record>, StoreError> {
        let store = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.find_by_idempotency_key(&key))
            .await
            .map_err(|e| StoreError::Database(format!("task join failed: {e}")))?
    }

    /// Async wrapper around [`Self::get`].
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn get_async(&self, id: &str) -> Result<Option<Record>, StoreError> {
        let store = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || store.get(&id))
            .await
            .map_err(|e| StoreError::Database(format!("task join failed: {e}")))?
    }

    /// Async wrapper around [`Self::pending_upgrades`].
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn pending_upgrades_async(
        &self,
        limit: u32,
    ) -> Result<Vec<PendingUpgrade>, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.pending_upgrades(limit))
            .await
            .map_err(|e| StoreError::Database(format!("task join failed: {e}")))?
    }

    /// Async wrapper around [`Self::apply_upgraded_proof`].
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn apply_upgraded_proof_async(
        &self,
        id: &str,
        proof: Vec<u8>,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let store = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || store.apply_upgraded_proof(&id, &proof, processed_at))
            .await
            .map_err(|e| StoreError::Database(format!("task join failed: {e}")))?
    }

    /// The shared connection, for operations that span store and ledger in a
    /// single transaction.
    #[must_use]
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

const RECORD_COLUMNS: &str = "id, entity, action, scope, timestamp, recorded_at, \
     anchor_type, anchor_reference, anchor_proof, anchor_processed_at, idempotency_key";

/// Inserts a record using an already-held connection, so the create path can
/// combine the insert with ledger effects in one transaction.
pub(crate) fn insert_record_tx(conn: &Connection, record: &Record) -> Result<(), StoreError> {
    let result = conn.execute(
        "INSERT INTO judgments (
            id, entity, action, scope, timestamp, recorded_at,
            anchor_type, anchor_reference, anchor_proof, anchor_processed_at,
            idempotency_key
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.id,
            record.entity,
            record.action,
            record.scope.to_string(),
            rfc3339(record.timestamp),
            rfc3339(record.recorded_at),
            record.anchor_type.as_str(),
            record.anchor_reference,
            record.anchor_proof,
            record.anchor_processed_at.map(rfc3339),
            record.idempotency_key,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, ref message))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && message
                    .as_deref()
                    .is_some_and(|m| m.contains("idempotency_key")) =>
        {
            Err(StoreError::IdempotencyConflict {
                key: record.idempotency_key.clone().unwrap_or_default(),
            })
        },
        Err(e) => Err(e.into()),
    }
}

type DecodedRecord = Result<Record, StoreError>;

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecodedRecord> {
    let id: String = row.get(0)?;
    let entity: String = row.get(1)?;
    let action: String = row.get(2)?;
    let scope_text: String = row.get(3)?;
    let timestamp: String = row.get(4)?;
    let recorded_at: String = row.get(5)?;
    let anchor_type: String = row.get(6)?;
    let anchor_reference: Option<String> = row.get(7)?;
    let anchor_proof: Option<Vec<u8>> = row.get(8)?;
    let anchor_processed_at: Option<String> = row.get(9)?;
    let idempotency_key: Option<String> = row.get(10)?;

    Ok(decode_record(
        id,
        entity,
        action,
        &scope_text,
        &timestamp,
        &recorded_at,
        &anchor_type,
        anchor_reference,
        anchor_proof,
        anchor_processed_at.as_deref(),
        idempotency_key,
    ))
}

#[allow(clippy::too_many_arguments)]
fn decode_record(
    id: String,
    entity: String,
    action: String,
    scope_text: &str,
    timestamp: &str,
    recorded_at: &str,
    anchor_type: &str,
    anchor_reference: Option<String>,
    anchor_proof: Option<Vec<u8>>,
    anchor_processed_at: Option<&str>,
    idempotency_key: Option<String>,
) -> DecodedRecord {
    let corrupt = |message: String| StoreError::CorruptRow {
        id: id.clone(),
        message,
    };

    let scope = serde_json::from_str(scope_text)
        .map_err(|e| corrupt(format!("scope is not valid JSON: {e}")))?;
    let timestamp = parse_datetime(timestamp)
        .map_err(|e| corrupt(format!("timestamp: {e}")))?;
    let recorded_at = parse_datetime(recorded_at)
        .map_err(|e| corrupt(format!("recorded_at: {e}")))?;
    let anchor_type = AnchorType::parse(anchor_type)
        .ok_or_else(|| corrupt(format!("unknown anchor type tag '{anchor_type}'")))?;
    let anchor_processed_at = anchor_processed_at
        .map(parse_datetime)
        .transpose()
        .map_err(|e| corrupt(format!("anchor_processed_at: {e}")))?;

    Ok(Record {
        id,
        entity,
        action,
        scope,
        timestamp,
        recorded_at,
        anchor_type,
        anchor_reference,
        anchor_proof,
        anchor_processed_at,
        idempotency_key,
    })
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn decode_optional(row: Option<DecodedRecord>) -> Result<Option<Record>, StoreError> {
    row.transpose()
}

pub(crate) fn lock(
    conn: &Arc<Mutex<Connection>>,
) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Database("connection lock poisoned".to_string()))
}
