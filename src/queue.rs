//! Durable pending-operation store.
//!
//! Operations are written to `pending_operations` the moment the UI acts and
//! stay there until the sync engine applies them remotely or gives up on
//! them. Every add/update/delete is a single statement under the connection
//! mutex, so per-record changes are atomic; nothing serializes across records.
//!
//! A store that cannot be read (corrupt file, missing table) is reinitialized
//! in place and reported as empty rather than surfacing an error.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::models::{Operation, OperationKind, PendingOperation};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("operation payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("local database lock poisoned")]
    Lock,
    #[error("local database could not be reinitialized: {0}")]
    Reinitialize(String),
}

/// Audit row for an operation removed after exhausting its retries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DroppedOperation {
    pub id: String,
    pub kind: String,
    pub resi_number: String,
    pub payload: serde_json::Value,
    pub enqueued_at: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub dropped_at: String,
}

/// Raw `pending_operations` row before payload decoding.
type PendingRow = (
    String,
    String,
    String,
    u32,
    Option<String>,
    Option<String>,
);
// Fields: (id, payload, enqueued_at, retry_count, last_attempt_at, last_error)

#[derive(Clone)]
pub struct OperationStore {
    db: Arc<DbState>,
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Errors that mean the store itself is unusable rather than one statement failing.
fn is_storage_broken(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            matches!(
                code.code,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase | ErrorCode::CannotOpen
            ) || message
                .as_deref()
                .map(|m| m.contains("no such table"))
                .unwrap_or(false)
        }
        _ => false,
    }
}

impl OperationStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    /// Run `f` against the connection, reinitializing the database once if the
    /// failure indicates the store is broken.
    fn with_recovery<T>(
        &self,
        f: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let first = {
            let conn = self.db.conn.lock().map_err(|_| StoreError::Lock)?;
            f(&conn)
        };
        match first {
            Ok(value) => Ok(value),
            Err(e) if is_storage_broken(&e) => {
                warn!(error = %e, "Operation store unreadable, reinitializing");
                db::reinitialize(&self.db).map_err(StoreError::Reinitialize)?;
                let conn = self.db.conn.lock().map_err(|_| StoreError::Lock)?;
                Ok(f(&conn)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a new operation with `retry_count = 0` and `last_attempt_at = now`.
    pub fn enqueue(&self, operation: Operation) -> Result<PendingOperation, StoreError> {
        let now = Utc::now();
        let pending = PendingOperation {
            id: Uuid::new_v4().to_string(),
            operation,
            enqueued_at: now,
            retry_count: 0,
            last_attempt_at: Some(now),
            last_error: None,
        };
        let payload = serde_json::to_string(&pending.operation)?;
        let kind = pending.operation.kind().as_str();
        let resi = pending.operation.resi_number().to_string();
        let enqueued_at = format_ts(now);

        self.with_recovery(|conn| {
            conn.execute(
                "INSERT INTO pending_operations (
                     id, op_type, resi_number, payload, enqueued_at,
                     retry_count, last_attempt_at, last_error
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?5, NULL)",
                params![pending.id, kind, resi, payload, enqueued_at],
            )
        })?;

        debug!(
            operation_id = %pending.id,
            kind = %kind,
            resi = %resi,
            "Operation enqueued"
        );
        Ok(pending)
    }

    /// Snapshot of every pending operation in enqueue order.
    ///
    /// Never fails: an unreadable store is reinitialized and reported empty,
    /// and rows whose payload no longer decodes are purged.
    pub fn list_all(&self) -> Vec<PendingOperation> {
        let rows = self.with_recovery(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, payload, enqueued_at, retry_count, last_attempt_at, last_error
                 FROM pending_operations
                 ORDER BY rowid ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<PendingRow>>>()?;
            Ok(rows)
        });

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Failed to read pending operations, treating store as empty");
                return Vec::new();
            }
        };

        let mut operations = Vec::with_capacity(rows.len());
        for (id, payload, enqueued_at, retry_count, last_attempt_at, last_error) in rows {
            let operation = match serde_json::from_str::<Operation>(&payload) {
                Ok(op) => op,
                Err(e) => {
                    warn!(operation_id = %id, error = %e, "Purging undecodable pending operation");
                    let _ = self.remove(&id);
                    continue;
                }
            };
            operations.push(PendingOperation {
                id,
                operation,
                enqueued_at: parse_ts(&enqueued_at).unwrap_or_else(Utc::now),
                retry_count,
                last_attempt_at: last_attempt_at.as_deref().and_then(parse_ts),
                last_error,
            });
        }
        operations
    }

    /// Persist retry bookkeeping for an operation that is still pending.
    ///
    /// Returns `false` when the operation no longer exists.
    pub fn update(&self, op: &PendingOperation) -> Result<bool, StoreError> {
        let last_attempt = op.last_attempt_at.map(format_ts);
        let changed = self.with_recovery(|conn| {
            conn.execute(
                "UPDATE pending_operations
                 SET retry_count = ?1,
                     last_attempt_at = ?2,
                     last_error = ?3
                 WHERE id = ?4",
                params![op.retry_count, last_attempt, op.last_error, op.id],
            )
        })?;
        Ok(changed > 0)
    }

    /// Delete an operation. Returns `false` when it was already gone.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self.with_recovery(|conn| {
            conn.execute("DELETE FROM pending_operations WHERE id = ?1", params![id])
        })?;
        Ok(changed > 0)
    }

    /// Remove an exhausted operation and record it in `dropped_operations`.
    pub fn drop_exhausted(&self, op: &PendingOperation) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&op.operation)?;
        let kind = op.operation.kind().as_str();
        let enqueued_at = format_ts(op.enqueued_at);
        let dropped_at = format_ts(Utc::now());

        self.with_recovery(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO dropped_operations (
                     id, op_type, resi_number, payload, enqueued_at,
                     retry_count, last_error, dropped_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    op.id,
                    kind,
                    op.operation.resi_number(),
                    payload,
                    enqueued_at,
                    op.retry_count,
                    op.last_error,
                    dropped_at
                ],
            )?;
            tx.execute(
                "DELETE FROM pending_operations WHERE id = ?1",
                params![op.id],
            )?;
            tx.commit()
        })
    }

    pub fn count(&self) -> usize {
        self.with_recovery(|conn| {
            conn.query_row("SELECT COUNT(*) FROM pending_operations", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n.max(0) as usize)
        .unwrap_or(0)
    }

    /// Pending counts keyed by operation type name.
    pub fn count_by_kind(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = [
            OperationKind::Cancel,
            OperationKind::Confirm,
            OperationKind::ToggleFollowUp,
            OperationKind::Scan,
        ]
        .iter()
        .map(|k| (k.as_str().to_string(), 0))
        .collect();

        let rows = self.with_recovery(|conn| {
            let mut stmt = conn.prepare(
                "SELECT op_type, COUNT(*) FROM pending_operations GROUP BY op_type",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        });
        if let Ok(rows) = rows {
            for (kind, n) in rows {
                counts.insert(kind, n.max(0) as usize);
            }
        }
        counts
    }

    /// Most recently dropped operations, newest first.
    pub fn list_dropped(&self, limit: usize) -> Vec<DroppedOperation> {
        let limit = limit.min(i64::MAX as usize) as i64;
        self.with_recovery(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, op_type, resi_number, payload, enqueued_at,
                        retry_count, last_error, dropped_at
                 FROM dropped_operations
                 ORDER BY dropped_at DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    let payload: String = row.get(3)?;
                    Ok(DroppedOperation {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        resi_number: row.get(2)?,
                        payload: serde_json::from_str(&payload)
                            .unwrap_or(serde_json::Value::String(payload)),
                        enqueued_at: row.get(4)?,
                        retry_count: row.get(5)?,
                        last_error: row.get(6)?,
                        dropped_at: row.get(7)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .unwrap_or_default()
    }

    /// Enqueue time of the oldest pending operation.
    pub fn oldest_enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.with_recovery(|conn| {
            conn.query_row(
                "SELECT MIN(enqueued_at) FROM pending_operations",
                [],
                |row| row.get::<_, Option<String>>(0),
            )
        })
        .ok()
        .flatten()
        .as_deref()
        .and_then(parse_ts)
    }
}
