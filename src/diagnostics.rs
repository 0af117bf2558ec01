//! Diagnostics for the sync worker.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Sync health**: queue backlog by operation type, dropped operations,
//!   oldest pending entry, recent failures
//! - **Diagnostics export**: packages the above plus recent log files into
//!   a zip bundle an operator can attach to a support request.
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use crate::db::{self, DbState};
use crate::queue::OperationStore;
use crate::storage;
use serde_json::{json, Value};
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Maximum size per log file in bytes (5 MB).
pub const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Prefix of the daily rolling log files.
pub const LOG_FILE_PREFIX: &str = "resi.log";

const RECENT_FAILURES: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsExportOptions {
    pub include_logs: bool,
    pub redact_sensitive: bool,
}

impl Default for DiagnosticsExportOptions {
    fn default() -> Self {
        Self {
            include_logs: true,
            redact_sensitive: false,
        }
    }
}

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Sync health
// ---------------------------------------------------------------------------

fn dropped_count(db: &DbState) -> i64 {
    match db.conn.lock() {
        Ok(conn) => conn
            .query_row("SELECT COUNT(*) FROM dropped_operations", [], |row| row.get(0))
            .unwrap_or(0),
        Err(_) => 0,
    }
}

/// Pending operations that have failed at least once, most retried first.
fn recent_failures(store: &OperationStore, limit: usize) -> Vec<Value> {
    let mut failing: Vec<_> = store
        .list_all()
        .into_iter()
        .filter(|op| op.last_error.is_some())
        .collect();
    failing.sort_by(|a, b| b.retry_count.cmp(&a.retry_count));
    failing
        .into_iter()
        .take(limit)
        .map(|op| {
            json!({
                "id": op.id,
                "type": op.operation.kind().as_str(),
                "resiNumber": op.operation.resi_number(),
                "retryCount": op.retry_count,
                "lastAttemptAt": op.last_attempt_at.map(|t| t.to_rfc3339()),
                "lastError": op.last_error,
            })
        })
        .collect()
}

/// Queue and database state for the health screen.
pub fn get_sync_health(store: &OperationStore) -> Result<Value, String> {
    let db = store.db();
    let schema_version = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        db::schema_version(&conn)
    }; // lock released here

    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "backendConfigured": storage::is_configured(),
        "pendingOperations": store.count(),
        "pendingByType": store.count_by_kind(),
        "oldestPendingAt": store.oldest_enqueued_at().map(|t| t.to_rfc3339()),
        "droppedOperations": dropped_count(db),
        "recentFailures": recent_failures(store, RECENT_FAILURES),
        "dbSizeBytes": db_size,
    }))
}

// ---------------------------------------------------------------------------
// Diagnostics export (zip bundle)
// ---------------------------------------------------------------------------

/// Collects diagnostics data and writes a zip file to the given directory.
/// Returns the path to the zip file.
pub fn export_diagnostics(store: &OperationStore, output_dir: &Path) -> Result<String, String> {
    export_diagnostics_with_options(store, output_dir, DiagnosticsExportOptions::default())
}

fn write_json_entry<W: std::io::Write + std::io::Seek>(
    zip: &mut zip::ZipWriter<W>,
    name: &str,
    value: &Value,
    options: zip::write::SimpleFileOptions,
) -> Result<(), String> {
    let body = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    zip.start_file(name, options).map_err(|e| e.to_string())?;
    zip.write_all(body.as_bytes()).map_err(|e| e.to_string())
}

pub fn export_diagnostics_with_options(
    store: &OperationStore,
    output_dir: &Path,
    export_options: DiagnosticsExportOptions,
) -> Result<String, String> {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let zip_name = format!("resi-tracker-diagnostics-{timestamp}.zip");
    let zip_path = output_dir.join(&zip_name);

    let file = fs::File::create(&zip_path)
        .map_err(|e| format!("Failed to create diagnostics zip: {e}"))?;
    let mut zip = zip::ZipWriter::new(file);

    let zip_options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    let redact = export_options.redact_sensitive;

    // 1. About info
    let about = redact_value_for_export(get_about_info(), redact);
    write_json_entry(&mut zip, "about.json", &about, zip_options)?;

    // 2. Sync health
    let health = redact_value_for_export(get_sync_health(store)?, redact);
    write_json_entry(&mut zip, "sync_health.json", &health, zip_options)?;

    // 3. Pending queue
    let pending = serde_json::to_value(store.list_all()).map_err(|e| e.to_string())?;
    let pending = redact_value_for_export(pending, redact);
    write_json_entry(&mut zip, "pending_operations.json", &pending, zip_options)?;

    // 4. Dropped operations (last 100)
    let dropped = serde_json::to_value(store.list_dropped(100)).map_err(|e| e.to_string())?;
    let dropped = redact_value_for_export(dropped, redact);
    write_json_entry(&mut zip, "dropped_operations.json", &dropped, zip_options)?;

    // 5. Include log files
    let log_dir = get_log_dir();
    if export_options.include_logs && !redact && log_dir.exists() {
        if let Ok(entries) = fs::read_dir(&log_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(fname) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !fname.starts_with(LOG_FILE_PREFIX) {
                    continue;
                }
                let zip_entry = format!("logs/{fname}");
                if zip.start_file(&zip_entry, zip_options).is_ok() {
                    if let Ok(f) = fs::File::open(&path) {
                        let mut buf = Vec::new();
                        // Cap at 5MB per file to keep zip manageable
                        let _ = f.take(MAX_LOG_SIZE).read_to_end(&mut buf);
                        let _ = zip.write_all(&buf);
                    }
                }
            }
        }
    }

    zip.finish().map_err(|e| e.to_string())?;

    Ok(zip_path.to_string_lossy().to_string())
}

fn redact_value_for_export(value: Value, enabled: bool) -> Value {
    if !enabled {
        return value;
    }
    redact_sensitive_fields(value)
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "anon_key",
        "apikey",
        "api_key",
        "secret",
        "password",
        "token",
        "authorization",
        "lasterror",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Returns the log directory path (same location used by lib.rs).
pub fn get_log_dir() -> PathBuf {
    crate::config::data_dir().join("logs")
}

/// Prune old log files in `log_dir`, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_logs_in(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Sort newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

pub fn prune_old_logs() {
    prune_logs_in(&get_log_dir());
}
